use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use std::path::Path;

const WIDTH: u32 = 500;
const HEIGHT: u32 = 300;
const MARGIN: f32 = 40.0;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const RED: Rgb<u8> = Rgb([220, 20, 20]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

/// Mix `color` over a white background with opacity `alpha`.
fn fade(color: Rgb<u8>, alpha: f32) -> Rgb<u8> {
    let a = alpha.clamp(0.0, 1.0);
    let mix = |c: u8| (c as f32 * a + 255.0 * (1.0 - a)).round() as u8;
    Rgb([mix(color[0]), mix(color[1]), mix(color[2])])
}

/// Draw every iteration's residual profile (later ones fainter) and a dashed
/// zero line, then save as PNG.
pub fn save_residual_plot(
    path: &Path,
    centers: &[f64],
    history: &[Vec<f64>],
    image_width: usize,
) -> Result<()> {
    let mut canvas = RgbImage::from_pixel(WIDTH, HEIGHT, WHITE);

    let (mut lo, mut hi) = (0.0f64, 0.0f64);
    for v in history.iter().flatten() {
        if v.is_finite() {
            lo = lo.min(*v);
            hi = hi.max(*v);
        }
    }
    let pad = ((hi - lo) * 0.1).max(1e-3);
    let (lo, hi) = (lo - pad, hi + pad);

    let plot_w = WIDTH as f32 - 2.0 * MARGIN;
    let plot_h = HEIGHT as f32 - 2.0 * MARGIN;
    let x_min = -1.0;
    let x_max = image_width as f64 + 1.0;
    let to_px = |x: f64, y: f64| -> (f32, f32) {
        let px = MARGIN + ((x - x_min) / (x_max - x_min)) as f32 * plot_w;
        let py = MARGIN + ((hi - y) / (hi - lo)) as f32 * plot_h;
        (px, py)
    };

    // Axes box
    let corners = [
        (MARGIN, MARGIN),
        (MARGIN + plot_w, MARGIN),
        (MARGIN + plot_w, MARGIN + plot_h),
        (MARGIN, MARGIN + plot_h),
    ];
    for i in 0..4 {
        draw_line_segment_mut(&mut canvas, corners[i], corners[(i + 1) % 4], BLACK);
    }

    let zero_color = fade(BLACK, 0.6);
    let (x0, y0) = to_px(x_min, 0.0);
    let (x1, _) = to_px(x_max, 0.0);
    let mut x = x0;
    while x < x1 {
        draw_line_segment_mut(&mut canvas, (x, y0), ((x + 6.0).min(x1), y0), zero_color);
        x += 10.0;
    }

    let n = history.len();
    for (it, profile) in history.iter().enumerate() {
        let alpha = if n > 1 {
            1.0 - it as f32 * 0.8 / (n - 1) as f32
        } else {
            1.0
        };
        let color = fade(RED, alpha);
        for (a, b) in centers.iter().zip(profile).zip(centers.iter().zip(profile).skip(1)) {
            draw_line_segment_mut(&mut canvas, to_px(*a.0, *a.1), to_px(*b.0, *b.1), color);
        }
    }

    canvas
        .save(path)
        .with_context(|| format!("Failed to save residual plot {}", path.display()))?;
    tracing::debug!("🖼️  Saved {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fade() {
        assert_eq!(fade(RED, 1.0), RED);
        assert_eq!(fade(RED, 0.0), WHITE);
    }

    #[test]
    fn test_writes_png() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x_flt.residual.png");
        let centers = vec![4.0, 12.0, 20.0];
        let history = vec![vec![0.1, -0.05, 0.02], vec![0.01, 0.0, -0.01]];
        save_residual_plot(&path, &centers, &history, 24).unwrap();

        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (WIDTH, HEIGHT));
        assert!(img.pixels().any(|p| p[0] > 200 && p[1] < 100));
    }
}
