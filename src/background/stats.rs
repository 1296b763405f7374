//! Robust statistics used by the background correctors.

/// Median of finite values. `None` for an empty input.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some(0.5 * (sorted[mid - 1] + sorted[mid]))
    }
}

/// Median absolute deviation about `center`.
pub fn mad(values: &[f64], center: f64) -> Option<f64> {
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations)
}

/// Tukey biweight location and scale (Beers, Flynn & Gebhardt 1990).
///
/// Location uses tuning constant 6, scale uses 9, both about the median and
/// MAD. A zero MAD returns `(median, 0)`.
pub fn biweight(values: &[f64]) -> Option<(f64, f64)> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let m = median(&finite)?;
    let mad = mad(&finite, m)?;
    if mad <= 0.0 {
        return Some((m, 0.0));
    }

    let c = 6.0;
    let (mut top, mut bot) = (0.0, 0.0);
    for &x in &finite {
        let u = (x - m) / (c * mad);
        if u.abs() < 1.0 {
            let w = (1.0 - u * u).powi(2);
            top += (x - m) * w;
            bot += w;
        }
    }
    let location = if bot > 0.0 { m + top / bot } else { m };

    let c = 9.0;
    let n = finite.len() as f64;
    let (mut top, mut bot) = (0.0, 0.0);
    for &x in &finite {
        let u = (x - m) / (c * mad);
        if u.abs() < 1.0 {
            let u2 = u * u;
            top += (x - m).powi(2) * (1.0 - u2).powi(4);
            bot += (1.0 - u2) * (1.0 - 5.0 * u2);
        }
    }
    let scale = if bot.abs() > 0.0 {
        (n * top).sqrt() / bot.abs()
    } else {
        0.0
    };

    Some((location, scale))
}

/// Piecewise-linear interpolation of (`xp`, `fp`) at `x`. `xp` must be
/// increasing; values outside the range clamp to the end points.
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    debug_assert_eq!(xp.len(), fp.len());
    match xp.len() {
        0 => return 0.0,
        1 => return fp[0],
        _ => {}
    }
    if x <= xp[0] {
        return fp[0];
    }
    let last = xp.len() - 1;
    if x >= xp[last] {
        return fp[last];
    }
    // First knot strictly greater than x
    let hi = xp.partition_point(|&v| v <= x);
    let lo = hi - 1;
    let span = xp[hi] - xp[lo];
    if span == 0.0 {
        return fp[lo];
    }
    let t = (x - xp[lo]) / span;
    fp[lo] + t * (fp[hi] - fp[lo])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[f64::NAN, 1.0]), Some(1.0));
    }

    #[test]
    fn test_biweight_resists_outliers() {
        let mut values: Vec<f64> = (0..200).map(|i| 1.0 + 0.01 * ((i % 21) as f64 - 10.0)).collect();
        values.extend([500.0, -300.0, 1e4]);
        let (loc, scale) = biweight(&values).unwrap();
        assert!((loc - 1.0).abs() < 0.01, "location {}", loc);
        assert!(scale > 0.0 && scale < 0.1, "scale {}", scale);
    }

    #[test]
    fn test_biweight_constant_input() {
        assert_eq!(biweight(&[2.0, 2.0, 2.0]), Some((2.0, 0.0)));
        assert_eq!(biweight(&[]), None);
    }

    #[test]
    fn test_interp_clamps_and_interpolates() {
        let xp = [4.0, 12.0, 20.0];
        let fp = [1.0, 3.0, -1.0];
        assert_eq!(interp(0.0, &xp, &fp), 1.0);
        assert_eq!(interp(25.0, &xp, &fp), -1.0);
        assert_eq!(interp(8.0, &xp, &fp), 2.0);
        assert_eq!(interp(12.0, &xp, &fp), 3.0);
        assert_eq!(interp(16.0, &xp, &fp), 1.0);
    }
}
