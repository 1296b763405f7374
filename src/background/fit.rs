use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::model::BackgroundModel;
use crate::config::BackgroundConfig;
use crate::fits_io::{self, Exposure, Header};
use crate::image::{Image, IntImage, Mask};

/// Singular values of the normal matrix below `RCOND * max` are dropped,
/// i.e. a relative cutoff of 1e-6 on the design matrix itself.
const RCOND: f64 = 1e-12;

/// Pixel selection for the 2-D fit.
#[derive(Debug, Clone)]
pub struct BackgroundFitter {
    /// DQ values at or above this are masked
    pub dq_max: i32,
    /// Lower bound of the accepted pixel values (exclusive)
    pub min_value: f32,
    /// Upper bound of the accepted pixel values (exclusive)
    pub max_value: f32,
}

impl Default for BackgroundFitter {
    fn default() -> Self {
        Self {
            dq_max: 10,
            min_value: -1.0,
            max_value: 4.0,
        }
    }
}

impl From<&BackgroundConfig> for BackgroundFitter {
    fn from(cfg: &BackgroundConfig) -> Self {
        Self {
            dq_max: cfg.dq_max,
            min_value: cfg.min_value,
            max_value: cfg.max_value,
        }
    }
}

/// Result of a masked least-squares background fit.
#[derive(Debug, Clone)]
pub struct BackgroundFit {
    pub coefficients: Vec<f64>,
    /// Effective rank of the design matrix
    pub rank: usize,
    /// Singular values of the design matrix, descending
    pub singular_values: Vec<f64>,
    /// Pixels that entered the fit
    pub n_good: usize,
    /// RMS of the fit residuals over the good pixels
    pub residual_rms: f64,
}

impl BackgroundFitter {
    /// A pixel is usable when it is outside every object (`seg == 0`), inside
    /// the value window, finite, and its DQ is below `dq_max`.
    pub fn good_pixel_mask(
        &self,
        sci: &Image,
        dq: &IntImage,
        seg: Option<&IntImage>,
    ) -> Result<Mask> {
        if dq.shape() != sci.shape() {
            bail!("DQ shape {:?} != SCI shape {:?}", dq.shape(), sci.shape());
        }
        if let Some(seg) = seg {
            if seg.shape() != sci.shape() {
                bail!(
                    "Segmentation shape {:?} != SCI shape {:?}",
                    seg.shape(),
                    sci.shape()
                );
            }
        }

        let mut mask = Mask::new(sci.width, sci.height, false);
        for i in 0..sci.data.len() {
            let v = sci.data[i];
            let seg_ok = seg.map_or(true, |s| s.data[i] == 0);
            mask.data[i] = seg_ok
                && v.is_finite()
                && v > self.min_value
                && v < self.max_value
                && dq.data[i] < self.dq_max;
        }
        Ok(mask)
    }

    /// Solve for the basis coefficients over the pixels selected by `mask`.
    pub fn fit(&self, model: &BackgroundModel, sci: &Image, mask: &Mask) -> Result<BackgroundFit> {
        if sci.shape() != model.shape() {
            bail!(
                "Image is {}x{} but the background grid is {}x{}",
                sci.width,
                sci.height,
                model.shape().0,
                model.shape().1
            );
        }
        let n = model.nparam();
        let n_good = mask.count();
        if n_good < n {
            bail!(
                "Only {} good pixels for a {}-parameter background fit",
                n_good,
                n
            );
        }

        // Accumulate the normal equations; the full design matrix would be
        // n_good x nparam.
        let mut ata = DMatrix::<f64>::zeros(n, n);
        let mut atb = DVector::<f64>::zeros(n);
        let mut basis = vec![0.0f64; n];
        for row in 0..sci.height {
            for col in 0..sci.width {
                if !mask.get(col, row) {
                    continue;
                }
                model.evaluate_into(col, row, &mut basis);
                let b = sci.get(col, row) as f64;
                for i in 0..n {
                    atb[i] += basis[i] * b;
                    for j in i..n {
                        ata[(i, j)] += basis[i] * basis[j];
                    }
                }
            }
        }
        for i in 0..n {
            for j in 0..i {
                ata[(i, j)] = ata[(j, i)];
            }
        }

        let svd = ata.svd(true, true);
        let max_sv = svd.singular_values.iter().cloned().fold(0.0, f64::max);
        let cutoff = max_sv * RCOND;
        let rank = svd.singular_values.iter().filter(|&&s| s > cutoff).count();
        let solution = svd
            .solve(&atb, cutoff)
            .map_err(|e| anyhow::anyhow!("Least-squares solve failed: {}", e))?;
        let coefficients: Vec<f64> = solution.iter().cloned().collect();

        let mut singular_values: Vec<f64> =
            svd.singular_values.iter().map(|s| s.max(0.0).sqrt()).collect();
        singular_values.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        if rank < n {
            tracing::warn!(
                "⚠️  Background basis is rank deficient ({} of {}), using minimum-norm solution",
                rank,
                n
            );
        }

        let mut sum_sq = 0.0;
        for row in 0..sci.height {
            for col in 0..sci.width {
                if mask.get(col, row) {
                    let r = sci.get(col, row) as f64
                        - model.evaluate(col, row, &coefficients, &mut basis);
                    sum_sq += r * r;
                }
            }
        }
        let residual_rms = (sum_sq / n_good as f64).sqrt();

        Ok(BackgroundFit {
            coefficients,
            rank,
            singular_values,
            n_good,
            residual_rms,
        })
    }
}

impl BackgroundFit {
    /// Reconstruct the model over the full grid.
    pub fn model_image(&self, model: &BackgroundModel) -> Image {
        let (width, height) = model.shape();
        let mut scratch = vec![0.0f64; model.nparam()];
        Image::from_fn(width, height, |col, row| {
            model.evaluate(col, row, &self.coefficients, &mut scratch) as f32
        })
    }

    /// Subtract the model from `sci` in place and return the model image.
    pub fn subtract(&self, model: &BackgroundModel, sci: &mut Image) -> Result<Image> {
        let bg = self.model_image(model);
        sci.sub_assign(&bg)?;
        Ok(bg)
    }
}

/// Format like C's `%{width}.{precision}e` (two-digit signed exponent).
pub fn format_exp(value: f64, precision: usize, width: usize) -> String {
    let s = format!("{:.*e}", precision, value);
    let formatted = match s.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        None => s,
    };
    format!("{:>width$}", formatted, width = width)
}

/// Write one coefficient per line in `%13.5e` format, in the order of
/// [`BackgroundModel::terms`].
///
/// Polynomial terms use `x` for the column (NAXIS1) and `y` for the row
/// (NAXIS2), so a gradient along detector columns lands on the `x**1` line.
pub fn write_polybg(path: &Path, coefficients: &[f64]) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for c in coefficients {
        writeln!(file, "{}", format_exp(*c, 5, 13))
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

/// Options for fitting one exposure.
#[derive(Debug, Clone, Default)]
pub struct FitOptions {
    /// Write the background-subtracted image back to the FLT
    pub overwrite: bool,
    /// Save the model to `<root>_flt.BG.fits`
    pub save_fit: bool,
}

pub fn segmentation_path(dir: &Path, root: &str) -> PathBuf {
    dir.join(format!("{}_flt.seg.fits", root))
}

/// Fit the background of `<dir>/<root>_flt.fits`, using the segmentation
/// image as an object mask when one exists.
pub fn fit_exposure(
    dir: &Path,
    root: &str,
    model: &BackgroundModel,
    fitter: &BackgroundFitter,
    options: &FitOptions,
) -> Result<BackgroundFit> {
    let mut exposure = Exposure::open_in(dir, root)?;

    let seg = match fits_io::find_optional_fits(segmentation_path(dir, root))? {
        Some(path) => {
            tracing::info!("Segmentation image: {}", path.display());
            Some(fits_io::read_int_image(&path, 0)?)
        }
        None => None,
    };

    let mask = fitter.good_pixel_mask(&exposure.sci, &exposure.dq, seg.as_ref())?;
    let fit = fitter
        .fit(model, &exposure.sci, &mask)
        .with_context(|| format!("Background fit failed for {}", root))?;

    tracing::info!(
        "📐 {}: {} parameters, rank {}, {} good pixels, rms {:.4}",
        root,
        fit.coefficients.len(),
        fit.rank,
        fit.n_good,
        fit.residual_rms
    );
    for (term, c) in model.terms().iter().zip(&fit.coefficients) {
        tracing::debug!("   {:>16} = {:.5e}", term.to_string(), c);
    }

    write_polybg(&dir.join(format!("{}_flt.polybg", root)), &fit.coefficients)?;

    let bg = fit.subtract(model, &mut exposure.sci)?;

    if options.save_fit {
        let out = dir.join(format!("{}_flt.BG.fits", root));
        fits_io::write_image(&out, &bg, &Header::new())?;
    }

    if options.overwrite {
        tracing::info!("Overwrite: {}", root);
        exposure.write()?;
    }

    Ok(fit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::model::BackgroundModel;

    fn plane(width: usize, height: usize, f: impl Fn(f64, f64) -> f64) -> Image {
        Image::from_fn(width, height, |c, r| {
            let x = (c as f64 - width as f64 / 2.0) / width as f64;
            let y = (r as f64 - height as f64 / 2.0) / height as f64;
            f(x, y) as f32
        })
    }

    #[test]
    fn test_good_pixel_mask() {
        let mut sci = Image::from_fn(4, 1, |_, _| 0.5);
        sci.set(1, 0, 5.0);
        sci.set(2, 0, f32::NAN);
        let mut dq = IntImage::new(4, 1);
        dq.set(3, 0, 10);
        let fitter = BackgroundFitter::default();
        let mask = fitter.good_pixel_mask(&sci, &dq, None).unwrap();
        assert_eq!(mask.data, vec![true, false, false, false]);

        let mut seg = IntImage::new(4, 1);
        seg.set(0, 0, 7);
        let mask = fitter.good_pixel_mask(&sci, &dq, Some(&seg)).unwrap();
        assert_eq!(mask.count(), 0);
    }

    #[test]
    fn test_recovers_quadratic_surface() {
        let (w, h) = (64, 48);
        let truth = [0.8, 0.3, -0.2, 0.5, 0.1, -0.4];
        let sci = plane(w, h, |x, y| {
            truth[0] + truth[1] * x + truth[2] * y + truth[3] * x * y + truth[4] * x * x
                + truth[5] * y * y
        });
        let model = BackgroundModel::new(2, w, h, None, vec![]).unwrap();
        let fitter = BackgroundFitter::default();
        let mask = fitter
            .good_pixel_mask(&sci, &IntImage::new(w, h), None)
            .unwrap();
        let fit = fitter.fit(&model, &sci, &mask).unwrap();

        assert_eq!(fit.rank, 6);
        for (got, want) in fit.coefficients.iter().zip(truth) {
            assert!((got - want).abs() < 1e-4, "got {} want {}", got, want);
        }
        assert!(fit.residual_rms < 1e-5);

        let mut corrected = sci.clone();
        fit.subtract(&model, &mut corrected).unwrap();
        assert!(corrected.data.iter().all(|v| v.abs() < 1e-4));
    }

    #[test]
    fn test_masked_objects_do_not_bias_fit() {
        let (w, h) = (40, 40);
        let mut sci = Image::from_fn(w, h, |_, _| 1.2);
        let mut seg = IntImage::new(w, h);
        for r in 10..20 {
            for c in 10..20 {
                sci.set(c, r, 3.5);
                seg.set(c, r, 1);
            }
        }
        let model = BackgroundModel::new(0, w, h, None, vec![]).unwrap();
        let fitter = BackgroundFitter::default();
        let mask = fitter
            .good_pixel_mask(&sci, &IntImage::new(w, h), Some(&seg))
            .unwrap();
        let fit = fitter.fit(&model, &sci, &mask).unwrap();
        assert!((fit.coefficients[0] - 1.2).abs() < 1e-6);
        assert_eq!(fit.n_good, w * h - 100);
    }

    #[test]
    fn test_reference_image_scaling() {
        let (w, h) = (32, 32);
        let sky = Image::from_fn(w, h, |c, r| 1.0 + 0.01 * ((c * 7 + r * 3) % 11) as f32);
        let sci = sky.map(|v| 0.7 * v + 0.05);
        let model = BackgroundModel::new(0, w, h, None, vec![("sky".into(), sky)]).unwrap();
        let fitter = BackgroundFitter::default();
        let mask = fitter
            .good_pixel_mask(&sci, &IntImage::new(w, h), None)
            .unwrap();
        let fit = fitter.fit(&model, &sci, &mask).unwrap();
        assert!((fit.coefficients[0] - 0.7).abs() < 1e-3);
        assert!((fit.coefficients[1] - 0.05).abs() < 1e-3);
    }

    #[test]
    fn test_rank_deficient_basis_still_solves() {
        let (w, h) = (16, 16);
        let flat = Image::from_fn(w, h, |_, _| 1.0);
        let sci = Image::from_fn(w, h, |_, _| 2.0);
        // A constant reference image duplicates the constant term
        let model = BackgroundModel::new(0, w, h, None, vec![("flat".into(), flat)]).unwrap();
        let fitter = BackgroundFitter::default();
        let mask = fitter
            .good_pixel_mask(&sci, &IntImage::new(w, h), None)
            .unwrap();
        let fit = fitter.fit(&model, &sci, &mask).unwrap();
        assert_eq!(fit.rank, 1);
        let total: f64 = fit.coefficients.iter().sum();
        assert!((total - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_too_few_pixels() {
        let sci = Image::from_fn(8, 8, |_, _| 9.0);
        let model = BackgroundModel::new(1, 8, 8, None, vec![]).unwrap();
        let fitter = BackgroundFitter::default();
        let mask = fitter
            .good_pixel_mask(&sci, &IntImage::new(8, 8), None)
            .unwrap();
        let err = fitter.fit(&model, &sci, &mask).unwrap_err();
        assert!(err.to_string().contains("Only 0 good pixels"));
    }

    #[test]
    fn test_grid_mismatch() {
        let sci = Image::new(8, 8);
        let model = BackgroundModel::new(0, 10, 10, None, vec![]).unwrap();
        let mask = Mask::new(8, 8, true);
        assert!(BackgroundFitter::default().fit(&model, &sci, &mask).is_err());
    }

    #[test]
    fn test_polybg_puts_column_gradient_on_x_line() {
        let dir = tempfile::TempDir::new().unwrap();
        let (w, h) = (32, 24);
        let sci = plane(w, h, |x, _| 0.5 + 0.25 * x);
        let model = BackgroundModel::new(1, w, h, None, vec![]).unwrap();
        let fitter = BackgroundFitter::default();
        let mask = fitter
            .good_pixel_mask(&sci, &IntImage::new(w, h), None)
            .unwrap();
        let fit = fitter.fit(&model, &sci, &mask).unwrap();
        assert_eq!(model.terms()[1].to_string(), "x**1");

        let path = dir.path().join("a_flt.polybg");
        write_polybg(&path, &fit.coefficients).unwrap();
        let lines: Vec<f64> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| l.trim().parse().unwrap())
            .collect();
        assert!((lines[0] - 0.5).abs() < 1e-4);
        assert!((lines[1] - 0.25).abs() < 1e-4);
        assert!(lines[2].abs() < 1e-4);
    }

    #[test]
    fn test_format_exp_matches_c() {
        assert_eq!(format_exp(0.0123456, 5, 13), "  1.23456e-02");
        assert_eq!(format_exp(-1234.5, 5, 13), " -1.23450e+03");
        assert_eq!(format_exp(0.0, 5, 13), "  0.00000e+00");
    }
}
