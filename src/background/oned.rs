use anyhow::{bail, Result};
use std::path::Path;

use super::fit::segmentation_path;
use super::plot;
use super::stats;
use crate::asn::AsnFile;
use crate::config::BackgroundConfig;
use crate::fits_io::{self, Exposure};
use crate::image::{Image, IntImage};

/// Header keyword marking an exposure whose column residuals were removed.
pub const GRIS_BG_KEY: &str = "GRIS-BG";

#[derive(Debug, Clone)]
pub struct OnedOptions {
    /// Width of each column stripe in pixels
    pub nbin: usize,
    /// Re-run even when `GRIS-BG` is already present (unless it is 1)
    pub force: bool,
    /// Write `<root>_flt.residual.png`
    pub savefig: bool,
    /// DQ bit that excludes a pixel from the profile
    pub dq_bit: i32,
    pub iterations: usize,
}

impl Default for OnedOptions {
    fn default() -> Self {
        Self {
            nbin: 8,
            force: false,
            savefig: true,
            dq_bit: 4096,
            iterations: 4,
        }
    }
}

impl OnedOptions {
    /// Options for the refinement pass after a 2-D refit.
    pub fn from_config(cfg: &BackgroundConfig) -> Self {
        Self {
            nbin: cfg.oned_nbin,
            dq_bit: cfg.oned_dq_bit,
            iterations: cfg.oned_iterations,
            ..Self::default()
        }
    }
}

/// Centres of the `width / nbin` column stripes.
pub fn bin_centers(width: usize, nbin: usize) -> Vec<f64> {
    (0..width / nbin)
        .map(|i| (i * nbin) as f64 + nbin as f64 / 2.0)
        .collect()
}

/// Biweight location of the unmasked pixels of every column stripe. Stripes
/// without usable pixels keep their value from `previous`.
pub fn column_profile(
    sci: &Image,
    seg: &IntImage,
    dq: &IntImage,
    nbin: usize,
    dq_bit: i32,
    previous: &[f64],
) -> Vec<f64> {
    let nbins = sci.width / nbin;
    let mut profile = previous.to_vec();
    profile.resize(nbins, 0.0);
    let mut values = Vec::with_capacity(sci.height * nbin);

    for (i, slot) in profile.iter_mut().enumerate() {
        values.clear();
        for (col, row, v) in sci.column_block(i * nbin..(i + 1) * nbin) {
            if seg.get(col, row) == 0 && (dq.get(col, row) & dq_bit) == 0 {
                values.push(v as f64);
            }
        }
        if let Some((location, _)) = stats::biweight(&values) {
            *slot = location;
        }
    }
    profile
}

/// Iteratively measure and subtract the column profile. Returns the profile
/// measured at each iteration.
pub fn residual_iterations(
    sci: &mut Image,
    seg: &IntImage,
    dq: &IntImage,
    options: &OnedOptions,
) -> Result<Vec<Vec<f64>>> {
    if options.nbin == 0 || options.nbin > sci.width {
        bail!(
            "Bin width {} does not fit a {}-pixel wide image",
            options.nbin,
            sci.width
        );
    }
    if seg.shape() != sci.shape() || dq.shape() != sci.shape() {
        bail!("Segmentation and DQ images must match the SCI shape {:?}", sci.shape());
    }

    let centers = bin_centers(sci.width, options.nbin);
    let mut profile = vec![0.0; centers.len()];
    let mut history = Vec::with_capacity(options.iterations);

    for _ in 0..options.iterations {
        profile = column_profile(sci, seg, dq, options.nbin, options.dq_bit, &profile);
        for col in 0..sci.width {
            let value = stats::interp(col as f64, &centers, &profile);
            sci.sub_column(col, value as f32);
        }
        history.push(profile.clone());
    }
    Ok(history)
}

/// Remove column-wise residuals from a background-subtracted grism exposure.
/// Returns `false` when the exposure was skipped.
pub fn oned_background_subtract(dir: &Path, root: &str, options: &OnedOptions) -> Result<bool> {
    let mut exposure = Exposure::open_in(dir, root)?;
    let seg_path = fits_io::find_fits_gz(segmentation_path(dir, root))?;

    if !exposure.is_grism() {
        tracing::info!(
            "{} is not a grism exposure ({})",
            root,
            exposure.filters().join(" ")
        );
        return Ok(false);
    }

    if let Some(flag) = exposure.sci_header.get(GRIS_BG_KEY) {
        if flag.as_i64() == Some(1) || !options.force {
            tracing::info!("Background already subtracted from {}", root);
            return Ok(false);
        }
    }

    let seg = fits_io::read_int_image(&seg_path, 0)?;
    let history = residual_iterations(&mut exposure.sci, &seg, &exposure.dq, options)?;

    if options.savefig {
        let png = dir.join(format!("{}_flt.residual.png", root));
        let centers = bin_centers(exposure.sci.width, options.nbin);
        plot::save_residual_plot(&png, &centers, &history, exposure.sci.width)?;
    }

    exposure.sci_header.set(GRIS_BG_KEY, 1i64);
    exposure.write()?;

    if let Some(last) = history.last() {
        let mean = last.iter().sum::<f64>() / last.len().max(1) as f64;
        tracing::debug!("📉 {}: last residual profile mean {:.5}", root, mean);
    }
    Ok(true)
}

/// Run [`oned_background_subtract`] on every exposure of an association.
/// Returns how many exposures were corrected.
pub fn asn_oned_background_subtract(dir: &Path, asn: &AsnFile, options: &OnedOptions) -> Result<usize> {
    tracing::info!("Background: {}", asn.product);
    let mut corrected = 0;
    for exp in &asn.exposures {
        tracing::info!("   {}", exp);
        if oned_background_subtract(dir, exp, options)? {
            corrected += 1;
        }
    }
    Ok(corrected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits_io::tests::write_test_flt;
    use crate::fits_io::{write_int_image, Header};
    use tempfile::TempDir;

    fn striped(width: usize, height: usize) -> Image {
        Image::from_fn(width, height, |col, _| if col < width / 2 { 0.2 } else { -0.1 })
    }

    #[test]
    fn test_bin_centers() {
        assert_eq!(bin_centers(20, 8), vec![4.0, 12.0]);
        assert_eq!(bin_centers(1014, 26).len(), 39);
    }

    #[test]
    fn test_profile_removes_column_offsets() {
        let (w, h) = (32, 16);
        let mut sci = striped(w, h);
        let seg = IntImage::new(w, h);
        let dq = IntImage::new(w, h);
        let options = OnedOptions {
            nbin: 4,
            ..OnedOptions::default()
        };
        let history = residual_iterations(&mut sci, &seg, &dq, &options).unwrap();
        assert_eq!(history.len(), 4);
        assert!((history[0][0] - 0.2).abs() < 1e-6);
        assert!((history[0][7] + 0.1).abs() < 1e-6);
        // Stripes away from the step are flat after the first pass
        for col in [0, 1, 30, 31] {
            assert!(sci.get(col, 3).abs() < 1e-5, "col {} = {}", col, sci.get(col, 3));
        }
    }

    #[test]
    fn test_masked_pixels_ignored_and_empty_stripe_keeps_value() {
        let (w, h) = (8, 4);
        let mut sci = Image::from_fn(w, h, |_, _| 1.0);
        let mut seg = IntImage::new(w, h);
        let mut dq = IntImage::new(w, h);
        // Bright object in the first stripe is masked
        sci.set(1, 1, 50.0);
        seg.set(1, 1, 3);
        // Second stripe entirely flagged
        for row in 0..h {
            for col in 4..8 {
                dq.set(col, row, 4096 | 16);
            }
        }
        let profile = column_profile(&sci, &seg, &dq, 4, 4096, &[0.0, -7.0]);
        assert_eq!(profile, vec![1.0, -7.0]);
    }

    #[test]
    fn test_skips_direct_images_and_marks_grism() {
        let dir = TempDir::new().unwrap();
        let (w, h) = (16, 8);
        let dq = IntImage::new(w, h);
        write_test_flt(dir.path(), "direct", &striped(w, h), &dq, "F140W");
        write_test_flt(dir.path(), "grism", &striped(w, h), &dq, "G141");
        for root in ["direct", "grism"] {
            write_int_image(
                dir.path().join(format!("{}_flt.seg.fits", root)),
                &IntImage::new(w, h),
                &Header::new(),
            )
            .unwrap();
        }

        let options = OnedOptions {
            nbin: 4,
            savefig: false,
            ..OnedOptions::default()
        };
        assert!(!oned_background_subtract(dir.path(), "direct", &options).unwrap());
        assert!(oned_background_subtract(dir.path(), "grism", &options).unwrap());

        let exp = Exposure::open_in(dir.path(), "grism").unwrap();
        assert_eq!(exp.sci_header.get_i64(GRIS_BG_KEY), Some(1));
        assert!(exp.sci.get(0, 0).abs() < 1e-5);

        // Second call is a no-op, even with force, since GRIS-BG == 1
        let forced = OnedOptions {
            force: true,
            ..options
        };
        assert!(!oned_background_subtract(dir.path(), "grism", &forced).unwrap());
    }

    #[test]
    fn test_missing_segmentation_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (w, h) = (8, 8);
        write_test_flt(dir.path(), "g", &Image::new(w, h), &IntImage::new(w, h), "G102");
        assert!(oned_background_subtract(dir.path(), "g", &OnedOptions::default()).is_err());
    }
}
