//! Pixel-flat bookkeeping: find the newest flat for a filter and re-flatten
//! exposures calibrated with an older one.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::asn::AsnFile;
use crate::files;
use crate::fits_io::{self, Exposure, FitsFile};

/// Border trimmed from reference flats to match the FLT science area.
const FLAT_BORDER: usize = 5;

/// Most recently modified `*pfl.fits` in `iref` whose FILTER matches.
pub fn find_best_flat(iref: &Path, filter: &str) -> Result<Option<PathBuf>> {
    let mut best: Option<(SystemTime, PathBuf)> = None;
    for pfl in files::glob_in(iref, "*pfl.fits")? {
        let this_filter = FitsFile::open(&pfl)?
            .value(0, "FILTER")?
            .and_then(|v| v.as_str().map(|s| s.trim().to_string()));
        if this_filter.as_deref() != Some(filter) {
            continue;
        }
        let modified = fs::metadata(&pfl)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", pfl.display()))?;
        tracing::debug!("{} {} {:?}", pfl.display(), filter, modified);
        if best.as_ref().is_none_or(|(t, _)| modified > *t) {
            best = Some((modified, pfl));
        }
    }
    Ok(best.map(|(_, p)| p))
}

/// Multiply SCI by `used/best` when the exposure was flattened with an
/// older flat than the newest one available. Returns whether the exposure
/// changed.
pub fn apply_best_flat(exposure: &mut Exposure, iref: &Path) -> Result<bool> {
    let used = exposure
        .primary
        .get_str("PFLTFILE")
        .ok_or_else(|| anyhow!("{} has no PFLTFILE", exposure.path.display()))?;
    let used = used.rsplit('$').next().unwrap_or(used).trim().to_string();

    let filter = exposure
        .primary
        .get_str("FILTER")
        .ok_or_else(|| anyhow!("{} has no FILTER", exposure.path.display()))?
        .trim()
        .to_string();
    let Some(best_path) = find_best_flat(iref, &filter)? else {
        tracing::warn!("⚠️  No {} pixel flat in {}", filter, iref.display());
        return Ok(false);
    };
    let best = best_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if used == best {
        tracing::info!("PFLAT, {}: Used= {}, Best= {}", exposure.root, used, best);
        return Ok(false);
    }
    tracing::info!("PFLAT, {}: Used= {}, Best= {} *", exposure.root, used, best);

    let used_flat = fits_io::read_image(iref.join(&used), 1)?;
    let best_flat = fits_io::read_image(&best_path, 1)?;
    if used_flat.shape() != best_flat.shape() {
        return Err(anyhow!(
            "Flat shapes differ: {} {:?} vs {} {:?}",
            used,
            used_flat.shape(),
            best,
            best_flat.shape()
        ));
    }
    let (w, h) = used_flat.shape();
    let ratio = crate::image::Image::from_fn(w, h, |col, row| {
        let b = best_flat.get(col, row);
        if b == 0.0 {
            0.0
        } else {
            used_flat.get(col, row) / b
        }
    })
    .crop(
        FLAT_BORDER,
        FLAT_BORDER,
        w.saturating_sub(2 * FLAT_BORDER),
        h.saturating_sub(2 * FLAT_BORDER),
    )?;
    if ratio.shape() != exposure.sci.shape() {
        return Err(anyhow!(
            "Trimmed flat {:?} does not match SCI {:?} of {}",
            ratio.shape(),
            exposure.sci.shape(),
            exposure.root
        ));
    }

    for (v, r) in exposure.sci.data.iter_mut().zip(&ratio.data) {
        *v *= r;
    }
    exposure.primary.set("PFLTFILE", format!("iref${}", best));
    Ok(true)
}

/// [`apply_best_flat`] on every exposure of an association, writing the
/// ones that changed.
pub fn apply_best_flat_asn(dir: &Path, asn: &AsnFile, iref: &Path) -> Result<usize> {
    let mut changed = 0;
    for exp in &asn.exposures {
        let mut exposure = Exposure::open_in(dir, exp)?;
        if apply_best_flat(&mut exposure, iref)? {
            exposure.write()?;
            changed += 1;
        }
    }
    Ok(changed)
}
