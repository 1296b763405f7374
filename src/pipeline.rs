//! Per-association reduction: background passes, shifts, drizzle, blot and
//! segmentation, in the order a survey pointing needs them.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::asn::{self, AsnFile};
use crate::background::{self, BackgroundFitter, BackgroundModel, FitOptions, OnedOptions};
use crate::catalog::InfoTable;
use crate::config::Config;
use crate::external::drizzle::{self, DrizzleParams, DrizzleRun};
use crate::external::sextractor;
use crate::external::Workspace;
use crate::files;
use crate::fits_io::FitsFile;
use crate::regions;
use crate::shifts;

/// Detection threshold for segmentation maps of blotted exposures.
const SEGMAP_SIGMA: f64 = 0.5;

/// Switches for [`prep_flt`].
#[derive(Debug, Clone)]
pub struct PrepOptions {
    /// Find shifts with the shift finder and refine them against `align_image`
    pub get_shift: bool,
    /// Stop after the first background pass
    pub bg_only: bool,
    /// Skip the background passes and let drizzle subtract the sky
    pub bg_skip: bool,
    /// First drizzle does CR rejection, median and WCS update
    pub first_run: bool,
    /// Blot, segment and refit the background with the object mask
    pub redo_background: bool,
    pub align_image: Option<String>,
    pub align_ext: usize,
    pub skip_drz: bool,
    pub final_scale: f64,
    pub pixfrac: f64,
    /// Reference images added to the background basis
    pub sky_images: Vec<PathBuf>,
    /// Comma-separated fit geometries, refined in order
    pub align_geometry: String,
    pub clean: bool,
    /// Polynomial order of the background; -1 for reference images only
    pub initial_order: i32,
    pub save_fit: bool,
}

impl Default for PrepOptions {
    fn default() -> Self {
        Self {
            get_shift: true,
            bg_only: false,
            bg_skip: false,
            first_run: true,
            redo_background: true,
            align_image: None,
            align_ext: 0,
            skip_drz: false,
            final_scale: 0.06,
            pixfrac: 0.8,
            sky_images: Vec::new(),
            align_geometry: "rxyscale,shift".to_string(),
            clean: true,
            initial_order: -1,
            save_fit: false,
        }
    }
}

impl PrepOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            final_scale: config.drizzle.final_scale,
            pixfrac: config.drizzle.pixfrac,
            ..Self::default()
        }
    }
}

fn background_model(ws: &Workspace, opts: &PrepOptions) -> Result<BackgroundModel> {
    let cfg = &ws.config.background;
    let images: Vec<PathBuf> = opts.sky_images.iter().map(|p| ws.dir.join(p)).collect();
    BackgroundModel::from_files(opts.initial_order, cfg.grid_width, cfg.grid_height, &images)
}

fn fit_all(ws: &Workspace, asn: &AsnFile, opts: &PrepOptions) -> Result<BackgroundModel> {
    let model = background_model(ws, opts)?;
    let fitter = BackgroundFitter::from(&ws.config.background);
    let fit_opts = FitOptions {
        overwrite: true,
        save_fit: opts.save_fit,
    };
    for exp in &asn.exposures {
        background::fit_exposure(&ws.dir, exp, &model, &fitter, &fit_opts)?;
    }
    Ok(model)
}

/// ACS run files list both WFC chips of every exposure.
fn run_stride(ws: &Workspace, asn: &AsnFile) -> Result<usize> {
    let path = ws.path(&format!("{}_flt.fits", asn.exposures[0]));
    let instrument = FitsFile::open(&path)?
        .value(0, "INSTRUME")?
        .and_then(|v| v.as_str().map(|s| s.trim().to_string()));
    Ok(if instrument.as_deref() == Some("ACS") { 2 } else { 1 })
}

/// Blot the drizzled mosaic back to every exposure of an association and
/// build `<flt>.seg.fits` object masks from the blotted images.
pub fn blot_segmaps(ws: &Workspace, asn_root: &str) -> Result<Vec<PathBuf>> {
    let asn = AsnFile::open(&ws.dir, asn_root)?;
    let run = DrizzleRun::from_run_file(&ws.dir, asn_root)?;
    let stride = run_stride(ws, &asn)?;
    let mut segs = Vec::with_capacity(asn.len());
    for i in 0..asn.len() {
        let ii = i * stride;
        if ii >= run.count() {
            bail!(
                "{}: run file lists {} images, exposure #{} needs #{}",
                asn_root,
                run.count(),
                i,
                ii
            );
        }
        run.blot_back(ws, ii, i == 0, None)?;
        segs.push(sextractor::make_segmap(ws, &run.flt[ii], SEGMAP_SIGMA)?);
    }
    Ok(segs)
}

/// Subtract backgrounds and align the exposures of `<asn_root>_asn.json`.
pub fn prep_flt(ws: &Workspace, asn_root: &str, options: &PrepOptions) -> Result<()> {
    let mut opts = options.clone();
    if opts.bg_skip {
        opts.bg_only = false;
        opts.redo_background = false;
    }
    if opts.get_shift && !opts.bg_only && opts.align_image.is_none() {
        bail!("Shift refinement of {} needs an alignment image", asn_root);
    }

    let asn = AsnFile::open(&ws.dir, asn_root)?;
    tracing::info!("🚀 prep_flt {} ({} exposures)", asn_root, asn.len());

    if !opts.bg_skip {
        tracing::info!("📐 First background pass, order {}", opts.initial_order);
        fit_all(ws, &asn, &opts)?;
    }
    if opts.bg_only {
        return Ok(());
    }

    if opts.get_shift {
        shifts::run_tweakshifts(ws, asn_root)?;
        shifts::check_shiftfile(&ws.dir, asn_root)?;
    }

    if !opts.skip_drz {
        let params = DrizzleParams {
            skysub: opts.bg_skip,
            updatewcs: opts.first_run,
            driz_cr: opts.first_run,
            median: opts.first_run,
            final_scale: opts.final_scale,
            pixfrac: opts.pixfrac,
            clean: opts.clean,
            ..DrizzleParams::default()
        };
        drizzle::start_multidrizzle(ws, asn_root, &params)?;
    }

    if opts.redo_background {
        blot_segmaps(ws, asn_root)?;
    }

    if opts.get_shift {
        let align_image = opts
            .align_image
            .as_deref()
            .ok_or_else(|| anyhow!("No alignment image for {}", asn_root))?;
        for geometry in opts.align_geometry.split(',').map(str::trim) {
            shifts::refine_shifts(ws, asn_root, align_image, opts.align_ext, geometry, opts.clean)?;
            let params = DrizzleParams {
                skysub: true,
                clean: opts.clean,
                ..DrizzleParams::final_pass(opts.final_scale, opts.pixfrac)
            };
            drizzle::start_multidrizzle(ws, asn_root, &params)?;
        }
    }

    if opts.redo_background {
        tracing::info!("📐 Background refit with object masks");
        fit_all(ws, &asn, &opts)?;
        let oned = OnedOptions {
            savefig: true,
            ..OnedOptions::from_config(&ws.config.background)
        };
        background::asn_oned_background_subtract(&ws.dir, &asn, &oned)?;

        let params = DrizzleParams {
            clean: opts.clean,
            ..DrizzleParams::final_pass(opts.final_scale, opts.pixfrac)
        };
        drizzle::start_multidrizzle(ws, asn_root, &params)?;
    }

    if opts.clean {
        files::remove_matching(&ws.dir, "*BLOT*")?;
    }
    tracing::info!("✅ prep_flt {} done", asn_root);
    Ok(())
}

/// [`prep_flt`] on every association matching `pattern`, e.g. `ib*050_asn.json`.
pub fn prep_all(ws: &Workspace, pattern: &str, options: &PrepOptions) -> Result<usize> {
    let asn_files = files::glob_in(&ws.dir, pattern)?;
    for path in &asn_files {
        prep_flt(ws, &asn::root_of(path), options)?;
    }
    Ok(asn_files.len())
}

/// A direct association and its grism counterpart.
#[derive(Debug, Clone)]
pub struct PairOptions {
    pub direct_asn: Option<String>,
    pub grism_asn: Option<String>,
    pub align_image: Option<String>,
    /// Reference sky images for the grism background
    pub sky_images: Vec<PathBuf>,
    pub skip_direct: bool,
    pub skip_grism: bool,
    pub get_shift: bool,
    /// Extra direct background pass with this order when positive
    pub direct_order: i32,
    /// Extra grism background pass with this order when positive
    pub grism_order: i32,
}

impl Default for PairOptions {
    fn default() -> Self {
        Self {
            direct_asn: None,
            grism_asn: None,
            align_image: None,
            sky_images: Vec::new(),
            skip_direct: false,
            skip_grism: false,
            get_shift: true,
            direct_order: 2,
            grism_order: 1,
        }
    }
}

/// Products named by [`process_pair`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairProducts {
    pub direct: Option<String>,
    pub grism: Option<String>,
}

fn prepare_inputs(ws: &Workspace, raw: &Path, root: &str) -> Result<()> {
    let asn = AsnFile::open(&ws.dir, root)?;
    asn::fresh_flt_files(&asn, raw, &ws.dir)?;
    if !regions::pointing_region_path(&ws.dir, root).exists() {
        regions::asn_region(&ws.dir, root)?;
    }
    Ok(())
}

/// Reduce a direct/grism pair of associations after renaming them after
/// their target.
pub fn process_pair(ws: &Workspace, options: &PairOptions) -> Result<PairProducts> {
    let raw = ws.dir.join(&ws.config.paths.raw);
    let rename = |root: &Option<String>| -> Result<Option<String>> {
        root.as_deref()
            .map(|r| {
                asn::make_targname_asn(&AsnFile::path_for(&ws.dir, r), &raw, true)
                    .map(|p| asn::root_of(&p))
            })
            .transpose()
    };
    let products = PairProducts {
        direct: rename(&options.direct_asn)?,
        grism: rename(&options.grism_asn)?,
    };
    tracing::info!(
        "DIRECT: {}, GRISM: {}",
        products.direct.as_deref().unwrap_or("-"),
        products.grism.as_deref().unwrap_or("-")
    );

    let base = PrepOptions::from_config(ws.config);

    if !options.skip_direct {
        let direct = products
            .direct
            .as_deref()
            .ok_or_else(|| anyhow!("Direct pass requested without a direct association"))?;
        prepare_inputs(ws, &raw, direct)?;

        prep_flt(
            ws,
            direct,
            &PrepOptions {
                get_shift: options.get_shift,
                redo_background: true,
                align_image: options.align_image.clone(),
                initial_order: 0,
                ..base.clone()
            },
        )?;
        if options.direct_order > 0 {
            prep_flt(
                ws,
                direct,
                &PrepOptions {
                    get_shift: false,
                    redo_background: false,
                    initial_order: options.direct_order,
                    ..base.clone()
                },
            )?;
        }
    }

    if !options.skip_grism {
        let grism = products
            .grism
            .as_deref()
            .ok_or_else(|| anyhow!("Grism pass requested without a grism association"))?;
        if let Some(direct) = products.direct.as_deref() {
            shifts::make_grism_shiftfile(&ws.dir, direct, grism)?;
        }
        prepare_inputs(ws, &raw, grism)?;

        prep_flt(
            ws,
            grism,
            &PrepOptions {
                get_shift: false,
                redo_background: true,
                sky_images: options.sky_images.clone(),
                initial_order: -1,
                ..base.clone()
            },
        )?;
        if options.grism_order > 0 {
            prep_flt(
                ws,
                grism,
                &PrepOptions {
                    get_shift: false,
                    first_run: false,
                    redo_background: false,
                    initial_order: options.grism_order,
                    ..base.clone()
                },
            )?;
        }
    }

    Ok(products)
}

/// Drizzle every neighbour of `pointing` matching `mosaic_pattern`
/// (e.g. `GOODS-N-*D`) onto the pointing's own grid. The products are
/// renamed to the pointing root.
pub fn mosaic_to_pointing(ws: &Workspace, mosaic_pattern: &str, pointing: &str) -> Result<Vec<PathBuf>> {
    const TMP: &str = "mostmp";

    let reference = ws.path(&format!("{}_drz.fits", pointing));
    let overlapping = shifts::find_overlapping_images(
        &ws.dir,
        &reference,
        &format!("{}*drz.fits", mosaic_pattern),
        1,
    )?;
    let roots: Vec<String> = overlapping
        .iter()
        .filter_map(|p| files::stem_before(p, "_drz.fits"))
        .collect();
    tracing::info!("🧩 {}: {} overlapping pointings", pointing, roots.len());

    shifts::combine_asn_shifts(&ws.dir, &roots, TMP)?;
    let params = DrizzleParams {
        refimage: Some(format!("{}_drz.fits[1]", pointing)),
        ..DrizzleParams::final_pass(ws.config.drizzle.final_scale, ws.config.drizzle.pixfrac)
    };
    drizzle::start_multidrizzle(ws, TMP, &params)?;

    files::remove_if_exists(&shifts::shiftfile_path(&ws.dir, TMP))?;
    files::remove_if_exists(&AsnFile::path_for(&ws.dir, TMP))?;

    let mut renamed = Vec::new();
    for file in files::glob_in(&ws.dir, &format!("{}*", TMP))? {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let out = ws.path(&name.replacen(TMP, pointing, 1));
        fs::rename(&file, &out)
            .with_context(|| format!("Failed to rename {} to {}", file.display(), out.display()))?;
        renamed.push(out);
    }
    Ok(renamed)
}

/// Target name as it appears in association products of `root`'s survey.
fn normalise_target(root: &str, targname: &str) -> String {
    match root {
        "GOODS-S" => targname.replace("SOUTH", "S"),
        "GOODS-N" => targname.replace("GNGRISM", "GOODS-N-"),
        _ => targname.to_string(),
    }
}

/// Grism targets grouped by rounded PA_V3, from a `files.info` table.
pub fn grism_subsets(info: &InfoTable, root: &str) -> Result<Vec<(i64, Vec<String>)>> {
    let targets = info.column_str("targname")?;
    let angles = info.column_f64("pa_v3")?;

    let mut groups: Vec<(i64, BTreeSet<String>)> = Vec::new();
    for (targ, pa) in targets.iter().zip(&angles) {
        let angle = pa.round() as i64;
        let targ = normalise_target(root, targ);
        match groups.iter_mut().find(|(a, _)| *a == angle) {
            Some((_, set)) => {
                set.insert(targ);
            }
            None => groups.push((angle, BTreeSet::from([targ]))),
        }
    }
    groups.sort_by_key(|(a, _)| *a);
    Ok(groups
        .into_iter()
        .map(|(a, set)| (a, set.into_iter().collect()))
        .collect())
}

/// Combine the grism associations observed at each orient angle into
/// `<root>-%03d` and drizzle them, on the `<root>-D` mosaic grid when it
/// exists. `single` restricts the run to one angle by index.
pub fn make_grism_subsets(
    ws: &Workspace,
    root: &str,
    single: Option<usize>,
    run_drizzle: bool,
) -> Result<Vec<String>> {
    let info = InfoTable::read(ws.path("files.info"))?;
    let mut subsets = grism_subsets(&info, root)?;
    if let Some(i) = single {
        if i >= subsets.len() {
            bail!("Angle #{} requested but only {} angles found", i, subsets.len());
        }
        subsets = vec![subsets.swap_remove(i)];
    }

    let mut products = Vec::with_capacity(subsets.len());
    for (angle, targets) in subsets {
        let out_root = format!("{}-{:03}", root, angle);
        let asn_roots: Vec<String> = targets.iter().map(|t| format!("{}-G", t)).collect();
        tracing::info!("🧩 {} <- {}", out_root, asn_roots.join(", "));
        shifts::combine_asn_shifts(&ws.dir, &asn_roots, &out_root)?;

        if run_drizzle {
            let direct_ref = format!("{}-D_drz.fits", root);
            let refimage = ws
                .path(&direct_ref)
                .exists()
                .then(|| format!("{}[1]", direct_ref));
            let params = DrizzleParams {
                refimage,
                ..DrizzleParams::final_pass(ws.config.drizzle.final_scale, ws.config.drizzle.pixfrac)
            };
            drizzle::start_multidrizzle(ws, &out_root, &params)?;
        }
        products.push(out_root);
    }
    Ok(products)
}
