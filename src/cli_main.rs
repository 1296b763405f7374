use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use crate::asn::{self, AsnFile};
use crate::background::{self, BackgroundFitter, BackgroundModel, FitOptions, OnedOptions};
use crate::catalog::SexCatalog;
use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::external::{ProcessRunner, Workspace};
use crate::files;
use crate::fits_io::Exposure;
use crate::flat;
use crate::pipeline::{self, PairOptions, PrepOptions};
use crate::recipes;
use crate::regions;
use crate::shifts;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(default)),
        )
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .init();
}

pub fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    config.merge_with_cli(
        cli.raw_dir.clone(),
        cli.final_scale,
        cli.pixfrac,
        cli.timeout.clone(),
    );
    config.validate().context("Invalid configuration")?;

    let runner = ProcessRunner::new(config.get_timeout());
    let ws = Workspace::new(&cli.dir, &config, &runner);
    tracing::debug!("🔧 Working directory {}", ws.dir.display());

    match cli.command {
        Commands::FitBackground {
            roots,
            order,
            sky_images,
            dry_run,
            save_fit,
        } => {
            let bg = &config.background;
            let images: Vec<PathBuf> = sky_images.iter().map(|p| ws.dir.join(p)).collect();
            let model = BackgroundModel::from_files(order, bg.grid_width, bg.grid_height, &images)?;
            let fitter = BackgroundFitter::from(bg);
            let options = FitOptions {
                overwrite: !dry_run,
                save_fit,
            };
            for root in &roots {
                background::fit_exposure(&ws.dir, root, &model, &fitter, &options)?;
            }
        }
        Commands::OnedBackground {
            roots,
            asn,
            nbin,
            force,
            no_figure,
        } => {
            let defaults = OnedOptions::default();
            let options = OnedOptions {
                nbin: nbin.unwrap_or(defaults.nbin),
                force,
                savefig: !no_figure,
                dq_bit: config.background.oned_dq_bit,
                iterations: config.background.oned_iterations,
            };
            if options.nbin == 0 {
                return Err(anyhow!("--nbin must be positive"));
            }
            match asn {
                Some(root) => {
                    let asn = AsnFile::open(&ws.dir, &root)?;
                    let n = background::asn_oned_background_subtract(&ws.dir, &asn, &options)?;
                    tracing::info!("📉 {}: {} of {} exposures corrected", root, n, asn.len());
                }
                None => {
                    for root in &roots {
                        background::oned_background_subtract(&ws.dir, root, &options)?;
                    }
                }
            }
        }
        Commands::Prep { asn_root, options } => {
            let opts = options.to_prep_options(PrepOptions::from_config(&config));
            pipeline::prep_flt(&ws, &asn_root, &opts)?;
        }
        Commands::PrepAll { pattern, options } => {
            let opts = options.to_prep_options(PrepOptions::from_config(&config));
            let n = pipeline::prep_all(&ws, &pattern, &opts)?;
            tracing::info!("✅ {} associations processed", n);
        }
        Commands::Pair {
            direct,
            grism,
            align_image,
            sky_images,
            skip_direct,
            skip_grism,
            no_shift,
            direct_order,
            grism_order,
        } => {
            let options = PairOptions {
                direct_asn: direct,
                grism_asn: grism,
                align_image,
                sky_images: sky_images.iter().map(PathBuf::from).collect(),
                skip_direct,
                skip_grism,
                get_shift: !no_shift,
                direct_order,
                grism_order,
            };
            let products = pipeline::process_pair(&ws, &options)?;
            tracing::info!(
                "✅ Pair done: {} / {}",
                products.direct.as_deref().unwrap_or("-"),
                products.grism.as_deref().unwrap_or("-")
            );
        }
        Commands::ProcessField { name } => {
            let recipe = config
                .find_field(&name)
                .ok_or_else(|| anyhow!("No field named '{}' in the configuration", name))?;
            recipes::run_field(&ws, recipe)?;
        }
        Commands::AsnRegion { roots } => {
            for root in &roots {
                regions::asn_region(&ws.dir, root)?;
            }
        }
        Commands::ZerothRegions { catalog, output } => {
            let catalog = SexCatalog::read(ws.path(&catalog))?;
            let root = regions::catalog_root(&catalog)?;
            let wcs = regions::first_exposure_wcs(&ws.dir, &root)?;
            regions::make_zeroth(
                &catalog,
                &wcs,
                config.grism.zeroth_offset,
                &ws.path(&output),
            )?;
        }
        Commands::TrimEdges {
            catalog,
            mosaic,
            output,
        } => {
            let axe_config = config
                .grism
                .axe_config
                .as_deref()
                .ok_or_else(|| anyhow!("Edge trimming needs [grism] axe_config for BEAMA"))?;
            let beam_x = regions::read_beam_a(&ws.dir.join(axe_config))?;

            let mut catalog = SexCatalog::read(ws.path(&catalog))?;
            let root = regions::catalog_root(&catalog)?;
            let flt_wcs = regions::first_exposure_wcs(&ws.dir, &root)?;
            let drz = match mosaic {
                Some(m) => ws.path(&m),
                None => ws.path(&format!("{}_drz.fits", root)),
            };
            regions::trim_edge_objects(
                &mut catalog,
                &flt_wcs,
                &drz,
                beam_x,
                config.grism.beam_width,
            )?;
            let out = output.map(|o| ws.path(&o)).unwrap_or(catalog.path.clone());
            catalog.write(&out)?;
        }
        Commands::MakeAsn { product, exposures } => {
            let path = AsnFile::path_for(&ws.dir, &product);
            AsnFile::new(product, exposures).write(&path)?;
            tracing::info!("📝 Wrote {}", path.display());
        }
        Commands::TargnameAsn { asn_files, dry_run } => {
            let raw = ws.dir.join(&config.paths.raw);
            for file in &asn_files {
                let out = asn::make_targname_asn(&ws.path(file), &raw, !dry_run)?;
                println!("{} -> {}", file, asn::root_of(&out));
            }
        }
        Commands::CombineAsn { out_root, roots } => {
            shifts::combine_asn_shifts(&ws.dir, &roots, &out_root)?;
        }
        Commands::GrismShifts { direct, grism } => {
            let n = shifts::make_grism_shiftfiles(&ws.dir, &direct, &grism)?;
            tracing::info!("↔️  {} grism shift files", n);
        }
        Commands::GrismSubsets {
            root,
            single,
            no_drizzle,
        } => {
            let products = pipeline::make_grism_subsets(&ws, &root, single, !no_drizzle)?;
            for product in products {
                println!("{}", product);
            }
        }
        Commands::MosaicPointing { pattern, pointings } => {
            let pointings = if pointings.is_empty() {
                files::glob_in(&ws.dir, &format!("{}{}", pattern, asn::ASN_SUFFIX))?
                    .iter()
                    .map(asn::root_of)
                    .collect()
            } else {
                pointings
            };
            for pointing in &pointings {
                pipeline::mosaic_to_pointing(&ws, &pattern, pointing)?;
            }
        }
        Commands::BestFlat { roots, apply } => {
            let iref = config
                .get_iref()
                .ok_or_else(|| anyhow!("No flat reference directory: set [paths] iref or $iref"))?;
            for root in &roots {
                best_flat(&ws.dir, root, &iref, apply)?;
            }
        }
        Commands::Segmap { roots } => {
            for root in &roots {
                let segs = pipeline::blot_segmaps(&ws, root)?;
                tracing::info!("🧩 {}: {} segmentation images", root, segs.len());
            }
        }
    }

    Ok(())
}

fn best_flat(dir: &Path, asn_root: &str, iref: &Path, apply: bool) -> Result<()> {
    let asn = AsnFile::open(dir, asn_root)?;
    if apply {
        let n = flat::apply_best_flat_asn(dir, &asn, iref)?;
        tracing::info!("🩹 {}: {} exposures re-flattened", asn_root, n);
        return Ok(());
    }
    for exp in &asn.exposures {
        let mut exposure = Exposure::open_in(dir, exp)?;
        flat::apply_best_flat(&mut exposure, iref)?;
    }
    Ok(())
}
