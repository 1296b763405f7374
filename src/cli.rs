use clap::{Args, Parser, Subcommand};

use crate::pipeline::PrepOptions;

#[derive(Parser)]
#[command(name = "grism-prep")]
#[command(about = "Background subtraction, alignment and drizzling of HST grism/direct exposures")]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Working directory holding the FLT files and associations
    #[arg(short, long, global = true, default_value = ".")]
    pub dir: String,

    /// Directory with the pipeline FLT files (overrides config)
    #[arg(long, global = true)]
    pub raw_dir: Option<String>,

    /// Output pixel scale in arcsec (overrides config)
    #[arg(long, global = true)]
    pub final_scale: Option<f64>,

    /// Drizzle drop size (overrides config)
    #[arg(long, global = true)]
    pub pixfrac: Option<f64>,

    /// Timeout per external tool call, e.g. "30m", "2h" (overrides config)
    #[arg(long, global = true)]
    pub timeout: Option<String>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Switches shared by `prep` and `prep-all`.
#[derive(Args, Debug, Clone)]
pub struct PrepArgs {
    /// Reference image the shifts are refined against
    #[arg(long)]
    pub align_image: Option<String>,

    /// FITS extension of the alignment image
    #[arg(long, default_value = "0")]
    pub align_ext: usize,

    /// Comma-separated fit geometries, refined in order
    #[arg(long, default_value = "rxyscale,shift")]
    pub align_geometry: String,

    /// Keep the current shift file instead of finding new shifts
    #[arg(long)]
    pub no_shift: bool,

    /// Stop after the first background pass
    #[arg(long)]
    pub bg_only: bool,

    /// Skip the background passes and let drizzle subtract the sky
    #[arg(long)]
    pub bg_skip: bool,

    /// Images were already drizzled once (no CR rejection or WCS update)
    #[arg(long)]
    pub not_first_run: bool,

    /// Do not blot, segment and refit the background
    #[arg(long)]
    pub no_redo_background: bool,

    /// Do not run the first drizzle
    #[arg(long)]
    pub skip_drz: bool,

    /// Polynomial order of the background, -1 for reference images only
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    pub order: i32,

    /// Reference sky images added to the background basis
    #[arg(long = "sky", value_name = "FITS")]
    pub sky_images: Vec<String>,

    /// Keep intermediate drizzle products
    #[arg(long)]
    pub no_clean: bool,

    /// Save the fitted background as <root>_flt.BG.fits
    #[arg(long)]
    pub save_fit: bool,
}

impl PrepArgs {
    /// Layer the switches over config-derived defaults.
    pub fn to_prep_options(&self, base: PrepOptions) -> PrepOptions {
        PrepOptions {
            get_shift: !self.no_shift,
            bg_only: self.bg_only,
            bg_skip: self.bg_skip,
            first_run: !self.not_first_run,
            redo_background: !self.no_redo_background,
            align_image: self.align_image.clone(),
            align_ext: self.align_ext,
            skip_drz: self.skip_drz,
            sky_images: self.sky_images.iter().map(Into::into).collect(),
            align_geometry: self.align_geometry.clone(),
            clean: !self.no_clean,
            initial_order: self.order,
            save_fit: self.save_fit,
            ..base
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fit and subtract a 2-D background from exposures
    FitBackground {
        /// Exposure roots, e.g. ib3701ryq
        #[arg(required = true)]
        roots: Vec<String>,

        /// Polynomial order, -1 for reference images only
        #[arg(long, default_value = "2", allow_hyphen_values = true)]
        order: i32,

        /// Reference sky images added to the basis
        #[arg(long = "sky", value_name = "FITS")]
        sky_images: Vec<String>,

        /// Only report the fit, leave the FLT untouched
        #[arg(long)]
        dry_run: bool,

        /// Save the fitted background as <root>_flt.BG.fits
        #[arg(long)]
        save_fit: bool,
    },
    /// Remove column residuals from background-subtracted grism exposures
    OnedBackground {
        /// Exposure roots
        roots: Vec<String>,

        /// Process every exposure of this association instead
        #[arg(long)]
        asn: Option<String>,

        /// Column stripe width in pixels
        #[arg(long)]
        nbin: Option<usize>,

        /// Re-run on exposures already marked as corrected
        #[arg(long)]
        force: bool,

        /// Skip the residual plots
        #[arg(long)]
        no_figure: bool,
    },
    /// Background, shifts, drizzle and object masks for one association
    Prep {
        /// Association root, e.g. ib3701050
        asn_root: String,

        #[command(flatten)]
        options: PrepArgs,
    },
    /// Run `prep` on every association matching a pattern
    PrepAll {
        /// Association file pattern, e.g. "ib*050_asn.json"
        pattern: String,

        #[command(flatten)]
        options: PrepArgs,
    },
    /// Reduce a direct/grism pair of associations
    Pair {
        /// Direct association root
        #[arg(long)]
        direct: Option<String>,

        /// Grism association root
        #[arg(long)]
        grism: Option<String>,

        /// Reference image for the direct shifts
        #[arg(long)]
        align_image: Option<String>,

        /// Reference sky images for the grism background
        #[arg(long = "sky", value_name = "FITS")]
        sky_images: Vec<String>,

        #[arg(long)]
        skip_direct: bool,

        #[arg(long)]
        skip_grism: bool,

        /// Keep the current direct shift file
        #[arg(long)]
        no_shift: bool,

        /// Order of the extra direct background pass (0 to skip)
        #[arg(long, default_value = "2")]
        direct_order: i32,

        /// Order of the extra grism background pass (0 to skip)
        #[arg(long, default_value = "1")]
        grism_order: i32,
    },
    /// Run a survey field recipe from the configuration
    ProcessField {
        /// Field name as given in [[fields]]
        name: String,
    },
    /// Write DS9 footprints of associations
    AsnRegion {
        /// Association roots
        #[arg(required = true)]
        roots: Vec<String>,
    },
    /// Write DS9 ellipses at the predicted 0th-order positions of catalogue objects
    ZerothRegions {
        /// Drizzled catalogue, e.g. GOODS-S-12-D_drz.cat
        catalog: String,

        /// Output region file
        #[arg(short, long, default_value = "zeroth.reg")]
        output: String,
    },
    /// Drop catalogue objects whose spectra fall off the grism mosaic
    TrimEdges {
        /// Drizzled direct catalogue, e.g. GOODS-S-12-D_drz.cat
        catalog: String,

        /// Grism mosaic the spectra must land on; <root>_drz.fits when omitted
        #[arg(long)]
        mosaic: Option<String>,

        /// Write the trimmed catalogue here instead of in place
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Create an association from exposure roots
    MakeAsn {
        /// Product name
        product: String,

        /// Exposure roots
        #[arg(required = true)]
        exposures: Vec<String>,
    },
    /// Rename associations after their target
    TargnameAsn {
        /// Association files
        #[arg(required = true)]
        asn_files: Vec<String>,

        /// Only print the new name
        #[arg(long)]
        dry_run: bool,
    },
    /// Merge associations and their shift files
    CombineAsn {
        /// Output root
        out_root: String,

        /// Association roots to combine
        #[arg(required = true)]
        roots: Vec<String>,
    },
    /// Derive grism shift files from direct ones
    GrismShifts {
        /// Direct association pattern, e.g. "*-D_asn.json"
        #[arg(long, default_value = "*-D_asn.json")]
        direct: String,

        /// Grism association pattern
        #[arg(long, default_value = "*-G_asn.json")]
        grism: String,
    },
    /// Combine grism associations observed at the same orient
    GrismSubsets {
        /// Survey root, e.g. GOODS-S
        root: String,

        /// Only the angle with this index
        #[arg(long)]
        single: Option<usize>,

        /// Combine without drizzling
        #[arg(long)]
        no_drizzle: bool,
    },
    /// Drizzle overlapping neighbours onto a pointing's grid
    MosaicPointing {
        /// Mosaic pattern, e.g. "GOODS-N-*D"
        pattern: String,

        /// Pointing roots; every association matching the pattern when omitted
        pointings: Vec<String>,
    },
    /// Check exposures against the newest pixel flat
    BestFlat {
        /// Association roots
        #[arg(required = true)]
        roots: Vec<String>,

        /// Re-flatten exposures calibrated with an older flat
        #[arg(long)]
        apply: bool,
    },
    /// Blot the mosaic back and make segmentation images for an association
    Segmap {
        /// Association roots
        #[arg(required = true)]
        roots: Vec<String>,
    },
}
