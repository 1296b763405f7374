use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::Workspace;
use crate::fits_io::FitsFile;
use crate::regions;

/// Output columns required by aXe.
pub const AXE_PARAMS: &[&str] = &[
    "NUMBER",
    "X_IMAGE",
    "Y_IMAGE",
    "A_IMAGE",
    "B_IMAGE",
    "THETA_IMAGE",
    "X_WORLD",
    "Y_WORLD",
    "A_WORLD",
    "B_WORLD",
    "THETA_WORLD",
    "MAG_AUTO",
    "MAGERR_AUTO",
    "FLUX_AUTO",
    "FLUXERR_AUTO",
    "FLUX_RADIUS",
    "FLAGS",
];

/// 3x3 pyramid with FWHM of 2 pixels.
const DEFAULT_CONV: &str = "CONV NORM
# 3x3 ``all-ground'' convolution mask with FWHM = 2 pixels.
1 2 1
2 4 2
1 2 1
";

/// Magnitude zeropoint handed to extraction on blotted WFC3/IR images.
pub const MAG_ZEROPOINT: &str = "26.46";

/// A configured SExtractor run: `-KEY value` options, the output
/// parameter list and the convolution filter.
#[derive(Debug, Clone, Default)]
pub struct SExtractor {
    pub options: BTreeMap<String, String>,
    pub params: Vec<String>,
    /// Source of the convolution filter; the built-in pyramid when `None`
    pub conv_source: Option<PathBuf>,
    /// Name of the filter file written next to the image
    pub conv_name: String,
}

impl SExtractor {
    pub fn new() -> Self {
        Self {
            conv_name: "default.conv".to_string(),
            ..Self::default()
        }
    }

    /// Use the aXe output columns.
    pub fn axe_params(mut self) -> Self {
        self.params = AXE_PARAMS.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Pick the grism or direct convolution filter.
    pub fn conv_file(mut self, grism: bool, source: Option<PathBuf>) -> Self {
        self.conv_name = if grism { "grism.conv" } else { "default.conv" }.to_string();
        self.conv_source = source;
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    fn write_support_files(&self, dir: &Path, stem: &str) -> Result<(String, String)> {
        let conv = dir.join(&self.conv_name);
        match &self.conv_source {
            Some(src) => {
                fs::copy(src, &conv).with_context(|| {
                    format!("Failed to copy convolution filter {}", src.display())
                })?;
            }
            None => fs::write(&conv, DEFAULT_CONV)
                .with_context(|| format!("Failed to write {}", conv.display()))?,
        }

        let param_name = format!("{}.param", stem);
        let text: String = self.params.iter().map(|p| format!("{}\n", p)).collect();
        fs::write(dir.join(&param_name), text)
            .with_context(|| format!("Failed to write {}", param_name))?;
        Ok((param_name, self.conv_name.clone()))
    }

    /// Command-line arguments for extracting `image`.
    pub fn args(&self, image: &str, param_name: &str) -> Vec<String> {
        let mut args = vec![
            image.to_string(),
            "-PARAMETERS_NAME".to_string(),
            param_name.to_string(),
        ];
        for (key, value) in &self.options {
            args.push(format!("-{}", key));
            args.push(value.clone());
        }
        args
    }

    /// Run extraction on `image` in the workspace directory and check the
    /// catalogue was written.
    pub fn run(&mut self, ws: &Workspace, image: &str) -> Result<PathBuf> {
        let stem = image.trim_end_matches(".fits");
        let (param_name, conv_name) = self.write_support_files(&ws.dir, stem)?;
        self.options
            .entry("FILTER_NAME".to_string())
            .or_insert(conv_name);
        let catalog = self
            .options
            .entry("CATALOG_NAME".to_string())
            .or_insert_with(|| format!("{}.cat", stem))
            .clone();

        tracing::info!("🔭 Extracting sources from {}", image);
        ws.run_tool(&ws.config.tools.sextractor, self.args(image, &param_name))
            .with_context(|| format!("Source extraction failed on {}", image))?;

        let path = ws.path(&catalog);
        if !path.exists() {
            bail!(
                "Source extraction on {} did not write {}",
                image,
                path.display()
            );
        }
        Ok(path)
    }
}

/// Segmentation image `<root>.seg.fits` of a blotted exposure, where `root`
/// is e.g. `ib3701ryq_flt`. Thresholds are `sigma` in units of the
/// background RMS.
pub fn make_segmap(ws: &Workspace, root: &str, sigma: f64) -> Result<PathBuf> {
    let flt = FitsFile::open(ws.path(&format!("{}.fits", root)))?;
    let is_grism = flt
        .value(0, "FILTER")?
        .and_then(|v| v.as_str().map(|s| s.trim().starts_with('G')))
        .unwrap_or(false);

    let paths = &ws.config.paths;
    let conv = if is_grism {
        paths.grism_conv.as_ref()
    } else {
        paths.direct_conv.as_ref()
    };
    let mut se = SExtractor::new()
        .axe_params()
        .conv_file(is_grism, conv.map(PathBuf::from));

    let seg = format!("{}.seg.fits", root);
    se.set("CATALOG_NAME", format!("{}.BLOT.SCI.cat", root))
        .set("CHECKIMAGE_NAME", format!("{}, bg.fits", seg))
        .set("CHECKIMAGE_TYPE", "SEGMENTATION,BACKGROUND")
        .set("WEIGHT_TYPE", "MAP_WEIGHT")
        .set("WEIGHT_IMAGE", format!("{}.BLOT.WHT.fits", root))
        .set("FILTER", "Y")
        .set("BACK_TYPE", "AUTO")
        .set("BACK_FILTERSIZE", "2")
        .set("DETECT_THRESH", format!("{:.6}", sigma))
        .set("ANALYSIS_THRESH", format!("{:.6}", sigma))
        .set("MAG_ZEROPOINT", MAG_ZEROPOINT);
    se.run(ws, &format!("{}.BLOT.SCI.fits", root))?;

    let seg_path = ws.path(&seg);
    let mut reg = seg_path.as_os_str().to_os_string();
    reg.push(".mask.reg");
    if Path::new(&reg).exists() {
        regions::apply_dq_mask(&seg_path, 0, 100)?;
    }
    Ok(seg_path)
}
