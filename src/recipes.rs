//! Survey field recipes: which pairs to reduce, which shift files to seed,
//! and which mosaics to build, read from the `[[fields]]` config tables.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::asn;
use crate::external::drizzle::{self, DrizzleParams};
use crate::external::Workspace;
use crate::files;
use crate::pipeline::{self, PairOptions};
use crate::shifts;

/// One direct/grism pair of a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairRecipe {
    /// Direct association root, e.g. `ibhj06030`
    pub direct: Option<String>,
    /// Grism association root, e.g. `ibhj06040`
    pub grism: Option<String>,
    pub skip_direct: bool,
    pub skip_grism: bool,
    pub get_shift: bool,
    pub direct_order: i32,
    pub grism_order: i32,
    /// Overrides the field's sky images
    pub sky_images: Option<Vec<String>>,
}

impl Default for PairRecipe {
    fn default() -> Self {
        let pair = PairOptions::default();
        Self {
            direct: None,
            grism: None,
            skip_direct: pair.skip_direct,
            skip_grism: pair.skip_grism,
            get_shift: pair.get_shift,
            direct_order: pair.direct_order,
            grism_order: pair.grism_order,
            sky_images: None,
        }
    }
}

/// Copy of a shift file made before the pairs run, e.g.
/// `ibfuw3070_shifts.txt` -> `MARSHALL3-G_shifts.txt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftCopy {
    pub from: String,
    pub to: String,
}

/// A combined mosaic of several associations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosaicRecipe {
    /// Associations to combine, e.g. `GOODS-S*-D_asn.json`
    pub pattern: String,
    pub out_root: String,
    #[serde(default)]
    pub skysub: bool,
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub final_outnx: Option<usize>,
    pub final_outny: Option<usize>,
    #[serde(default)]
    pub final_rot: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRecipe {
    pub name: String,
    /// Working directory, relative to the run directory
    pub directory: String,
    pub align_image: Option<String>,
    #[serde(default)]
    pub sky_images: Vec<String>,
    #[serde(default)]
    pub shift_copies: Vec<ShiftCopy>,
    #[serde(default)]
    pub pairs: Vec<PairRecipe>,
    #[serde(default)]
    pub mosaics: Vec<MosaicRecipe>,
    /// Survey root for [`pipeline::make_grism_subsets`]
    pub grism_subsets: Option<String>,
    /// Pointing pattern for [`pipeline::mosaic_to_pointing`], e.g. `GOODS-N-*D`
    pub pointing_mosaics: Option<String>,
}

impl FieldRecipe {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("Field name must not be empty");
        }
        for (i, pair) in self.pairs.iter().enumerate() {
            if pair.direct.is_none() && pair.grism.is_none() {
                bail!("Pair #{} names neither a direct nor a grism association", i);
            }
            if !pair.skip_direct && pair.direct.is_none() {
                bail!("Pair #{} processes direct images but has no direct association", i);
            }
            if !pair.skip_grism && pair.grism.is_none() {
                bail!("Pair #{} processes grism images but has no grism association", i);
            }
            if !pair.skip_direct && pair.get_shift && self.align_image.is_none() {
                bail!("Pair #{} needs shifts but the field has no align_image", i);
            }
        }
        for mosaic in &self.mosaics {
            if mosaic.out_root.trim().is_empty() {
                bail!("Mosaic of {} has no out_root", mosaic.pattern);
            }
        }
        Ok(())
    }

    pub fn pair_options(&self, pair: &PairRecipe) -> PairOptions {
        let sky = pair.sky_images.as_ref().unwrap_or(&self.sky_images);
        PairOptions {
            direct_asn: pair.direct.clone(),
            grism_asn: pair.grism.clone(),
            align_image: self.align_image.clone(),
            sky_images: sky.iter().map(PathBuf::from).collect(),
            skip_direct: pair.skip_direct,
            skip_grism: pair.skip_grism,
            get_shift: pair.get_shift,
            direct_order: pair.direct_order,
            grism_order: pair.grism_order,
        }
    }
}

/// Combine the associations of a mosaic recipe and drizzle them.
pub fn build_mosaic(ws: &Workspace, mosaic: &MosaicRecipe) -> Result<()> {
    let roots: Vec<String> = files::glob_in(&ws.dir, &mosaic.pattern)?
        .iter()
        .map(asn::root_of)
        .collect();
    shifts::combine_asn_shifts(&ws.dir, &roots, &mosaic.out_root)?;

    let cfg = &ws.config.drizzle;
    let params = DrizzleParams {
        skysub: mosaic.skysub,
        ra: mosaic.ra,
        dec: mosaic.dec,
        final_outnx: mosaic.final_outnx,
        final_outny: mosaic.final_outny,
        final_rot: mosaic.final_rot,
        ..DrizzleParams::final_pass(cfg.final_scale, cfg.pixfrac)
    };
    drizzle::start_multidrizzle(ws, &mosaic.out_root, &params)
}

/// Run every step of a field recipe inside its working directory.
pub fn run_field(ws: &Workspace, recipe: &FieldRecipe) -> Result<()> {
    recipe.validate()?;
    let ws = ws.at(ws.dir.join(&recipe.directory));
    tracing::info!("🌌 Field {} in {}", recipe.name, ws.dir.display());

    for copy in &recipe.shift_copies {
        let (from, to) = (ws.path(&copy.from), ws.path(&copy.to));
        fs::copy(&from, &to).with_context(|| {
            format!("Failed to copy {} to {}", from.display(), to.display())
        })?;
    }

    for pair in &recipe.pairs {
        pipeline::process_pair(&ws, &recipe.pair_options(pair))?;
    }

    for mosaic in &recipe.mosaics {
        build_mosaic(&ws, mosaic)
            .with_context(|| format!("Mosaic {} of field {}", mosaic.out_root, recipe.name))?;
    }

    if let Some(pattern) = &recipe.pointing_mosaics {
        for path in files::glob_in(&ws.dir, &format!("{}{}", pattern, asn::ASN_SUFFIX))? {
            let pointing = asn::root_of(&path);
            pipeline::mosaic_to_pointing(&ws, pattern, &pointing)?;
        }
    }

    if let Some(root) = &recipe.grism_subsets {
        pipeline::make_grism_subsets(&ws, root, None, true)?;
    }

    tracing::info!("✅ Field {} done", recipe.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn::AsnFile;
    use crate::config::Config;
    use crate::external::RecordingRunner;
    use tempfile::TempDir;

    const FIELD: &str = r#"
[[fields]]
name = "MARSHALL"
directory = "SN-MARSHALL/PREP_FLT"

[[fields.shift_copies]]
from = "ibfuw3070_shifts.txt"
to = "MARSHALL3-G_shifts.txt"

[[fields.mosaics]]
pattern = "MARSHALL[135]-G_asn.json"
out_root = "MARSHALLa"
ra = 34.4
final_outnx = 2000
"#;

    #[test]
    fn test_parse_field_recipe() {
        let config: Config = toml_edit::de::from_str(FIELD).unwrap();
        let field = config.find_field("marshall").unwrap();
        assert_eq!(field.directory, "SN-MARSHALL/PREP_FLT");
        assert_eq!(field.shift_copies[0].to, "MARSHALL3-G_shifts.txt");
        assert_eq!(field.mosaics[0].final_outnx, Some(2000));
        assert!(!field.mosaics[0].skysub);
        assert!(field.validate().is_ok());
    }

    #[test]
    fn test_validate_pairs() {
        let mut field: FieldRecipe = toml_edit::de::from_str(
            "name = \"GOODS-S\"\ndirectory = \".\"\n[[pairs]]\ndirect = \"ibhj06030\"\ngrism = \"ibhj06040\"\n",
        )
        .unwrap();
        assert_eq!(field.pairs[0].direct_order, 2);
        assert!(field.validate().unwrap_err().to_string().contains("align_image"));

        field.align_image = Some("../ECDFS/MUSYC_ECDFS_BVR.fits".into());
        assert!(field.validate().is_ok());

        field.pairs[0].grism = None;
        assert!(field.validate().is_err());
        field.pairs[0].skip_grism = true;
        assert!(field.validate().is_ok());
    }

    #[test]
    fn test_run_field_copies_shifts_and_builds_mosaic() {
        let base = TempDir::new().unwrap();
        let dir = base.path().join("SN-MARSHALL/PREP_FLT");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("ibfuw3070_shifts.txt"),
            "# refimage: x\nibfuw3a1q_flt.fits 1.0 2.0 0.0 1.0\n",
        )
        .unwrap();
        AsnFile::new("MARSHALL3-G", vec!["ibfuw3a1q".into()])
            .write(AsnFile::path_for(&dir, "MARSHALL3-G"))
            .unwrap();

        let config: Config = toml_edit::de::from_str(FIELD).unwrap();
        let runner = RecordingRunner::new();
        let ws = Workspace::new(base.path(), &config, &runner);
        run_field(&ws, &config.fields[0]).unwrap();

        assert!(dir.join("MARSHALL3-G_shifts.txt").exists());
        let combined = AsnFile::open(&dir, "MARSHALLa").unwrap();
        assert_eq!(combined.exposures, vec!["ibfuw3a1q"]);

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].cwd, dir);
        assert_eq!(calls[0].arg_value("ra"), Some("34.4"));
        assert_eq!(calls[0].arg_value("final_outnx"), Some("2000"));
        assert_eq!(calls[0].arg_value("skysub"), Some("no"));
    }
}
