use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::recipes::FieldRecipe;

/// Main configuration structure for the reduction pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// External executables
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Background fitting parameters
    #[serde(default)]
    pub background: BackgroundConfig,
    /// Drizzle combination parameters
    #[serde(default)]
    pub drizzle: DrizzleConfig,
    /// Grism geometry used for region files and edge trimming
    #[serde(default)]
    pub grism: GrismConfig,
    /// Input and reference locations
    #[serde(default)]
    pub paths: PathsConfig,
    /// Survey field recipes
    #[serde(default)]
    pub fields: Vec<FieldRecipe>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Drizzle/resampling executable (default: "multidrizzle")
    pub multidrizzle: String,
    /// Blot executable (default: "blot")
    pub blot: String,
    /// Source extractor executable (default: "sex")
    pub sextractor: String,
    /// Initial shift finder (default: "tweakshifts")
    pub tweakshifts: String,
    /// Catalogue alignment against a reference image (default: "align_to_reference")
    pub align: String,
    /// Wall-clock limit per external call, human readable (default: "2h")
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Detector grid width for the basis (default: 1014)
    pub grid_width: usize,
    /// Detector grid height for the basis (default: 1014)
    pub grid_height: usize,
    /// Largest DQ value still considered good, exclusive (default: 10)
    pub dq_max: i32,
    /// Pixels must be above this value to enter the fit (default: -1)
    pub min_value: f32,
    /// Pixels must be below this value to enter the fit (default: 4)
    pub max_value: f32,
    /// Column bin width of the 1-D refinement after refitting (default: 26)
    pub oned_nbin: usize,
    /// DQ bit excluded from the 1-D refinement (default: 4096)
    pub oned_dq_bit: i32,
    /// Number of 1-D refinement iterations (default: 4)
    pub oned_iterations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrizzleConfig {
    /// Output pixel scale in arcsec (default: 0.06)
    pub final_scale: f64,
    /// Drop size (default: 0.8)
    pub pixfrac: f64,
    /// Drop size used for small associations (default: 1.0)
    pub small_asn_pixfrac: f64,
    /// Associations with fewer exposures use `small_asn_pixfrac` (default: 4)
    pub small_asn_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrismConfig {
    /// 0th-order x offset polynomial: c0 + c1*x + c2*y (aXe XOFF_B)
    pub zeroth_offset: [f64; 3],
    /// Height of the sampled first-order trace in pixels (default: 10)
    pub beam_width: usize,
    /// aXe configuration file providing BEAMA
    pub axe_config: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding pipeline FLT files (default: "../RAW")
    pub raw: String,
    /// Reference file directory for flats; `$iref` when unset
    pub iref: Option<String>,
    /// Convolution filter for direct images; built-in 3x3 pyramid when unset
    pub direct_conv: Option<String>,
    /// Convolution filter for grism images; built-in default when unset
    pub grism_conv: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            multidrizzle: "multidrizzle".to_string(),
            blot: "blot".to_string(),
            sextractor: "sex".to_string(),
            tweakshifts: "tweakshifts".to_string(),
            align: "align_to_reference".to_string(),
            timeout: Some("2h".to_string()),
        }
    }
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            grid_width: 1014,
            grid_height: 1014,
            dq_max: 10,
            min_value: -1.0,
            max_value: 4.0,
            oned_nbin: 26,
            oned_dq_bit: 4096,
            oned_iterations: 4,
        }
    }
}

impl Default for DrizzleConfig {
    fn default() -> Self {
        Self {
            final_scale: 0.06,
            pixfrac: 0.8,
            small_asn_pixfrac: 1.0,
            small_asn_threshold: 4,
        }
    }
}

impl Default for GrismConfig {
    fn default() -> Self {
        Self {
            zeroth_offset: [-192.2400520, -0.0023144, 0.0111089],
            beam_width: 10,
            axe_config: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw: "../RAW".to_string(),
            iref: None,
            direct_conv: None,
            grism_conv: None,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml_edit::de::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_string = toml_edit::ser::to_string_pretty(self)
            .context("Failed to serialize configuration to TOML")?;

        std::fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Load from `path` when given, otherwise defaults.
    pub fn load_or_default(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    /// Merge configuration with command line arguments, prioritizing CLI values
    pub fn merge_with_cli(
        &mut self,
        raw_dir: Option<String>,
        final_scale: Option<f64>,
        pixfrac: Option<f64>,
        timeout: Option<String>,
    ) {
        if let Some(raw) = raw_dir {
            self.paths.raw = raw;
        }
        if let Some(scale) = final_scale {
            self.drizzle.final_scale = scale;
        }
        if let Some(pf) = pixfrac {
            self.drizzle.pixfrac = pf;
        }
        if let Some(t) = timeout {
            self.tools.timeout = Some(t);
        }
    }

    pub fn get_timeout(&self) -> Duration {
        let timeout_str = self.tools.timeout.as_deref().unwrap_or("2h");
        humantime::parse_duration(timeout_str).unwrap_or(Duration::from_secs(7200))
    }

    /// Flat-field reference directory: config, then the `iref` environment variable.
    pub fn get_iref(&self) -> Option<PathBuf> {
        self.paths
            .iref
            .clone()
            .or_else(|| std::env::var("iref").ok())
            .map(PathBuf::from)
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldRecipe> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let tools = [
            ("multidrizzle", &self.tools.multidrizzle),
            ("blot", &self.tools.blot),
            ("sextractor", &self.tools.sextractor),
            ("tweakshifts", &self.tools.tweakshifts),
            ("align", &self.tools.align),
        ];
        for (name, value) in tools {
            if value.trim().is_empty() {
                return Err(anyhow::anyhow!("Tool path for '{}' must not be empty", name));
            }
        }

        if let Some(ref timeout_str) = self.tools.timeout {
            let timeout = humantime::parse_duration(timeout_str)
                .with_context(|| format!("Invalid timeout format: {}", timeout_str))?;
            if timeout.is_zero() {
                return Err(anyhow::anyhow!("Tool timeout must be greater than 0"));
            }
        }

        let bg = &self.background;
        if bg.grid_width == 0 || bg.grid_height == 0 {
            return Err(anyhow::anyhow!(
                "Background grid must be non-empty, got {}x{}",
                bg.grid_width,
                bg.grid_height
            ));
        }
        if bg.min_value >= bg.max_value {
            return Err(anyhow::anyhow!(
                "Background value window is empty: ({}, {})",
                bg.min_value,
                bg.max_value
            ));
        }
        if bg.oned_nbin == 0 {
            return Err(anyhow::anyhow!("1-D bin width must be at least 1"));
        }

        let dz = &self.drizzle;
        if dz.final_scale <= 0.0 {
            return Err(anyhow::anyhow!(
                "final_scale must be positive, got: {}",
                dz.final_scale
            ));
        }
        if dz.pixfrac <= 0.0 || dz.small_asn_pixfrac <= 0.0 {
            return Err(anyhow::anyhow!("pixfrac values must be positive"));
        }

        for field in &self.fields {
            field
                .validate()
                .with_context(|| format!("Invalid recipe for field {}", field.name))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tools.multidrizzle, "multidrizzle");
        assert_eq!(config.tools.sextractor, "sex");
        assert_eq!(config.background.grid_width, 1014);
        assert_eq!(config.background.dq_max, 10);
        assert_eq!(config.background.oned_nbin, 26);
        assert_eq!(config.drizzle.final_scale, 0.06);
        assert_eq!(config.drizzle.pixfrac, 0.8);
        assert_eq!(config.paths.raw, "../RAW");
        assert_eq!(config.get_timeout(), Duration::from_secs(7200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_string = toml_edit::ser::to_string_pretty(&config).unwrap();

        assert!(toml_string.contains("[tools]"));
        assert!(toml_string.contains("[background]"));
        assert!(toml_string.contains("[drizzle]"));
        assert!(toml_string.contains("[grism]"));

        let parsed: Config = toml_edit::de::from_str(&toml_string).unwrap();
        assert_eq!(parsed.background.grid_height, config.background.grid_height);
        assert_eq!(parsed.grism.zeroth_offset, config.grism.zeroth_offset);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml_edit::de::from_str(
            r#"
[drizzle]
final_scale = 0.128
"#,
        )
        .unwrap();
        assert_eq!(parsed.drizzle.final_scale, 0.128);
        assert_eq!(parsed.drizzle.pixfrac, 0.8);
        assert_eq!(parsed.tools.blot, "blot");
        assert_eq!(parsed.background.dq_max, 10);
        assert!(parsed.fields.is_empty());
    }

    #[test]
    fn test_demo_config_parses() {
        let parsed: Config =
            toml_edit::de::from_str(include_str!("../demos/goods-s.toml")).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.get_timeout(), Duration::from_secs(5400));
        let field = parsed.find_field("goods-s").unwrap();
        assert_eq!(field.pairs.len(), 2);
        assert_eq!(field.pairs[1].grism_order, 0);
        assert_eq!(field.shift_copies[0].to, "GOODS-S-1-G_shifts.txt");
        assert_eq!(field.mosaics[0].final_outnx, Some(4200));
    }

    #[test]
    fn test_config_merge_with_cli() {
        let mut config = Config::default();
        config.merge_with_cli(
            Some("/data/RAW".to_string()),
            Some(0.1),
            None,
            Some("30m".to_string()),
        );
        assert_eq!(config.paths.raw, "/data/RAW");
        assert_eq!(config.drizzle.final_scale, 0.1);
        assert_eq!(config.drizzle.pixfrac, 0.8);
        assert_eq!(config.get_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.to_file(temp_file.path()).unwrap();

        let loaded = Config::from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.tools.align, config.tools.align);
        assert_eq!(loaded.background.oned_dq_bit, 4096);
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let mut config = Config::default();
        config.tools.timeout = Some("soon".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid timeout format"));
        // Falls back to the default when read
        assert_eq!(config.get_timeout(), Duration::from_secs(7200));
    }

    #[test]
    fn test_inverted_value_window_rejected() {
        let mut config = Config::default();
        config.background.min_value = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_tool_rejected() {
        let mut config = Config::default();
        config.tools.blot = " ".to_string();
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("'blot'"));
    }
}
