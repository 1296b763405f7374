//! Association tables: a drizzle product and the exposures that make it up.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::fits_io::{self, FitsFile};

pub const ASN_SUFFIX: &str = "_asn.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsnFile {
    /// Name of the combined product, e.g. `GOODS-S-12-G`
    pub product: String,
    /// Exposure roots, e.g. `ibhj06n3q`
    pub exposures: Vec<String>,
}

impl AsnFile {
    pub fn new(product: impl Into<String>, exposures: Vec<String>) -> Self {
        Self {
            product: product.into(),
            exposures,
        }
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read association: {}", path.display()))?;
        let asn: AsnFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse association: {}", path.display()))?;
        if asn.exposures.is_empty() {
            bail!("Association {} lists no exposures", path.display());
        }
        Ok(asn)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write association: {}", path.display()))?;
        tracing::debug!("📝 Wrote {}", path.display());
        Ok(())
    }

    /// `<dir>/<root>_asn.json`
    pub fn path_for(dir: &Path, root: &str) -> PathBuf {
        dir.join(format!("{}{}", root, ASN_SUFFIX))
    }

    /// Read `<dir>/<root>_asn.json`.
    pub fn open(dir: &Path, root: &str) -> Result<Self> {
        Self::read(Self::path_for(dir, root))
    }

    pub fn len(&self) -> usize {
        self.exposures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exposures.is_empty()
    }
}

/// Association root of a path or name: `dir/ib3728050_asn.json` gives
/// `ib3728050`. Names without an `_asn` suffix are returned unchanged.
pub fn root_of<P: AsRef<Path>>(path: P) -> String {
    let name = path
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.find("_asn") {
        Some(i) => name[..i].to_string(),
        None => name,
    }
}

/// Header values that decide the target-based product name.
#[derive(Debug, Clone, Default)]
pub struct TargetInfo {
    pub filter: String,
    pub targname: String,
    pub date_obs: Option<String>,
    pub time_obs: Option<String>,
}

impl TargetInfo {
    pub fn from_fits<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = FitsFile::open(path.as_ref())?;
        let header = file.header(0, &["FILTER", "TARGNAME", "DATE-OBS", "TIME-OBS"])?;
        let get = |key: &str| header.get_str(key).map(|s| s.trim().to_string());
        Ok(Self {
            filter: get("FILTER")
                .ok_or_else(|| anyhow!("{} has no FILTER", path.as_ref().display()))?,
            targname: get("TARGNAME")
                .ok_or_else(|| anyhow!("{} has no TARGNAME", path.as_ref().display()))?,
            date_obs: get("DATE-OBS"),
            time_obs: get("TIME-OBS"),
        })
    }
}

/// Survey product name for an association, e.g. `COSMOS-3-D` or `PRIMO-1026-G`.
pub fn target_product_name(info: &TargetInfo, first_exposure: &str) -> Result<String> {
    let kind = if info.filter.starts_with('F') { 'D' } else { 'G' };

    let mut target = info
        .targname
        .replace("SOUTH", "S")
        .replace("GNGRISM", "GOODS-N-")
        .replace("GEORGE", "GEORGE-");

    if target == "MARSHALL" {
        // Pointing number is the sixth character of the rootname
        let id = first_exposure
            .chars()
            .nth(5)
            .ok_or_else(|| anyhow!("Exposure root '{}' is too short", first_exposure))?;
        target.push(id);
    }

    if target == "PRIMO" {
        let date = info
            .date_obs
            .as_deref()
            .ok_or_else(|| anyhow!("PRIMO exposure without DATE-OBS"))?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .with_context(|| format!("Bad DATE-OBS '{}'", date))?;
        target = format!("{}-{:02}{:02}", target, date.month(), date.day());
    }

    if target.starts_with("GEORGE") {
        let time = info
            .time_obs
            .as_deref()
            .ok_or_else(|| anyhow!("GEORGE exposure without TIME-OBS"))?;
        let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
            .with_context(|| format!("Bad TIME-OBS '{}'", time))?;
        target = if time.hour() > 12 {
            "GEORGE-2".to_string()
        } else {
            "GEORGE-1".to_string()
        };
    }

    Ok(format!("{}-{}", target, kind))
}

/// Rename an association after its target, reading the first exposure from
/// `raw_dir`. With `newfile` the renamed association is written next to the
/// original. Returns the new association path.
pub fn make_targname_asn(asn_path: &Path, raw_dir: &Path, newfile: bool) -> Result<PathBuf> {
    let mut asn = AsnFile::read(asn_path)?;
    let first = &asn.exposures[0];
    let raw = fits_io::find_fits_gz(raw_dir.join(format!("{}_flt.fits", first)))?;
    let info = TargetInfo::from_fits(&raw)?;
    let product = target_product_name(&info, first)?;

    tracing::info!("🏷️  {} -> {}", root_of(asn_path), product);
    asn.product = product.clone();
    let dir = asn_path.parent().unwrap_or(Path::new("."));
    let out = AsnFile::path_for(dir, &product);
    if newfile {
        asn.write(&out)?;
    }
    Ok(out)
}

/// Copy the raw FLT files of an association into `dest`, replacing any
/// processed copies. Gzipped raw files are unpacked on the way.
pub fn fresh_flt_files(asn: &AsnFile, raw_dir: &Path, dest: &Path) -> Result<usize> {
    for exp in &asn.exposures {
        let name = format!("{}_flt.fits", exp);
        let src = fits_io::find_fits_gz(raw_dir.join(&name))?;
        let dst = dest.join(&name);
        fits_io::copy_fits(&src, &dst)?;
        tracing::debug!("Copied {} -> {}", src.display(), dst.display());
    }
    tracing::info!(
        "📂 Fresh FLT files for {} ({} exposures)",
        asn.product,
        asn.exposures.len()
    );
    Ok(asn.exposures.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(filter: &str, targ: &str) -> TargetInfo {
        TargetInfo {
            filter: filter.into(),
            targname: targ.into(),
            date_obs: Some("2010-10-26".into()),
            time_obs: Some("14:03:11".into()),
        }
    }

    #[test]
    fn test_root_of() {
        assert_eq!(root_of("ib3728050_asn.json"), "ib3728050");
        assert_eq!(root_of("/data/GOODS-S-1-D_asn.fits"), "GOODS-S-1-D");
        assert_eq!(root_of("plain"), "plain");
    }

    #[test]
    fn test_target_product_names() {
        assert_eq!(
            target_product_name(&info("F140W", "GOODS-SOUTH-12"), "ibhj06n3q").unwrap(),
            "GOODS-S-12-D"
        );
        assert_eq!(
            target_product_name(&info("G141", "GNGRISM22"), "ib3722aaq").unwrap(),
            "GOODS-N-22-G"
        );
        assert_eq!(
            target_product_name(&info("G141", "MARSHALL"), "ibfuw3a1q").unwrap(),
            "MARSHALL3-G"
        );
        assert_eq!(
            target_product_name(&info("G141", "PRIMO"), "ib0000000").unwrap(),
            "PRIMO-1026-G"
        );
        assert_eq!(
            target_product_name(&info("G141", "GEORGE"), "ibfug1a1q").unwrap(),
            "GEORGE-2-G"
        );
        let mut morning = info("G141", "GEORGE");
        morning.time_obs = Some("09:00:00".into());
        assert_eq!(
            target_product_name(&morning, "ibfug1a1q").unwrap(),
            "GEORGE-1-G"
        );
    }

    #[test]
    fn test_read_write_round_trip() {
        let dir = TempDir::new().unwrap();
        let asn = AsnFile::new("ib3728050", vec!["ib3728a1q".into(), "ib3728a2q".into()]);
        let path = AsnFile::path_for(dir.path(), "ib3728050");
        asn.write(&path).unwrap();
        assert_eq!(AsnFile::open(dir.path(), "ib3728050").unwrap(), asn);
    }

    #[test]
    fn test_empty_association_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x_asn.json");
        fs::write(&path, r#"{"product":"x","exposures":[]}"#).unwrap();
        assert!(AsnFile::read(&path).is_err());
    }

    #[test]
    fn test_make_targname_asn_from_raw_header() {
        use crate::fits_io::{write_image, Header};
        use crate::image::Image;

        let raw = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let mut header = Header::new();
        header.set("FILTER", "F140W");
        header.set("TARGNAME", "COSMOS-3");
        write_image(raw.path().join("ibhm51x1q_flt.fits"), &Image::new(4, 4), &header).unwrap();

        let asn_path = AsnFile::path_for(work.path(), "ibhm51030");
        AsnFile::new("ibhm51030", vec!["ibhm51x1q".into()])
            .write(&asn_path)
            .unwrap();

        let out = make_targname_asn(&asn_path, raw.path(), true).unwrap();
        assert_eq!(out, work.path().join("COSMOS-3-D_asn.json"));
        let renamed = AsnFile::read(&out).unwrap();
        assert_eq!(renamed.product, "COSMOS-3-D");
        assert_eq!(renamed.exposures, vec!["ibhm51x1q"]);
    }

    #[test]
    fn test_fresh_flt_files_copies() {
        let raw = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        fs::write(raw.path().join("a_flt.fits"), b"raw").unwrap();
        fs::write(work.path().join("a_flt.fits"), b"processed").unwrap();
        let asn = AsnFile::new("p", vec!["a".into()]);
        assert_eq!(fresh_flt_files(&asn, raw.path(), work.path()).unwrap(), 1);
        assert_eq!(fs::read(work.path().join("a_flt.fits")).unwrap(), b"raw");

        let missing = AsnFile::new("p", vec!["b".into()]);
        assert!(fresh_flt_files(&missing, raw.path(), work.path()).is_err());
    }

    #[test]
    fn test_gzipped_raw_archive() {
        use crate::fits_io::tests::{gzip_file, write_test_flt};
        use crate::fits_io::{read_hdus, write_hdus, CardValue, Exposure};
        use crate::image::{Image, IntImage};

        let raw = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let sci = Image::from_fn(4, 4, |col, row| (col + 4 * row) as f32);
        for root in ["ib3728a1q", "ib3728a2q"] {
            let path = write_test_flt(raw.path(), root, &sci, &IntImage::new(4, 4), "G141");
            let mut hdus = read_hdus(&path).unwrap();
            hdus[0].set("TARGNAME", &CardValue::from("GNGRISM28"));
            write_hdus(&path, &hdus).unwrap();
            gzip_file(&path);
            fs::remove_file(&path).unwrap();
        }

        let asn_path = AsnFile::path_for(work.path(), "ib3728050");
        let asn = AsnFile::new("ib3728050", vec!["ib3728a1q".into(), "ib3728a2q".into()]);
        asn.write(&asn_path).unwrap();
        let out = make_targname_asn(&asn_path, raw.path(), false).unwrap();
        assert_eq!(out, work.path().join("GOODS-N-28-G_asn.json"));

        assert_eq!(fresh_flt_files(&asn, raw.path(), work.path()).unwrap(), 2);
        let copied = work.path().join("ib3728a2q_flt.fits");
        assert!(copied.exists());
        assert!(!work.path().join("ib3728a2q_flt.fits.gz").exists());
        let exp = Exposure::open_in(work.path(), "ib3728a2q").unwrap();
        assert_eq!(exp.path, copied);
        assert_eq!(exp.sci.get(3, 2), 11.0);
        assert_eq!(exp.primary.get_str("TARGNAME"), Some("GNGRISM28"));
    }
}
