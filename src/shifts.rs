//! Shift files (`<root>_shifts.txt`) and the alignment steps that produce them.

use anyhow::{bail, Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::asn::AsnFile;
use crate::external::{yes_no, Workspace};
use crate::files;
use crate::geometry;

#[derive(Debug, Clone, PartialEq)]
pub struct ShiftEntry {
    /// Exposure file name, e.g. `ib3728a1q_flt.fits`
    pub file: String,
    pub xshift: f64,
    pub yshift: f64,
    pub rotate: f64,
    pub scale: f64,
}

impl ShiftEntry {
    pub fn zero(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            xshift: 0.0,
            yshift: 0.0,
            rotate: 0.0,
            scale: 1.0,
        }
    }

    /// Exposure root, without the `_flt.fits` suffix.
    pub fn root(&self) -> &str {
        self.file
            .split_once("_flt")
            .map_or(self.file.as_str(), |(root, _)| root)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShiftFile {
    pub frame: String,
    pub refimage: String,
    pub form: String,
    pub units: String,
    pub entries: Vec<ShiftEntry>,
}

impl Default for ShiftFile {
    fn default() -> Self {
        Self {
            frame: "output".to_string(),
            refimage: String::new(),
            form: "delta".to_string(),
            units: "pixels".to_string(),
            entries: Vec::new(),
        }
    }
}

/// `<dir>/<root>_shifts.txt`
pub fn shiftfile_path(dir: &Path, root: &str) -> PathBuf {
    dir.join(format!("{}_shifts.txt", root))
}

impl ShiftFile {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read shift file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse shift file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut shifts = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                if let Some((key, value)) = comment.split_once(':') {
                    let value = value.trim().to_string();
                    match key.trim() {
                        "frame" => shifts.frame = value,
                        "refimage" => shifts.refimage = value,
                        "form" => shifts.form = value,
                        "units" => shifts.units = value,
                        _ => {}
                    }
                }
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                bail!("Malformed shift entry: {}", line);
            }
            let num = |i: usize, default: f64| -> Result<f64> {
                match fields.get(i) {
                    Some(v) => v
                        .parse::<f64>()
                        .with_context(|| format!("Bad number '{}' in: {}", v, line)),
                    None => Ok(default),
                }
            };
            shifts.entries.push(ShiftEntry {
                file: fields[0].to_string(),
                xshift: num(1, 0.0)?,
                yshift: num(2, 0.0)?,
                rotate: num(3, 0.0)?,
                scale: num(4, 1.0)?,
            });
        }
        Ok(shifts)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# frame: {}", self.frame);
        let _ = writeln!(out, "# refimage: {}", self.refimage);
        let _ = writeln!(out, "# form: {}", self.form);
        let _ = writeln!(out, "# units: {}", self.units);
        for e in &self.entries {
            let _ = writeln!(
                out,
                "{}    {:.4}    {:.4}    {:.4}     {:.4}",
                e.file, e.xshift, e.yshift, e.rotate, e.scale
            );
        }
        out
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_text())
            .with_context(|| format!("Failed to write shift file {}", path.display()))?;
        tracing::debug!("📝 Wrote {}", path.display());
        Ok(())
    }

    pub fn find(&self, root: &str) -> Option<&ShiftEntry> {
        self.entries.iter().find(|e| e.root() == root)
    }
}

/// Copy the shifts of a direct association onto its grism association by
/// exposure position. Extra grism exposures reuse the last direct entry.
pub fn make_grism_shiftfile(dir: &Path, direct_root: &str, grism_root: &str) -> Result<PathBuf> {
    let direct = ShiftFile::read(shiftfile_path(dir, direct_root))?;
    let grism = AsnFile::open(dir, grism_root)?;
    let Some(last) = direct.entries.last() else {
        bail!("Shift file for {} has no entries", direct_root);
    };

    let mut out = ShiftFile {
        entries: Vec::with_capacity(grism.exposures.len()),
        ..direct.clone()
    };
    for (i, exp) in grism.exposures.iter().enumerate() {
        let src = direct.entries.get(i).unwrap_or(last);
        out.entries.push(ShiftEntry {
            file: format!("{}_flt.fits", exp),
            ..src.clone()
        });
    }

    let path = shiftfile_path(dir, grism_root);
    out.write(&path)?;
    tracing::info!("↔️  Grism shifts {} <- {}", grism_root, direct_root);
    Ok(path)
}

/// Pair every `*<direct>*` association with its grism counterpart by sorted
/// position and derive the grism shift files.
pub fn make_grism_shiftfiles(dir: &Path, direct_pattern: &str, grism_pattern: &str) -> Result<usize> {
    let direct = files::glob_in(dir, direct_pattern)?;
    let grism = files::glob_in(dir, grism_pattern)?;
    if direct.len() != grism.len() {
        tracing::warn!(
            "⚠️  {} direct but {} grism associations, pairing the first {}",
            direct.len(),
            grism.len(),
            direct.len().min(grism.len())
        );
    }
    let mut n = 0;
    for (d, g) in direct.iter().zip(&grism) {
        make_grism_shiftfile(dir, &crate::asn::root_of(d), &crate::asn::root_of(g))?;
        n += 1;
    }
    Ok(n)
}

/// Make sure every exposure of the association has a shift entry, adding
/// zero shifts where needed. Creates the file when it is missing.
pub fn check_shiftfile(dir: &Path, asn_root: &str) -> Result<usize> {
    let asn = AsnFile::open(dir, asn_root)?;
    let path = shiftfile_path(dir, asn_root);
    let mut shifts = if path.exists() {
        ShiftFile::read(&path)?
    } else {
        ShiftFile {
            refimage: format!("{}_drz.fits[1]", asn_root),
            ..ShiftFile::default()
        }
    };

    let mut added = 0;
    for exp in &asn.exposures {
        if shifts.find(exp).is_none() {
            tracing::warn!("⚠️  No shift for {}, using zero", exp);
            shifts.entries.push(ShiftEntry::zero(format!("{}_flt.fits", exp)));
            added += 1;
        }
    }
    if added > 0 || !path.exists() {
        shifts.write(&path)?;
    }
    Ok(added)
}

/// Concatenate associations and their shift files into `<out_root>_asn.json`
/// and `<out_root>_shifts.txt`.
pub fn combine_asn_shifts(dir: &Path, asn_roots: &[String], out_root: &str) -> Result<AsnFile> {
    if asn_roots.is_empty() {
        bail!("No associations to combine into {}", out_root);
    }
    let mut combined = AsnFile::new(out_root, Vec::new());
    let mut shifts = ShiftFile {
        refimage: format!("{}_drz.fits[1]", out_root),
        ..ShiftFile::default()
    };
    for root in asn_roots {
        let asn = AsnFile::open(dir, root)?;
        let file = ShiftFile::read(shiftfile_path(dir, root))?;
        combined.exposures.extend(asn.exposures);
        shifts.entries.extend(file.entries);
    }
    combined.write(AsnFile::path_for(dir, out_root))?;
    shifts.write(shiftfile_path(dir, out_root))?;
    tracing::info!(
        "🧩 Combined {} associations into {} ({} exposures)",
        asn_roots.len(),
        out_root,
        combined.exposures.len()
    );
    Ok(combined)
}

/// Run the relative shift finder on an association.
pub fn run_tweakshifts(ws: &Workspace, asn_root: &str) -> Result<PathBuf> {
    let asn = AsnFile::open(&ws.dir, asn_root)?;
    let list = ws.path(&format!("{}_tweak.lst", asn_root));
    let text: String = asn
        .exposures
        .iter()
        .map(|e| format!("{}_flt.fits\n", e))
        .collect();
    fs::write(&list, text).with_context(|| format!("Failed to write {}", list.display()))?;

    let shiftfile = shiftfile_path(&ws.dir, asn_root);
    let args = vec![
        format!("input=@{}_tweak.lst", asn_root),
        format!("shiftfile={}_shifts.txt", asn_root),
        format!("reference={}_tweak.fits", asn_root),
        "output=".to_string(),
    ];
    ws.run_tool(&ws.config.tools.tweakshifts, args)
        .with_context(|| format!("Shift finder failed for {}", asn_root))?;
    files::remove_if_exists(&list)?;
    Ok(shiftfile)
}

/// Refine the shifts of an association against an external reference image
/// with the catalogue aligner, fitting `geometry` (e.g. `rxyscale`, `shift`).
pub fn refine_shifts(
    ws: &Workspace,
    asn_root: &str,
    align_image: &str,
    align_ext: usize,
    geometry: &str,
    clean: bool,
) -> Result<()> {
    let args = vec![
        format!("root={}", asn_root),
        format!("align_image={}", align_image),
        format!("align_ext={}", align_ext),
        format!("fitgeometry={}", geometry),
        format!("shiftfile={}_shifts.txt", asn_root),
        format!("clean={}", yes_no(clean)),
    ];
    ws.run_tool(&ws.config.tools.align, args).with_context(|| {
        format!(
            "Alignment of {} to {} ({}) failed",
            asn_root, align_image, geometry
        )
    })?;
    Ok(())
}

/// Drizzled images matching `pattern` whose footprints overlap the one of
/// `reference`.
pub fn find_overlapping_images(
    dir: &Path,
    reference: &Path,
    pattern: &str,
    ext: usize,
) -> Result<Vec<PathBuf>> {
    let ref_poly = geometry::wcs_polygon(reference, ext)?;
    let mut overlapping = Vec::new();
    for candidate in files::glob_in(dir, pattern)? {
        let poly = geometry::wcs_polygon(&candidate, ext)?;
        if geometry::polygons_overlap(&ref_poly, &poly) {
            tracing::debug!("Overlaps: {}", candidate.display());
            overlapping.push(candidate);
        }
    }
    Ok(overlapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SHIFTS: &str = "\
# frame: output
# refimage: ib3728050_drz.fits[1]
# form: delta
# units: pixels
ib3728a1q_flt.fits    0.0000    0.0000    0.0000     1.0000
ib3728a2q_flt.fits    1.2500    -0.5000    0.0010     1.0001
";

    fn setup(dir: &Path) {
        fs::write(shiftfile_path(dir, "direct"), SHIFTS).unwrap();
        AsnFile::new("direct", vec!["ib3728a1q".into(), "ib3728a2q".into()])
            .write(AsnFile::path_for(dir, "direct"))
            .unwrap();
        AsnFile::new(
            "grism",
            vec!["ib3728b1q".into(), "ib3728b2q".into(), "ib3728b3q".into()],
        )
        .write(AsnFile::path_for(dir, "grism"))
        .unwrap();
    }

    #[test]
    fn test_parse_and_format() {
        let shifts = ShiftFile::parse(SHIFTS).unwrap();
        assert_eq!(shifts.refimage, "ib3728050_drz.fits[1]");
        assert_eq!(shifts.entries.len(), 2);
        assert_eq!(shifts.entries[1].root(), "ib3728a2q");
        assert_eq!(shifts.entries[1].xshift, 1.25);
        assert_eq!(ShiftFile::parse(&shifts.to_text()).unwrap(), shifts);
    }

    #[test]
    fn test_short_rows_default_rotation_and_scale() {
        let shifts = ShiftFile::parse("a_flt.fits 1 2\n").unwrap();
        assert_eq!(shifts.entries[0].rotate, 0.0);
        assert_eq!(shifts.entries[0].scale, 1.0);
        assert!(ShiftFile::parse("a_flt.fits 1\n").is_err());
    }

    #[test]
    fn test_grism_shiftfile_reuses_last_entry() {
        let dir = TempDir::new().unwrap();
        setup(dir.path());
        make_grism_shiftfile(dir.path(), "direct", "grism").unwrap();
        let grism = ShiftFile::read(shiftfile_path(dir.path(), "grism")).unwrap();
        assert_eq!(grism.entries.len(), 3);
        assert_eq!(grism.entries[0].file, "ib3728b1q_flt.fits");
        assert_eq!(grism.entries[1].xshift, 1.25);
        assert_eq!(grism.entries[2].xshift, 1.25);
        assert_eq!(grism.refimage, "ib3728050_drz.fits[1]");
    }

    #[test]
    fn test_check_shiftfile_adds_missing() {
        let dir = TempDir::new().unwrap();
        setup(dir.path());
        // No shift file yet: all three get zero entries
        assert_eq!(check_shiftfile(dir.path(), "grism").unwrap(), 3);
        assert_eq!(check_shiftfile(dir.path(), "grism").unwrap(), 0);
        assert_eq!(check_shiftfile(dir.path(), "direct").unwrap(), 0);
    }

    #[test]
    fn test_combine_asn_shifts() {
        let dir = TempDir::new().unwrap();
        setup(dir.path());
        make_grism_shiftfile(dir.path(), "direct", "grism").unwrap();
        let combined =
            combine_asn_shifts(dir.path(), &["direct".into(), "grism".into()], "both").unwrap();
        assert_eq!(combined.exposures.len(), 5);
        let shifts = ShiftFile::read(shiftfile_path(dir.path(), "both")).unwrap();
        assert_eq!(shifts.entries.len(), 5);
        assert_eq!(AsnFile::open(dir.path(), "both").unwrap(), combined);
        assert!(combine_asn_shifts(dir.path(), &[], "none").is_err());
    }
}
