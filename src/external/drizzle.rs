use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::{yes_no, Workspace};
use crate::asn::AsnFile;
use crate::files;
use crate::fits_io::{self, FitsFile, Header, WCS_COPY_KEYS};

/// Detector size that needs no `refpix` rewrite in the coeffs file.
const NATIVE_SHAPE: (usize, usize) = (1014, 1014);

/// Intermediate drizzle products removed by `clean`.
const INTERMEDIATE_PATTERNS: &[&str] = &[
    "*single_sci.fits",
    "*single_wht.fits",
    "*_crmask.fits",
    "*_med.fits",
    "*blt.fits",
    "*_dqmask.fits",
    "*_final_mask.fits",
    "*_input.lst",
];

/// Parameters of one drizzle-tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct DrizzleParams {
    pub use_shiftfile: bool,
    pub skysub: bool,
    pub updatewcs: bool,
    pub driz_cr: bool,
    /// Also drives `blot`, `driz_separate` and `static`
    pub median: bool,
    pub final_scale: f64,
    pub pixfrac: f64,
    pub clean: bool,
    pub final_outnx: Option<usize>,
    pub final_outny: Option<usize>,
    pub final_rot: f64,
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    /// Output grid reference, e.g. `GOODS-S-D_drz.fits[1]`
    pub refimage: Option<String>,
}

impl Default for DrizzleParams {
    fn default() -> Self {
        Self {
            use_shiftfile: true,
            skysub: true,
            updatewcs: true,
            driz_cr: true,
            median: true,
            final_scale: 0.06,
            pixfrac: 0.8,
            clean: true,
            final_outnx: None,
            final_outny: None,
            final_rot: 0.0,
            ra: None,
            dec: None,
            refimage: None,
        }
    }
}

impl DrizzleParams {
    /// Defaults for a re-drizzle of already processed exposures: no sky,
    /// CR rejection, median or WCS update.
    pub fn final_pass(final_scale: f64, pixfrac: f64) -> Self {
        Self {
            skysub: false,
            updatewcs: false,
            driz_cr: false,
            median: false,
            final_scale,
            pixfrac,
            ..Self::default()
        }
    }

    /// `key=value` arguments. Unset optional values are left out.
    pub fn to_args(&self, root: &str, input_list: &str) -> Vec<String> {
        let mut args = vec![
            format!("input=@{}", input_list),
            format!("output={}", root),
        ];
        if self.use_shiftfile {
            args.push(format!("shiftfile={}_shifts.txt", root));
        }
        for (key, value) in [
            ("skysub", self.skysub),
            ("updatewcs", self.updatewcs),
            ("driz_cr", self.driz_cr),
            ("median", self.median),
            ("blot", self.median),
            ("driz_separate", self.median),
            ("static", self.median),
        ] {
            args.push(format!("{}={}", key, yes_no(value)));
        }
        args.push(format!("final_scale={}", self.final_scale));
        args.push(format!("final_pixfrac={}", self.pixfrac));
        args.push(format!("final_rot={}", self.final_rot));
        if let Some(nx) = self.final_outnx {
            args.push(format!("driz_sep_outnx={}", nx));
            args.push(format!("final_outnx={}", nx));
        }
        if let Some(ny) = self.final_outny {
            args.push(format!("driz_sep_outny={}", ny));
            args.push(format!("final_outny={}", ny));
        }
        if let Some(ra) = self.ra {
            args.push(format!("ra={}", ra));
        }
        if let Some(dec) = self.dec {
            args.push(format!("dec={}", dec));
        }
        if let Some(refimage) = self.refimage.as_deref().filter(|r| !r.is_empty()) {
            args.push(format!("refimage={}", refimage));
        }
        args
    }
}

/// Drizzle the exposures of `<root>_asn.json` into `<root>_drz.fits`.
pub fn start_multidrizzle(ws: &Workspace, asn_root: &str, params: &DrizzleParams) -> Result<()> {
    let asn = AsnFile::open(&ws.dir, asn_root)?;
    let cfg = &ws.config.drizzle;

    let mut params = params.clone();
    if asn.exposures.len() < cfg.small_asn_threshold {
        tracing::debug!(
            "{} has {} exposures, pixfrac {} -> {}",
            asn_root,
            asn.exposures.len(),
            params.pixfrac,
            cfg.small_asn_pixfrac
        );
        params.pixfrac = cfg.small_asn_pixfrac;
    }

    let input_list = format!("{}_input.lst", asn_root);
    let text: String = asn
        .exposures
        .iter()
        .map(|e| format!("{}_flt.fits\n", e))
        .collect();
    fs::write(ws.path(&input_list), text)
        .with_context(|| format!("Failed to write {}", input_list))?;

    tracing::info!(
        "🌀 Drizzling {} ({} exposures, scale {}\", pixfrac {})",
        asn_root,
        asn.exposures.len(),
        params.final_scale,
        params.pixfrac
    );
    ws.run_tool(
        &ws.config.tools.multidrizzle,
        params.to_args(asn_root, &input_list),
    )
    .with_context(|| format!("Drizzle failed for {}", asn_root))?;

    if params.clean {
        clean_drizzle_output(&ws.dir)?;
    }
    Ok(())
}

/// Remove intermediate drizzle products from `dir`.
pub fn clean_drizzle_output(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for pattern in INTERMEDIATE_PATTERNS {
        removed += files::remove_matching(dir, pattern)?;
    }
    tracing::debug!("🗑️  Removed {} intermediate drizzle files", removed);
    Ok(removed)
}

/// Per-exposure geometry used by a drizzle run.
#[derive(Debug, Clone, PartialEq)]
pub struct DrizzleRun {
    /// Product root, e.g. `IB3728050`
    pub root: String,
    /// Exposure file roots, e.g. `ib3728a1q_flt`
    pub flt: Vec<String>,
    pub xsh: Vec<f64>,
    pub ysh: Vec<f64>,
    pub rot: Vec<f64>,
    /// Exposure times, when recorded
    pub exptime: Vec<Option<f64>>,
    pub scale: f64,
}

impl DrizzleRun {
    /// Parse the `.run` log the drizzle tool leaves behind.
    pub fn parse_run(root: &str, text: &str) -> Result<Self> {
        let mut run = Self {
            root: root.to_string(),
            flt: Vec::new(),
            xsh: Vec::new(),
            ysh: Vec::new(),
            rot: Vec::new(),
            exptime: Vec::new(),
            scale: 1.0,
        };
        for line in text.lines() {
            if line.starts_with("drizzle.scale") {
                let value = line
                    .split_whitespace()
                    .nth(2)
                    .ok_or_else(|| anyhow!("Malformed scale line: {}", line))?;
                run.scale = value
                    .parse()
                    .with_context(|| format!("Bad drizzle scale '{}'", value))?;
            }
            if line.starts_with("drizzle ") {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let Some(input) = parts.get(1) else {
                    bail!("Malformed drizzle line: {}", line);
                };
                let flt = input.split(".fits").next().unwrap_or(input);
                run.flt.push(flt.to_string());
                run.exptime.push(None);
                for tag in &parts {
                    let Some((key, value)) = tag.split_once('=') else {
                        continue;
                    };
                    let target = match key {
                        k if k.starts_with("xsh") => &mut run.xsh,
                        k if k.starts_with("ysh") => &mut run.ysh,
                        k if k.starts_with("rot") => &mut run.rot,
                        _ => continue,
                    };
                    target.push(
                        value
                            .parse()
                            .with_context(|| format!("Bad value in '{}'", tag))?,
                    );
                }
            }
        }
        if run.xsh.len() != run.flt.len()
            || run.ysh.len() != run.flt.len()
            || run.rot.len() != run.flt.len()
        {
            bail!("Run file for {} is missing xsh/ysh/rot values", root);
        }
        Ok(run)
    }

    /// Read `<ROOT>.run`, trying the upper-case root first.
    pub fn from_run_file(dir: &Path, asn_root: &str) -> Result<Self> {
        let upper = asn_root.to_uppercase();
        let path = [&upper, asn_root]
            .iter()
            .map(|r| dir.join(format!("{}.run", r)))
            .find(|p| p.exists())
            .ok_or_else(|| anyhow!("No drizzle run file for {} in {}", asn_root, dir.display()))?;
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse_run(asn_root, &text)
    }

    /// Read the `D###` keywords of a drizzled product's primary header.
    pub fn from_drz_header(path: &Path) -> Result<Self> {
        let file = FitsFile::open(path)?;
        let root = files::stem_before(path, "_drz.fits").unwrap_or_default();
        let mut run = Self {
            root,
            flt: Vec::new(),
            xsh: Vec::new(),
            ysh: Vec::new(),
            rot: Vec::new(),
            exptime: Vec::new(),
            scale: 0.0,
        };
        let mut i = 1;
        loop {
            let key = |suffix: &str| format!("D{:03}{}", i, suffix);
            let Some(xsh) = file.value(0, &key("XSH"))?.and_then(|v| v.as_f64()) else {
                break;
            };
            let data = file
                .value(0, &key("DATA"))?
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| anyhow!("{} missing in {}", key("DATA"), path.display()))?;
            let get = |suffix: &str| -> Result<f64> {
                file.value(0, &key(suffix))?
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| anyhow!("{} missing in {}", key(suffix), path.display()))
            };
            run.flt
                .push(data.split(".fits").next().unwrap_or(&data).to_string());
            run.xsh.push(xsh);
            run.ysh.push(get("YSH")?);
            run.rot.push(get("ROT")?);
            run.exptime.push(Some(get("DEXP")?));
            run.scale += get("SCAL")?;
            i += 1;
        }
        if run.flt.is_empty() {
            bail!("{} has no D### drizzle keywords", path.display());
        }
        run.scale /= run.flt.len() as f64;
        Ok(run)
    }

    pub fn count(&self) -> usize {
        self.flt.len()
    }

    fn drz_path(&self, dir: &Path) -> Result<PathBuf> {
        let candidates = [self.root.clone(), self.root.to_uppercase(), self.root.to_lowercase()];
        candidates
            .iter()
            .map(|r| dir.join(format!("{}_drz.fits", r)))
            .find(|p| p.exists())
            .ok_or_else(|| anyhow!("No drizzled product for {} in {}", self.root, dir.display()))
    }

    /// Blot the drizzled product back onto exposure `ii`, writing
    /// `<flt>.BLOT.SCI.fits` and `<flt>.BLOT.WHT.fits`.
    pub fn blot_back(
        &self,
        ws: &Workspace,
        ii: usize,
        copy_new: bool,
        shape: Option<(usize, usize)>,
    ) -> Result<()> {
        let flt = self
            .flt
            .get(ii)
            .ok_or_else(|| anyhow!("Exposure #{} not in drizzle run of {}", ii, self.root))?;

        let flt_file = ws.path(&format!("{}.fits", flt));
        let (exptime, native_shape) = match FitsFile::open(&flt_file) {
            Ok(file) => {
                let exptime = file.value(0, "EXPTIME")?.and_then(|v| v.as_f64());
                let nx = file.value(1, "NAXIS1")?.and_then(|v| v.as_i64());
                let ny = file.value(1, "NAXIS2")?.and_then(|v| v.as_i64());
                let shape = match (nx, ny) {
                    (Some(nx), Some(ny)) => (nx as usize, ny as usize),
                    _ => NATIVE_SHAPE,
                };
                (exptime, shape)
            }
            Err(e) => {
                tracing::warn!("⚠️  Cannot read {}: {}", flt_file.display(), e);
                (None, NATIVE_SHAPE)
            }
        };
        let exptime = self
            .exptime
            .get(ii)
            .copied()
            .flatten()
            .or(exptime)
            .unwrap_or(1.0);
        let (nx, ny) = shape.unwrap_or(native_shape);

        let coeffs = ws.path(&format!("{}_coeffs1.dat", flt));
        let text = fs::read_to_string(&coeffs)
            .with_context(|| format!("Failed to read {}", coeffs.display()))?;
        let blot_coeffs = format!("{}_coeffs1.blot.dat", flt);
        fs::write(ws.path(&blot_coeffs), rewrite_refpix(&text, (nx, ny)))
            .with_context(|| format!("Failed to write {}", blot_coeffs))?;

        files::remove_matching(&ws.dir, &format!("{}.BLOT.*.fits", flt))?;
        if copy_new || !ws.path("drz_sci.fits").exists() {
            self.copy_drz_planes(ws)?;
        }

        for (plane, out) in [("drz_sci.fits", "SCI"), ("drz_wht.fits", "WHT")] {
            let args = vec![
                format!("data={}", plane),
                format!("outdata={}.BLOT.{}.fits", flt, out),
                format!("scale={}", self.scale),
                format!("coeffs={}", blot_coeffs),
                format!("xsh={}", self.xsh[ii]),
                format!("ysh={}", self.ysh[ii]),
                format!("rot={}", self.rot[ii]),
                format!("outnx={}", nx),
                format!("outny={}", ny),
                "align=center".to_string(),
                "shft_un=input".to_string(),
                "shft_fr=input".to_string(),
                "in_un=cps".to_string(),
                "out_un=cps".to_string(),
                "interpol=poly5".to_string(),
                "sinscl=1.0".to_string(),
                format!("expout={}", exptime),
                "expkey=EXPTIME".to_string(),
                "fillval=0.0".to_string(),
            ];
            ws.run_tool(&ws.config.tools.blot, args)
                .with_context(|| format!("Blot of {} onto {} failed", plane, flt))?;
        }

        files::remove_matching(&ws.dir, "drz_*.fits")?;
        files::remove_if_exists(&ws.path(&blot_coeffs))?;
        Ok(())
    }

    /// Copy SCI and WHT of the drizzled product into header-stripped
    /// `drz_sci.fits` and `drz_wht.fits` that keep the WCS.
    fn copy_drz_planes(&self, ws: &Workspace) -> Result<()> {
        files::remove_matching(&ws.dir, "drz_*.fits")?;
        let drz_path = self.drz_path(&ws.dir)?;
        let drz = FitsFile::open(&drz_path)?;

        let mut header = drz.header(1, WCS_COPY_KEYS)?;
        if let Some(exptime) = drz.value(0, "EXPTIME")? {
            header.set("EXPTIME", exptime);
        }
        if let Some(cd) = drz.value(1, "CD1_1")? {
            header.set("CDELT1", cd);
        }
        if let Some(cd) = drz.value(1, "CD2_2")? {
            header.set("CDELT2", cd);
        }

        fits_io::write_image(ws.path("drz_sci.fits"), &drz.image(1)?, &header)?;
        fits_io::write_image(ws.path("drz_wht.fits"), &drz.image(2)?, &header)?;
        Ok(())
    }
}

/// Point every `refpix` line of a coeffs file at the centre of `shape`,
/// unless the shape is the native detector size.
pub fn rewrite_refpix(text: &str, shape: (usize, usize)) -> String {
    if shape == NATIVE_SHAPE {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if line.trim().starts_with("refpix") {
            out.push_str(&format!(
                "refpix {:9.3} {:9.3}",
                shape.0 as f64 / 2.0,
                shape.1 as f64 / 2.0
            ));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// `D###` keywords describing `run`, as the drizzle tool records them.
pub fn drz_header(run: &DrizzleRun) -> Header {
    let mut header = Header::new();
    for i in 0..run.count() {
        let key = |s: &str| format!("D{:03}{}", i + 1, s);
        header.set(&key("DATA"), format!("{}.fits", run.flt[i]));
        header.set(&key("XSH"), run.xsh[i]);
        header.set(&key("YSH"), run.ysh[i]);
        header.set(&key("ROT"), run.rot[i]);
        header.set(&key("DEXP"), run.exptime[i].unwrap_or(1.0));
        header.set(&key("SCAL"), run.scale);
    }
    header
}
