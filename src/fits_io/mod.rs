//! Thin layer over `fitrs` for the handful of FITS shapes the pipeline touches:
//! single images, HST FLT exposures (SCI/ERR/DQ) and drizzled products.
//!
//! Pixel data is read through `fitrs`. FLT rewrites go through [`cards`], which
//! keeps the on-disk headers of every HDU and swaps only the data units and
//! the cards that changed. Gzipped inputs are read transparently.

pub mod cards;

use anyhow::{anyhow, bail, Context, Result};
use fitrs::{Fits, FitsData, Hdu, HeaderValue};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::image::{Image, IntImage};

pub use cards::{gunzip_to, read_hdus, write_hdus, RawHdu};

/// WCS keywords copied onto stripped drizzle products before blotting.
pub const WCS_COPY_KEYS: &[&str] = &[
    "CTYPE1", "CTYPE2", "CRVAL1", "CRVAL2", "CRPIX1", "CRPIX2", "CD1_1", "CD1_2", "CD2_1",
    "CD2_2", "LTM1_1", "LTM2_2",
];

/// A header card value, independent of the FITS backend.
#[derive(Debug, Clone, PartialEq)]
pub enum CardValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl CardValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CardValue::Int(v) => Some(*v as f64),
            CardValue::Float(v) => Some(*v),
            CardValue::Str(s) => s.trim().parse().ok(),
            CardValue::Bool(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CardValue::Int(v) => Some(*v),
            CardValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            CardValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CardValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn from_fitrs(value: &HeaderValue) -> Option<Self> {
        match value {
            HeaderValue::CharacterString(s) => Some(CardValue::Str(s.trim_end().to_string())),
            HeaderValue::Logical(b) => Some(CardValue::Bool(*b)),
            HeaderValue::IntegerNumber(i) => Some(CardValue::Int(*i as i64)),
            HeaderValue::RealFloatingNumber(f) => Some(CardValue::Float(*f)),
            _ => None,
        }
    }

    fn to_fitrs(&self) -> HeaderValue {
        match self {
            CardValue::Str(s) => HeaderValue::CharacterString(s.clone()),
            CardValue::Bool(b) => HeaderValue::Logical(*b),
            CardValue::Int(i) => match i32::try_from(*i) {
                Ok(v) => HeaderValue::IntegerNumber(v),
                Err(_) => HeaderValue::RealFloatingNumber(*i as f64),
            },
            CardValue::Float(f) => HeaderValue::RealFloatingNumber(*f),
        }
    }
}

impl From<&str> for CardValue {
    fn from(s: &str) -> Self {
        CardValue::Str(s.to_string())
    }
}

impl From<String> for CardValue {
    fn from(s: String) -> Self {
        CardValue::Str(s)
    }
}

impl From<f64> for CardValue {
    fn from(v: f64) -> Self {
        CardValue::Float(v)
    }
}

impl From<i64> for CardValue {
    fn from(v: i64) -> Self {
        CardValue::Int(v)
    }
}

impl From<bool> for CardValue {
    fn from(v: bool) -> Self {
        CardValue::Bool(v)
    }
}

/// Ordered set of header cards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    cards: Vec<(String, CardValue)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&CardValue> {
        self.cards.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    pub fn require_f64(&self, key: &str) -> Result<f64> {
        self.get_f64(key)
            .ok_or_else(|| anyhow!("Missing numeric header keyword {}", key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace a card, keeping the original position on replace.
    pub fn set<V: Into<CardValue>>(&mut self, key: &str, value: V) {
        let value = value.into();
        match self.cards.iter_mut().find(|(k, _)| k == key) {
            Some(card) => card.1 = value,
            None => self.cards.push((key.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CardValue)> {
        self.cards.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    fn apply_to(&self, hdu: &mut Hdu) {
        for (key, value) in &self.cards {
            if is_structural(key) {
                continue;
            }
            hdu.insert(key.as_str(), value.to_fitrs());
        }
    }
}

fn is_structural(key: &str) -> bool {
    matches!(
        key,
        "SIMPLE" | "BITPIX" | "EXTEND" | "XTENSION" | "PCOUNT" | "GCOUNT" | "BZERO" | "BSCALE"
            | "END"
    ) || key.starts_with("NAXIS")
}

/// An open FITS file.
pub struct FitsFile {
    path: PathBuf,
    fits: Fits,
    /// Decompressed copy of a `.gz` input, removed on drop
    _plain: Option<NamedTempFile>,
}

impl FitsFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let plain = if cards::is_gzip(&path) {
            let tmp = tempfile::Builder::new()
                .prefix("grism-prep-")
                .suffix(".fits")
                .tempfile()
                .context("Failed to create a scratch file for decompression")?;
            cards::gunzip_to(&path, tmp.path())?;
            Some(tmp)
        } else {
            None
        };
        let read_from = plain.as_ref().map_or(path.as_path(), |t| t.path());
        let fits = Fits::open(read_from)
            .with_context(|| format!("Failed to open FITS file: {}", path.display()))?;
        Ok(Self {
            path,
            fits,
            _plain: plain,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn hdu(&self, ext: usize) -> Result<Hdu> {
        self.fits
            .get(ext)
            .ok_or_else(|| anyhow!("Extension #{} out of range in {}", ext, self.path.display()))
    }

    pub fn has_extension(&self, ext: usize) -> bool {
        self.fits.get(ext).is_some()
    }

    /// Single header value, `None` when the keyword is absent.
    pub fn value(&self, ext: usize, key: &str) -> Result<Option<CardValue>> {
        let hdu = self.hdu(ext)?;
        Ok(hdu.value(key).and_then(CardValue::from_fitrs))
    }

    /// Header restricted to `keys`; absent keys are skipped.
    pub fn header(&self, ext: usize, keys: &[&str]) -> Result<Header> {
        let hdu = self.hdu(ext)?;
        let mut header = Header::new();
        for key in keys {
            if let Some(value) = hdu.value(key).and_then(CardValue::from_fitrs) {
                header.set(key, value);
            }
        }
        Ok(header)
    }

    /// Image data of `ext` converted to f32. Blank integer pixels read as 0.
    pub fn image(&self, ext: usize) -> Result<Image> {
        let hdu = self.hdu(ext)?;
        let (shape, data): (Vec<usize>, Vec<f32>) = match hdu.read_data() {
            FitsData::FloatingPoint32(arr) => (arr.shape.clone(), arr.data.clone()),
            FitsData::FloatingPoint64(arr) => {
                (arr.shape.clone(), arr.data.iter().map(|&v| v as f32).collect())
            }
            FitsData::IntegersI32(arr) => (
                arr.shape.clone(),
                arr.data.iter().map(|v| v.unwrap_or(0) as f32).collect(),
            ),
            FitsData::IntegersU32(arr) => (
                arr.shape.clone(),
                arr.data.iter().map(|v| v.unwrap_or(0) as f32).collect(),
            ),
            _ => bail!(
                "Extension #{} of {} does not hold numeric image data",
                ext,
                self.path.display()
            ),
        };
        let (width, height) = image_shape(&shape, &self.path, ext)?;
        Image::from_vec(width, height, data)
    }

    /// Image data of `ext` as integers (DQ and segmentation planes).
    pub fn int_image(&self, ext: usize) -> Result<IntImage> {
        let hdu = self.hdu(ext)?;
        let (shape, data): (Vec<usize>, Vec<i32>) = match hdu.read_data() {
            FitsData::IntegersI32(arr) => {
                (arr.shape.clone(), arr.data.iter().map(|v| v.unwrap_or(0)).collect())
            }
            FitsData::IntegersU32(arr) => (
                arr.shape.clone(),
                arr.data
                    .iter()
                    .map(|v| v.unwrap_or(0).min(i32::MAX as u32) as i32)
                    .collect(),
            ),
            FitsData::FloatingPoint32(arr) => {
                (arr.shape.clone(), arr.data.iter().map(|&v| v as i32).collect())
            }
            FitsData::FloatingPoint64(arr) => {
                (arr.shape.clone(), arr.data.iter().map(|&v| v as i32).collect())
            }
            _ => bail!(
                "Extension #{} of {} does not hold numeric image data",
                ext,
                self.path.display()
            ),
        };
        let (width, height) = image_shape(&shape, &self.path, ext)?;
        IntImage::from_vec(width, height, data)
    }
}

fn image_shape(shape: &[usize], path: &Path, ext: usize) -> Result<(usize, usize)> {
    match shape {
        [width, height] => Ok((*width, *height)),
        _ => bail!(
            "Extension #{} of {} is not a 2-D image (shape {:?})",
            ext,
            path.display(),
            shape
        ),
    }
}

/// Resolve `name`, falling back to its gzipped sibling. Every reader in
/// this module accepts the `.gz` path.
pub fn find_fits_gz<P: AsRef<Path>>(name: P) -> Result<PathBuf> {
    match find_optional_fits(name.as_ref())? {
        Some(path) => Ok(path),
        None => bail!("File not found: {} (or .gz)", name.as_ref().display()),
    }
}

/// Like [`find_fits_gz`] but a missing file is not an error.
pub fn find_optional_fits<P: AsRef<Path>>(name: P) -> Result<Option<PathBuf>> {
    let name = name.as_ref();
    if name.exists() {
        return Ok(Some(name.to_path_buf()));
    }
    let gz = gz_sibling(name);
    Ok(gz.exists().then_some(gz))
}

/// Copy a FITS file, gunzipping it when `src` is compressed.
pub fn copy_fits(src: &Path, dst: &Path) -> Result<()> {
    if cards::is_gzip(src) {
        return cards::gunzip_to(src, dst);
    }
    std::fs::copy(src, dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}

fn gz_sibling(name: &Path) -> PathBuf {
    let mut s = name.as_os_str().to_os_string();
    s.push(".gz");
    PathBuf::from(s)
}

/// Image data of extension `ext` of the file at `path`.
pub fn read_image<P: AsRef<Path>>(path: P, ext: usize) -> Result<Image> {
    FitsFile::open(path)?.image(ext)
}

pub fn read_int_image<P: AsRef<Path>>(path: P, ext: usize) -> Result<IntImage> {
    FitsFile::open(path)?.int_image(ext)
}

/// The `keys` present in the header of extension `ext`.
pub fn read_header<P: AsRef<Path>>(path: P, ext: usize, keys: &[&str]) -> Result<Header> {
    FitsFile::open(path)?.header(ext, keys)
}

/// Write `image` as the primary HDU of a new file.
pub fn write_image<P: AsRef<Path>>(path: P, image: &Image, header: &Header) -> Result<()> {
    let mut hdu = Hdu::new(&[image.width, image.height], image.data.clone());
    header.apply_to(&mut hdu);
    create_replacing(path.as_ref(), hdu, Vec::new())
}

/// Write an integer image as the primary HDU of a new file.
pub fn write_int_image<P: AsRef<Path>>(path: P, image: &IntImage, header: &Header) -> Result<()> {
    let mut hdu = Hdu::new(&[image.width, image.height], image.data.clone());
    header.apply_to(&mut hdu);
    create_replacing(path.as_ref(), hdu, Vec::new())
}

/// Create the file at a temporary sibling, then rename it into place so a
/// failed write never truncates the original.
fn create_replacing(path: &Path, primary: Hdu, extensions: Vec<Hdu>) -> Result<()> {
    replace_with(path, |tmp| {
        let mut fits = Fits::create(tmp, primary)
            .with_context(|| format!("Failed to create FITS file: {}", tmp.display()))?;
        for hdu in extensions {
            fits.push(hdu)
                .with_context(|| format!("Failed to append extension to {}", tmp.display()))?;
        }
        Ok(())
    })
}

fn replace_with<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if tmp.exists() {
        std::fs::remove_file(&tmp)
            .with_context(|| format!("Failed to remove stale {}", tmp.display()))?;
    }
    write(&tmp)?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

/// An HST FLT exposure: primary header, SCI (1), ERR (2) and DQ (3).
#[derive(Debug, Clone)]
pub struct Exposure {
    pub root: String,
    /// Where [`Exposure::write`] goes; the plain name for a `.gz` input
    pub path: PathBuf,
    pub primary: Header,
    pub sci_header: Header,
    pub sci: Image,
    pub err: Option<Image>,
    pub dq: IntImage,
    /// HDUs as read from disk. Empty for an exposure built in memory.
    pub source: Vec<RawHdu>,
}

impl Exposure {
    /// Open `<dir>/<root>_flt.fits`, or its `.gz`.
    pub fn open_in(dir: &Path, root: &str) -> Result<Self> {
        let path = find_fits_gz(dir.join(format!("{}_flt.fits", root)))?;
        Self::open_path(root, &path)
    }

    pub fn open_path(root: &str, path: &Path) -> Result<Self> {
        let source = cards::read_hdus(path)?;
        if source.len() < 2 {
            bail!("{} has no SCI extension", path.display());
        }
        let primary = source[0].header();
        let sci_header = source[1].header();
        let file = FitsFile::open(path)?;
        let sci = file
            .image(1)
            .with_context(|| format!("Failed to read SCI of {}", path.display()))?;
        let err = if file.has_extension(2) {
            Some(file.image(2)?)
        } else {
            None
        };
        let dq = if file.has_extension(3) {
            file.int_image(3)?
        } else {
            tracing::warn!("⚠️  {} has no DQ extension, assuming clean", path.display());
            IntImage::new(sci.width, sci.height)
        };
        if dq.shape() != sci.shape() {
            bail!(
                "DQ shape {:?} does not match SCI shape {:?} in {}",
                dq.shape(),
                sci.shape(),
                path.display()
            );
        }
        Ok(Self {
            root: root.to_string(),
            path: cards::plain_path(path),
            primary,
            sci_header,
            sci,
            err,
            dq,
            source,
        })
    }

    /// Values of every `FILTER*` keyword present in the primary header.
    pub fn filters(&self) -> Vec<&str> {
        ["FILTER", "FILTER1", "FILTER2"]
            .iter()
            .filter_map(|k| self.primary.get_str(k))
            .collect()
    }

    /// Grism exposures carry a `FILTER*` value starting with `G`.
    pub fn is_grism(&self) -> bool {
        self.filters().iter().any(|f| f.trim().starts_with('G'))
    }

    /// HDUs for a rewrite: the source HDUs with the headers and planes of
    /// this exposure applied. Cards and extensions it does not hold are kept.
    pub fn to_hdus(&self) -> Vec<RawHdu> {
        let mut hdus = self.source.clone();
        if hdus.is_empty() {
            hdus.push(RawHdu::primary());
        }
        let new_err = hdus.len() <= 2;
        for (i, extname) in [(1, "SCI"), (2, "ERR"), (3, "DQ")] {
            if hdus.len() <= i {
                hdus.push(RawHdu::image_extension(extname));
            }
        }

        let (width, height) = self.sci.shape();
        hdus[0].merge(&self.primary);
        hdus[1].merge(&self.sci_header);
        hdus[1].set_float_image(width, height, &self.sci.data);
        match &self.err {
            Some(err) => hdus[2].set_float_image(err.width, err.height, &err.data),
            None if new_err => hdus[2].set_float_image(width, height, &vec![0.0; width * height]),
            None => {}
        }
        hdus[3].set_int_image(self.dq.width, self.dq.height, &self.dq.data);
        hdus
    }

    /// Rewrite the file with the current planes and headers.
    pub fn write(&self) -> Result<()> {
        let hdus = self.to_hdus();
        replace_with(&self.path, |tmp| cards::write_hdus(tmp, &hdus))?;
        tracing::debug!("💾 Wrote {}", self.path.display());
        Ok(())
    }
}
