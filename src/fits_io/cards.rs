//! FITS files as raw 80-character header cards and data units.
//!
//! Rewriting an FLT through here keeps every card the pipeline does not
//! model (distortion tables, photometry keywords, COMMENT/HISTORY) exactly as
//! it was on disk; only changed cards and replaced data units differ.

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::{is_structural, CardValue, Header};

pub const BLOCK: usize = 2880;
pub const CARD: usize = 80;

/// One HDU: header cards without END, and the data unit without padding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHdu {
    cards: Vec<String>,
    data: Vec<u8>,
}

impl RawHdu {
    /// Empty primary HDU (`NAXIS = 0`).
    pub fn primary() -> Self {
        let mut hdu = Self {
            cards: Vec::new(),
            data: Vec::new(),
        };
        hdu.push("SIMPLE", &CardValue::Bool(true));
        hdu.push("BITPIX", &CardValue::Int(8));
        hdu.push("NAXIS", &CardValue::Int(0));
        hdu.push("EXTEND", &CardValue::Bool(true));
        hdu
    }

    /// Empty IMAGE extension named `extname`.
    pub fn image_extension(extname: &str) -> Self {
        let mut hdu = Self {
            cards: Vec::new(),
            data: Vec::new(),
        };
        hdu.push("XTENSION", &CardValue::from("IMAGE"));
        hdu.push("BITPIX", &CardValue::Int(8));
        hdu.push("NAXIS", &CardValue::Int(0));
        hdu.push("PCOUNT", &CardValue::Int(0));
        hdu.push("GCOUNT", &CardValue::Int(1));
        hdu.push("EXTNAME", &CardValue::from(extname));
        hdu.push("EXTVER", &CardValue::Int(1));
        hdu
    }

    pub fn cards(&self) -> impl Iterator<Item = &str> {
        self.cards.iter().map(String::as_str)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Value of the first card named `key`.
    pub fn value(&self, key: &str) -> Option<CardValue> {
        self.cards
            .iter()
            .find(|c| card_key(c) == key)
            .and_then(|c| card_value(c))
    }

    /// Every keyword/value card except the structural ones. Commentary
    /// cards stay in the raw list only.
    pub fn header(&self) -> Header {
        let mut header = Header::new();
        for card in &self.cards {
            let key = card_key(card);
            if key.is_empty() || is_structural(key) {
                continue;
            }
            if let Some(value) = card_value(card) {
                header.set(key, value);
            }
        }
        header
    }

    /// Replace the first card named `key`, or append it. A card that already
    /// holds `value` is left untouched so its comment survives.
    pub fn set(&mut self, key: &str, value: &CardValue) {
        match self.cards.iter().position(|c| card_key(c) == key) {
            Some(i) => {
                if card_value(&self.cards[i]).as_ref() != Some(value) {
                    self.cards[i] = format_card(key, value);
                }
            }
            None => self.push(key, value),
        }
    }

    /// Carry every non-structural card of `header` into this HDU.
    pub fn merge(&mut self, header: &Header) {
        for (key, value) in header.iter() {
            if !is_structural(key) {
                self.set(key, value);
            }
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.cards.retain(|c| card_key(c) != key);
    }

    fn push(&mut self, key: &str, value: &CardValue) {
        self.cards.push(format_card(key, value));
    }

    /// Set `key` in place, or insert it right after the card named `after`.
    fn set_after(&mut self, key: &str, value: &CardValue, after: &str) {
        if self.cards.iter().any(|c| card_key(c) == key) {
            self.set(key, value);
            return;
        }
        let at = self
            .cards
            .iter()
            .position(|c| card_key(c) == after)
            .map_or(self.cards.len(), |i| i + 1);
        self.cards.insert(at, format_card(key, value));
    }

    fn set_shape(&mut self, bitpix: i64, width: usize, height: usize) {
        self.set("BITPIX", &CardValue::Int(bitpix));
        self.set("NAXIS", &CardValue::Int(2));
        self.set_after("NAXIS1", &CardValue::Int(width as i64), "NAXIS");
        self.set_after("NAXIS2", &CardValue::Int(height as i64), "NAXIS1");
        self.cards.retain(|c| {
            let key = card_key(c);
            !(key.starts_with("NAXIS") && key.len() > 5 && key != "NAXIS1" && key != "NAXIS2")
        });
    }

    /// Replace the data unit with a 32-bit float image.
    pub fn set_float_image(&mut self, width: usize, height: usize, pixels: &[f32]) {
        self.set_shape(-32, width, height);
        self.remove("BZERO");
        self.remove("BSCALE");
        self.data = pixels.iter().flat_map(|v| v.to_be_bytes()).collect();
    }

    /// Replace the data unit with an integer image. 16-bit planes (DQ) stay
    /// 16-bit, honouring BZERO, when every value fits; otherwise the plane
    /// becomes 32-bit.
    pub fn set_int_image(&mut self, width: usize, height: usize, pixels: &[i32]) {
        let bzero = self.value("BZERO").and_then(|v| v.as_i64()).unwrap_or(0);
        let unit_scale = self.value("BSCALE").and_then(|v| v.as_f64()).unwrap_or(1.0) == 1.0;
        let fits_i16 = |v: i32| i16::try_from(v as i64 - bzero).is_ok();
        let keep_16 = self.value("BITPIX").and_then(|v| v.as_i64()) == Some(16)
            && unit_scale
            && pixels.iter().all(|&v| fits_i16(v));

        if keep_16 {
            self.set_shape(16, width, height);
            self.data = pixels
                .iter()
                .flat_map(|&v| ((v as i64 - bzero) as i16).to_be_bytes())
                .collect();
        } else {
            self.set_shape(32, width, height);
            self.remove("BZERO");
            self.remove("BSCALE");
            self.data = pixels.iter().flat_map(|v| v.to_be_bytes()).collect();
        }
    }

    fn int(&self, key: &str) -> Option<i64> {
        self.value(key).and_then(|v| v.as_i64())
    }

    /// Size in bytes of the data unit described by the header.
    fn data_size(&self) -> Result<usize> {
        let bitpix = self
            .int("BITPIX")
            .ok_or_else(|| anyhow!("Header without BITPIX"))?;
        let naxis = self.int("NAXIS").unwrap_or(0);
        if naxis <= 0 {
            return Ok(0);
        }
        let mut pixels = 1usize;
        for i in 1..=naxis {
            let n = self
                .int(&format!("NAXIS{}", i))
                .ok_or_else(|| anyhow!("Header without NAXIS{}", i))?;
            pixels *= usize::try_from(n).map_err(|_| anyhow!("Negative NAXIS{}", i))?;
        }
        let pcount = self.int("PCOUNT").unwrap_or(0).max(0) as usize;
        let gcount = self.int("GCOUNT").unwrap_or(1).max(1) as usize;
        Ok(bitpix.unsigned_abs() as usize / 8 * gcount * (pcount + pixels))
    }
}

/// Keyword of a card, trailing blanks removed.
pub fn card_key(card: &str) -> &str {
    card.get(..8).unwrap_or(card).trim_end()
}

/// Value of a `KEY     = value / comment` card.
pub fn card_value(card: &str) -> Option<CardValue> {
    if card.get(8..10) != Some("= ") {
        return None;
    }
    parse_value(card.get(10..)?)
}

fn parse_value(field: &str) -> Option<CardValue> {
    let field = field.trim_start();
    if let Some(rest) = field.strip_prefix('\'') {
        let mut out = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '\'' {
                out.push(c);
            } else if chars.peek() == Some(&'\'') {
                chars.next();
                out.push('\'');
            } else {
                return Some(CardValue::Str(out.trim_end().to_string()));
            }
        }
        return None;
    }

    let value = field.split('/').next().unwrap_or("").trim();
    match value {
        "" => None,
        "T" => Some(CardValue::Bool(true)),
        "F" => Some(CardValue::Bool(false)),
        _ => value.parse::<i64>().map(CardValue::Int).ok().or_else(|| {
            value
                .replace(|c| c == 'D' || c == 'd', "E")
                .parse::<f64>()
                .ok()
                .map(CardValue::Float)
        }),
    }
}

/// Fixed-format card, padded to 80 characters.
pub fn format_card(key: &str, value: &CardValue) -> String {
    let field = match value {
        CardValue::Str(s) => format!("{:<20}", format!("'{:<8}'", s.replace('\'', "''"))),
        CardValue::Bool(b) => format!("{:>20}", if *b { "T" } else { "F" }),
        CardValue::Int(i) => format!("{:>20}", i),
        CardValue::Float(f) => format!("{:>20}", format_real(*f)),
    };
    let mut card = format!("{:<8}= {}", key, field);
    while card.len() > CARD {
        card.pop();
    }
    format!("{:<80}", card)
}

/// Shortest round-trip real with an explicit decimal point and `E` exponent.
fn format_real(v: f64) -> String {
    let s = format!("{:E}", v);
    match s.split_once('E') {
        Some((mantissa, exp)) if !mantissa.contains('.') => format!("{}.0E{}", mantissa, exp),
        _ => s,
    }
}

fn padded(len: usize) -> usize {
    len.div_ceil(BLOCK) * BLOCK
}

pub fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

/// `name.fits.gz` -> `name.fits`; other paths are returned as they are.
pub fn plain_path(path: &Path) -> PathBuf {
    if is_gzip(path) {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

/// Whole file contents, gunzipped when the name ends in `.gz`.
pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut bytes = Vec::new();
    if is_gzip(path) {
        GzDecoder::new(BufReader::new(file))
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to decompress {}", path.display()))?;
    } else {
        BufReader::new(file)
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read {}", path.display()))?;
    }
    Ok(bytes)
}

/// Decompress the gzipped file `src` into `dst`.
pub fn gunzip_to(src: &Path, dst: &Path) -> Result<()> {
    let file = File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let out = File::create(dst).with_context(|| format!("Failed to create {}", dst.display()))?;
    let mut writer = BufWriter::new(out);
    if let Err(e) = std::io::copy(&mut decoder, &mut writer) {
        drop(writer);
        let _ = std::fs::remove_file(dst);
        return Err(e).with_context(|| format!("Failed to decompress {}", src.display()));
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", dst.display()))?;
    Ok(())
}

/// Split a FITS byte stream into HDUs.
pub fn parse_hdus(bytes: &[u8], source: &Path) -> Result<Vec<RawHdu>> {
    let mut hdus = Vec::new();
    let mut pos = 0;
    while pos + BLOCK <= bytes.len() {
        if !hdus.is_empty() && !bytes[pos..].starts_with(b"XTENSION") {
            break;
        }
        let mut cards = Vec::new();
        let mut ended = false;
        while !ended {
            let block = bytes.get(pos..pos + BLOCK).ok_or_else(|| {
                anyhow!("Truncated header in {} at byte {}", source.display(), pos)
            })?;
            for chunk in block.chunks(CARD) {
                let card = String::from_utf8_lossy(chunk).into_owned();
                if card_key(&card) == "END" {
                    ended = true;
                    break;
                }
                cards.push(card);
            }
            pos += BLOCK;
        }

        let mut hdu = RawHdu {
            cards,
            data: Vec::new(),
        };
        let size = hdu
            .data_size()
            .with_context(|| format!("HDU #{} of {}", hdus.len(), source.display()))?;
        let data = bytes.get(pos..pos + size).ok_or_else(|| {
            anyhow!(
                "Truncated data unit in HDU #{} of {}",
                hdus.len(),
                source.display()
            )
        })?;
        hdu.data = data.to_vec();
        pos += padded(size);
        hdus.push(hdu);
    }
    if hdus.is_empty() {
        bail!("{} holds no FITS header", source.display());
    }
    Ok(hdus)
}

/// Read every HDU of a plain or gzipped FITS file.
pub fn read_hdus(path: &Path) -> Result<Vec<RawHdu>> {
    let bytes = read_bytes(path)?;
    parse_hdus(&bytes, path)
}

/// Serialise HDUs: blank-padded headers ending in END, zero-padded data.
pub fn encode_hdus(hdus: &[RawHdu]) -> Vec<u8> {
    let mut out = Vec::new();
    for hdu in hdus {
        for card in &hdu.cards {
            out.extend_from_slice(format!("{:<80}", card).as_bytes().get(..CARD).unwrap_or_default());
        }
        out.extend_from_slice(format!("{:<80}", "END").as_bytes());
        out.resize(padded(out.len()), b' ');
        out.extend_from_slice(&hdu.data);
        out.resize(padded(out.len()), 0);
    }
    out
}

/// Write HDUs to `path`.
pub fn write_hdus(path: &Path, hdus: &[RawHdu]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&encode_hdus(hdus))
        .and_then(|_| writer.flush())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn sample() -> Vec<RawHdu> {
        let mut primary = RawHdu::primary();
        primary.set("IDCTAB", &CardValue::from("iref$w3m18525i_idc.fits"));
        primary.cards.push(format!("{:<80}", "HISTORY calibrated with calwf3"));
        let mut sci = RawHdu::image_extension("SCI");
        sci.set_float_image(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.5]);
        let mut dq = RawHdu::image_extension("DQ");
        dq.set("BITPIX", &CardValue::Int(16));
        dq.set_int_image(3, 2, &[0, 4, 0, 0, 4096, 0]);
        vec![primary, sci, dq]
    }

    #[test]
    fn test_card_values() {
        assert_eq!(
            card_value("FILTER  = 'G141    '           / element selected"),
            Some(CardValue::Str("G141".into()))
        );
        assert_eq!(
            card_value("TARGNAME= 'O''NEIL  '"),
            Some(CardValue::Str("O'NEIL".into()))
        );
        assert_eq!(card_value("EXTEND  =                    T"), Some(CardValue::Bool(true)));
        assert_eq!(card_value("NAXIS1  =                 1014 / length"), Some(CardValue::Int(1014)));
        assert_eq!(card_value("PHOTFLAM=   1.5274129E-20"), Some(CardValue::Float(1.5274129e-20)));
        assert_eq!(card_value("EXPTIME =        1.0D3"), Some(CardValue::Float(1000.0)));
        assert_eq!(card_value("HISTORY x = 1"), None);
        assert_eq!(card_key("COMMENT something"), "COMMENT");
    }

    #[test]
    fn test_format_card_round_trips() {
        for value in [
            CardValue::from("iref$w3m18525i_idc.fits"),
            CardValue::from("it's"),
            CardValue::Int(-7),
            CardValue::Float(1.0),
            CardValue::Float(-2.5e-13),
            CardValue::Bool(false),
        ] {
            let card = format_card("KEY", &value);
            assert_eq!(card.len(), 80);
            assert_eq!(card_value(&card), Some(value));
        }
    }

    #[test]
    fn test_set_keeps_matching_card_verbatim() {
        let mut hdu = RawHdu::image_extension("SCI");
        let card = format!("{:<80}", "CRPIX1  =                507.0 / x reference pixel");
        hdu.cards.push(card.clone());
        hdu.set("CRPIX1", &CardValue::Float(507.0));
        assert!(hdu.cards().any(|c| c == card));
        hdu.set("CRPIX1", &CardValue::Float(500.0));
        assert_eq!(hdu.value("CRPIX1"), Some(CardValue::Float(500.0)));
        assert_eq!(hdu.cards().filter(|c| card_key(c) == "CRPIX1").count(), 1);
    }

    #[test]
    fn test_encode_parse_keeps_every_card() {
        let hdus = sample();
        let bytes = encode_hdus(&hdus);
        assert_eq!(bytes.len() % BLOCK, 0);
        let parsed = parse_hdus(&bytes, Path::new("mem.fits")).unwrap();
        assert_eq!(parsed, hdus);
        assert!(parsed[0].cards().any(|c| c.starts_with("HISTORY calibrated")));
        assert_eq!(parsed[2].value("BITPIX"), Some(CardValue::Int(16)));
        assert_eq!(parsed[2].data().len(), 12);
        assert_eq!(&parsed[1].data()[20..24], &6.5f32.to_be_bytes());
    }

    #[test]
    fn test_int_image_widens_when_values_overflow() {
        let mut dq = RawHdu::image_extension("DQ");
        dq.set("BITPIX", &CardValue::Int(16));
        dq.set_int_image(2, 1, &[1, 70000]);
        assert_eq!(dq.value("BITPIX"), Some(CardValue::Int(32)));
        assert_eq!(dq.data().len(), 8);
    }

    #[test]
    fn test_read_gzipped_hdus() {
        let dir = TempDir::new().unwrap();
        let gz = dir.path().join("a_flt.fits.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(&encode_hdus(&sample())).unwrap();
        encoder.finish().unwrap();

        let hdus = read_hdus(&gz).unwrap();
        assert_eq!(hdus.len(), 3);
        assert_eq!(
            hdus[0].header().get_str("IDCTAB"),
            Some("iref$w3m18525i_idc.fits")
        );
        assert_eq!(plain_path(&gz), dir.path().join("a_flt.fits"));

        let plain = dir.path().join("a_flt.fits");
        gunzip_to(&gz, &plain).unwrap();
        assert_eq!(read_hdus(&plain).unwrap(), hdus);
    }
}
