//! DS9 region files: pointing footprints, 0th-order ellipses, DQ masks,
//! and trimming catalogue objects whose spectra fall off a mosaic.

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::asn::AsnFile;
use crate::catalog::SexCatalog;
use crate::fits_io::{self, FitsFile, Header};
use crate::geometry::{self, Polygon, Wcs, WCS_KEYS};

/// `<dir>/<root>_asn.pointing.reg`
pub fn pointing_region_path(dir: &Path, asn_root: &str) -> PathBuf {
    dir.join(format!("{}_asn.pointing.reg", asn_root))
}

/// Write a DS9 file with the SCI footprint of every exposure in the
/// association and a label at the mean exposure centre.
pub fn asn_region(dir: &Path, asn_root: &str) -> Result<PathBuf> {
    let asn = AsnFile::open(dir, asn_root)?;
    let mut out = String::from("fk5\n");
    let mut centers = Vec::with_capacity(asn.len());

    for exp in &asn.exposures {
        let flt = fits_io::find_fits_gz(dir.join(format!("{}_flt.fits", exp.to_lowercase())))?;
        let poly = geometry::wcs_polygon(&flt, 1)?;
        if poly.len() != 4 {
            bail!("Footprint of {} has {} corners", flt.display(), poly.len());
        }
        let coords: Vec<String> = poly
            .iter()
            .flat_map(|&(ra, dec)| [format!("{:10.6}", ra), format!("{:10.6}", dec)])
            .collect();
        writeln!(out, "polygon({}) # color=magenta", coords.join(","))?;
        centers.push(geometry::centroid(&poly));
    }

    let (ra, dec) = geometry::centroid(&centers);
    writeln!(
        out,
        "# text({:10.6},{:10.6}) text={{{}}} color=magenta",
        ra, dec, asn_root
    )?;

    let path = pointing_region_path(dir, asn_root);
    fs::write(&path, out).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!("🗺️  Pointing region: {}", path.display());
    Ok(path)
}

/// Ellipse regions at the predicted 0th-order positions of catalogue
/// objects. `offsets` is the x offset polynomial `c0 + c1*x + c2*y` in
/// exposure pixels.
pub fn make_zeroth(catalog: &SexCatalog, wcs: &Wcs, offsets: [f64; 3], outfile: &Path) -> Result<usize> {
    let ra = catalog.column("X_WORLD")?;
    let dec = catalog.column("Y_WORLD")?;
    let a = catalog.column("A_WORLD")?;
    let b = catalog.column("B_WORLD")?;
    let theta = catalog.column("THETA_WORLD")?;

    let mut out = String::from("fk5\n");
    for i in 0..catalog.len() {
        let (x, y) = wcs.sky_to_pix(ra[i], dec[i])?;
        let x0 = x + offsets[0] + offsets[1] * x + offsets[2] * y;
        let (ra0, dec0) = wcs.pix_to_sky(x0, y);
        writeln!(
            out,
            "ellipse({:.8}, {:.8}, {:6.2}\", {:6.2}\", {:6.2})",
            ra0,
            dec0,
            a[i] * 3600.0,
            b[i] * 3600.0,
            -theta[i]
        )?;
    }
    fs::write(outfile, out).with_context(|| format!("Failed to write {}", outfile.display()))?;
    tracing::info!("🌟 {} 0th-order regions -> {}", catalog.len(), outfile.display());
    Ok(catalog.len())
}

/// Root of a drizzled catalogue, `GOODS-S-D_drz.cat` -> `GOODS-S-D`.
pub fn catalog_root(catalog: &SexCatalog) -> Result<String> {
    let name = catalog
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Catalogue path {} has no file name", catalog.path.display()))?;
    Ok(name.split("_drz.cat").next().unwrap_or(name).to_string())
}

/// Exposure WCS of the first member of the catalogue's association.
pub fn first_exposure_wcs(dir: &Path, root: &str) -> Result<Wcs> {
    let asn = AsnFile::open(dir, root)?;
    let flt = fits_io::find_fits_gz(dir.join(format!("{}_flt.fits", asn.exposures[0])))?;
    Wcs::from_fits(flt, 1)
}

/// x range of the first-order beam (`BEAMA`) from an aXe configuration file.
pub fn read_beam_a(path: &Path) -> Result<(i64, i64)> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read aXe configuration {}", path.display()))?;
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("BEAMA") {
            continue;
        }
        let values: Vec<f64> = parts
            .take(2)
            .map(|v| v.parse::<f64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("Bad BEAMA line in {}: {}", path.display(), line))?;
        if let [lo, hi] = values[..] {
            return Ok((lo as i64, hi as i64));
        }
        bail!("BEAMA in {} needs two values", path.display());
    }
    bail!("No BEAMA in {}", path.display())
}

/// Mosaic pixel samples of a first-order beam anchored at exposure pixel
/// `(x, y)`.
fn beam_samples(
    flt: &Wcs,
    drz: &Wcs,
    (x, y): (f64, f64),
    beam_x: (i64, i64),
    beam_width: usize,
) -> Result<Vec<(i64, i64)>> {
    let half = (beam_width / 2) as i64;
    let mut samples = Vec::new();
    for dx in beam_x.0..beam_x.1 {
        for dy in -half..half {
            let (ra, dec) = flt.pix_to_sky(x + dx as f64, y + dy as f64);
            let (px, py) = drz.sky_to_pix(ra, dec)?;
            samples.push((px.round() as i64, py.round() as i64));
        }
    }
    Ok(samples)
}

/// Drop catalogue objects whose first-order spectrum misses the mosaic,
/// or lands more than half off-image or on empty pixels. Returns the ids
/// removed.
pub fn trim_edge_objects(
    catalog: &mut SexCatalog,
    flt_wcs: &Wcs,
    drz_path: &Path,
    beam_x: (i64, i64),
    beam_width: usize,
) -> Result<Vec<i64>> {
    let drz = FitsFile::open(drz_path)?;
    let drz_wcs = Wcs::from_header(&drz.header(1, WCS_KEYS)?)?;
    let data = drz.image(1)?;
    let (width, height) = (data.width as i64, data.height as i64);

    let ids = catalog.ids()?;
    let ra = catalog.column("X_WORLD")?;
    let dec = catalog.column("Y_WORLD")?;

    let mut kill = Vec::new();
    for i in 0..ids.len() {
        let anchor = flt_wcs.sky_to_pix(ra[i], dec[i])?;
        let samples = beam_samples(flt_wcs, &drz_wcs, anchor, beam_x, beam_width)?;
        let inside: Vec<&(i64, i64)> = samples
            .iter()
            .filter(|&&(px, py)| px > 0 && px < width && py > 0 && py < height)
            .collect();
        if inside.is_empty() {
            kill.push(ids[i]);
            continue;
        }
        let empty = inside
            .iter()
            .filter(|&&&(px, py)| data.get(px as usize, py as usize) == 0.0)
            .count();
        let nbad = empty + samples.len() - inside.len();
        if nbad as f64 / samples.len() as f64 > 0.5 {
            kill.push(ids[i]);
        }
    }

    catalog.remove_ids(&kill)?;
    tracing::info!(
        "✂️  Trimmed {} edge objects from {} ({} left)",
        kill.len(),
        catalog.path.display(),
        catalog.len()
    );
    Ok(kill)
}

/// Image-coordinate polygons of a DS9 region file.
pub fn parse_polygons(text: &str) -> Result<Vec<Polygon>> {
    let re = Regex::new(r"polygon\(([^)]*)\)")?;
    let mut polygons = Vec::new();
    for caps in re.captures_iter(text) {
        let values: Vec<f64> = caps[1]
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("Bad polygon: {}", &caps[0]))?;
        if values.len() % 2 != 0 {
            bail!("Odd number of polygon coordinates: {}", &caps[0]);
        }
        polygons.push(values.chunks(2).map(|p| (p[0], p[1])).collect());
    }
    Ok(polygons)
}

/// Add `addval` to the pixels of extension `ext` inside the polygons of
/// `<file>.mask.reg`. Returns the number of pixels changed.
pub fn apply_dq_mask(file: &Path, ext: usize, addval: i32) -> Result<usize> {
    let mut reg = file.as_os_str().to_os_string();
    reg.push(".mask.reg");
    let reg = PathBuf::from(reg);
    let text = fs::read_to_string(&reg)
        .with_context(|| format!("Failed to read mask regions {}", reg.display()))?;
    let polygons = parse_polygons(&text)?;

    let fits = FitsFile::open(file)?;
    let mut image = fits.int_image(ext)?;
    let header: Header = fits.header(ext, WCS_KEYS)?;
    drop(fits);

    let mut changed = 0;
    for poly in &polygons {
        let mask = geometry::region_mask(image.width, image.height, poly);
        for (value, inside) in image.data.iter_mut().zip(&mask.data) {
            if *inside {
                *value += addval;
                changed += 1;
            }
        }
    }
    fits_io::write_int_image(file, &image, &header)?;
    tracing::info!(
        "🩹 {}: {} region(s), {} pixels +{}",
        file.display(),
        polygons.len(),
        changed,
        addval
    );
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::CATALOG;
    use crate::geometry::tests::test_wcs;
    use crate::image::{Image, IntImage};
    use tempfile::TempDir;

    fn wcs_header(wcs: &Wcs) -> Header {
        let mut h = Header::new();
        h.set("CTYPE1", "RA---TAN");
        h.set("CTYPE2", "DEC--TAN");
        h.set("CRPIX1", wcs.crpix[0]);
        h.set("CRPIX2", wcs.crpix[1]);
        h.set("CRVAL1", wcs.crval[0]);
        h.set("CRVAL2", wcs.crval[1]);
        h.set("CD1_1", wcs.cd[0][0]);
        h.set("CD1_2", wcs.cd[0][1]);
        h.set("CD2_1", wcs.cd[1][0]);
        h.set("CD2_2", wcs.cd[1][1]);
        h
    }

    #[test]
    fn test_parse_polygons() {
        let text = "image\npolygon(1,1,10,1,10,10) # color=red\ncircle(5,5,2)\npolygon(2.5, 3, 4, 5, 6, 7)\n";
        let polys = parse_polygons(text).unwrap();
        assert_eq!(polys.len(), 2);
        assert_eq!(polys[0], vec![(1.0, 1.0), (10.0, 1.0), (10.0, 10.0)]);
        assert!(parse_polygons("polygon(1,2,3)").is_err());
    }

    #[test]
    fn test_apply_dq_mask_adds_inside_only() {
        let dir = TempDir::new().unwrap();
        let seg = dir.path().join("a_flt.seg.fits");
        fits_io::write_int_image(&seg, &IntImage::new(10, 10), &Header::new()).unwrap();
        fs::write(
            dir.path().join("a_flt.seg.fits.mask.reg"),
            "image\npolygon(0.5,0.5,3.5,0.5,3.5,3.5,0.5,3.5)\n",
        )
        .unwrap();

        let changed = apply_dq_mask(&seg, 0, 100).unwrap();
        assert_eq!(changed, 9);
        let out = FitsFile::open(&seg).unwrap().int_image(0).unwrap();
        assert_eq!(out.get(0, 0), 100);
        assert_eq!(out.get(2, 2), 100);
        assert_eq!(out.get(3, 3), 0);
    }

    #[test]
    fn test_make_zeroth_offsets_and_units() {
        let dir = TempDir::new().unwrap();
        let cat = SexCatalog::parse(Path::new("GOODS-S-D_drz.cat"), CATALOG).unwrap();
        let out = dir.path().join("zeroth.reg");
        let wcs = test_wcs();
        assert_eq!(make_zeroth(&cat, &wcs, [-192.24, 0.0, 0.0], &out).unwrap(), 3);

        let text = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "fk5");
        assert!(lines[1].starts_with("ellipse("));
        assert!(lines[1].contains("  0.72\",   0.36\", -45.00)"));

        // First object sits at CRVAL; its 0th order is shifted by -192 pixels in x
        let nums: Vec<f64> = lines[1]["ellipse(".len()..]
            .split(',')
            .take(2)
            .map(|v| v.trim().parse().unwrap())
            .collect();
        let (x, y) = wcs.sky_to_pix(nums[0], nums[1]).unwrap();
        let (x0, y0) = wcs.sky_to_pix(53.1, -27.8).unwrap();
        assert!((x - (x0 - 192.24)).abs() < 1e-3);
        assert!((y - y0).abs() < 1e-3);

        // Coordinates carry a fixed 8 decimals
        let ra_text = lines[1]["ellipse(".len()..].split(',').next().unwrap();
        assert_eq!(ra_text.split('.').nth(1).map(str::len), Some(8));
    }

    #[test]
    fn test_catalog_root() {
        let cat = SexCatalog::parse(Path::new("/x/GOODS-S-D_drz.cat"), CATALOG).unwrap();
        assert_eq!(catalog_root(&cat).unwrap(), "GOODS-S-D");
    }

    #[test]
    fn test_read_beam_a() {
        let dir = TempDir::new().unwrap();
        let conf = dir.path().join("WFC3.IR.G141.conf");
        fs::write(&conf, "INSTRUMENT WFC3\nBEAMA 15 196\nMMAG_EXTRACT_A 30\n").unwrap();
        assert_eq!(read_beam_a(&conf).unwrap(), (15, 196));
        fs::write(&conf, "INSTRUMENT WFC3\n").unwrap();
        assert!(read_beam_a(&conf).is_err());
    }

    #[test]
    fn test_asn_region_writes_polygons_and_label() {
        let dir = TempDir::new().unwrap();
        let wcs = test_wcs();
        let mut sci_header = wcs_header(&wcs);
        sci_header.set("EXTNAME", "SCI");
        for root in ["a", "b"] {
            let exposure = fits_io::Exposure {
                root: root.to_string(),
                path: dir.path().join(format!("{}_flt.fits", root)),
                primary: Header::new(),
                sci_header: sci_header.clone(),
                sci: Image::new(1014, 1014),
                err: None,
                dq: IntImage::new(1014, 1014),
                source: Vec::new(),
            };
            exposure.write().unwrap();
        }
        AsnFile::new("P-D", vec!["a".into(), "b".into()])
            .write(AsnFile::path_for(dir.path(), "P-D"))
            .unwrap();

        let path = asn_region(dir.path(), "P-D").unwrap();
        assert!(path.ends_with("P-D_asn.pointing.reg"));
        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("polygon( 53.") && lines[1].ends_with("# color=magenta"));
        assert!(lines[3].contains("text={P-D}"));
    }

    #[test]
    fn test_trim_edge_objects() {
        let dir = TempDir::new().unwrap();
        let wcs = test_wcs();
        // 60x60 mosaic centred on the exposure reference pixel
        let mut drz_wcs = wcs.clone();
        drz_wcs.crpix = [30.0, 30.0];
        drz_wcs.naxis = [60, 60];
        let drz = dir.path().join("GOODS-S-D_drz.fits");
        let mut header = wcs_header(&drz_wcs);
        header.set("EXTNAME", "SCI");
        let exposure = fits_io::Exposure {
            root: "GOODS-S-D".into(),
            path: drz.clone(),
            primary: Header::new(),
            sci_header: header,
            sci: Image::from_fn(60, 60, |_, _| 1.0),
            err: None,
            dq: IntImage::new(60, 60),
            source: Vec::new(),
        };
        exposure.write().unwrap();

        let mut cat = SexCatalog::parse(&dir.path().join("GOODS-S-D_drz.cat"), CATALOG).unwrap();
        // Object 1 sits at the centre, object 2 loses 3 of 10 beam rows off
        // the top edge, object 3 lands in the corner with most of its beam
        // off the image.
        let killed = trim_edge_objects(&mut cat, &wcs, &drz, (0, 20), 10).unwrap();
        assert_eq!(killed, vec![3]);
        assert_eq!(cat.ids().unwrap(), vec![1, 2]);
    }
}
