//! Celestial footprints of exposures and polygon tests in the plane.

use anyhow::{bail, Result};
use std::f64::consts::PI;
use std::path::Path;

use crate::fits_io::{self, Header};
use crate::image::Mask;

/// Header keys needed to build a [`Wcs`].
pub const WCS_KEYS: &[&str] = &[
    "NAXIS1", "NAXIS2", "CTYPE1", "CTYPE2", "CRPIX1", "CRPIX2", "CRVAL1", "CRVAL2", "CD1_1",
    "CD1_2", "CD2_1", "CD2_2",
];

/// A closed polygon given by its vertices; the last edge joins the last
/// vertex back to the first.
pub type Polygon = Vec<(f64, f64)>;

/// Gnomonic (TAN) projection of `(ra, dec)` onto the plane tangent at
/// `(ra0, dec0)`, all in radians. `None` for points on or behind the plane.
pub fn tan_project(ra: f64, dec: f64, ra0: f64, dec0: f64) -> Option<(f64, f64)> {
    let da = ra - ra0;
    let (sin_dec, cos_dec) = dec.sin_cos();
    let (sin_dec0, cos_dec0) = dec0.sin_cos();
    let cos_da = da.cos();

    let denom = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
    if denom <= 1e-12 {
        return None;
    }
    let xi = cos_dec * da.sin() / denom;
    let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_da) / denom;
    Some((xi, eta))
}

/// Inverse of [`tan_project`].
pub fn inverse_tan_project(xi: f64, eta: f64, ra0: f64, dec0: f64) -> (f64, f64) {
    let (sin_dec0, cos_dec0) = dec0.sin_cos();
    let rho_sq = xi * xi + eta * eta;
    if rho_sq < 1e-30 {
        return (ra0, dec0);
    }
    let rho = rho_sq.sqrt();
    let c = rho.atan();
    let (sin_c, cos_c) = c.sin_cos();

    let dec = (cos_c * sin_dec0 + eta * sin_c * cos_dec0 / rho).asin();
    let ra = ra0 + (xi * sin_c).atan2(rho * cos_dec0 * cos_c - eta * sin_dec0 * sin_c);
    (ra, dec)
}

/// Linear WCS with a CD matrix, in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct Wcs {
    pub crpix: [f64; 2],
    pub crval: [f64; 2],
    pub cd: [[f64; 2]; 2],
    pub naxis: [usize; 2],
    /// Both axes use the TAN projection
    pub is_tan: bool,
}

impl Wcs {
    pub fn from_header(header: &Header) -> Result<Self> {
        let naxis = [
            header.get_i64("NAXIS1").unwrap_or(0).max(0) as usize,
            header.get_i64("NAXIS2").unwrap_or(0).max(0) as usize,
        ];
        let is_tan = ["CTYPE1", "CTYPE2"]
            .iter()
            .all(|k| header.get_str(k).is_some_and(|v| v.trim().ends_with("TAN")));
        Ok(Self {
            crpix: [header.require_f64("CRPIX1")?, header.require_f64("CRPIX2")?],
            crval: [header.require_f64("CRVAL1")?, header.require_f64("CRVAL2")?],
            cd: [
                [header.require_f64("CD1_1")?, header.get_f64("CD1_2").unwrap_or(0.0)],
                [header.get_f64("CD2_1").unwrap_or(0.0), header.require_f64("CD2_2")?],
            ],
            naxis,
            is_tan,
        })
    }

    /// Read the WCS of extension `ext`.
    pub fn from_fits<P: AsRef<Path>>(path: P, ext: usize) -> Result<Self> {
        Self::from_header(&fits_io::read_header(path, ext, WCS_KEYS)?)
    }

    /// Sky position of a 0-based pixel, in degrees.
    pub fn pix_to_sky(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = x + 1.0 - self.crpix[0];
        let dy = y + 1.0 - self.crpix[1];
        let xi = (self.cd[0][0] * dx + self.cd[0][1] * dy).to_radians();
        let eta = (self.cd[1][0] * dx + self.cd[1][1] * dy).to_radians();
        let (ra, dec) = inverse_tan_project(
            xi,
            eta,
            self.crval[0].to_radians(),
            self.crval[1].to_radians(),
        );
        (ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
    }

    /// 0-based pixel of a sky position in degrees.
    pub fn sky_to_pix(&self, ra: f64, dec: f64) -> Result<(f64, f64)> {
        let Some((xi, eta)) = tan_project(
            ra.to_radians(),
            dec.to_radians(),
            self.crval[0].to_radians(),
            self.crval[1].to_radians(),
        ) else {
            bail!("({:.6}, {:.6}) is not on the projection plane", ra, dec);
        };
        let (xi, eta) = (xi.to_degrees(), eta.to_degrees());
        let det = self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0];
        if det.abs() < 1e-30 {
            bail!("Singular CD matrix");
        }
        let dx = (self.cd[1][1] * xi - self.cd[0][1] * eta) / det;
        let dy = (-self.cd[1][0] * xi + self.cd[0][0] * eta) / det;
        Ok((dx + self.crpix[0] - 1.0, dy + self.crpix[1] - 1.0))
    }

    /// Sky corners at 1-based pixels (1,1), (1,NY), (NX,NY), (NX,1).
    pub fn footprint(&self) -> Polygon {
        let (nx, ny) = (self.naxis[0] as f64, self.naxis[1] as f64);
        [(1.0, 1.0), (1.0, ny), (nx, ny), (nx, 1.0)]
            .iter()
            .map(|&(x, y)| self.pix_to_sky(x - 1.0, y - 1.0))
            .collect()
    }

    /// Small-angle footprint straight from the CD matrix, for headers
    /// without a TAN projection.
    pub fn linear_footprint(&self) -> Polygon {
        let (nx, ny) = (self.naxis[0] as f64, self.naxis[1] as f64);
        let cos_dec = self.crval[1].to_radians().cos();
        [(0.0, 0.0), (nx, 0.0), (nx, ny), (0.0, ny)]
            .iter()
            .map(|&(x, y)| {
                let dx = x - self.crpix[0];
                let dy = y - self.crpix[1];
                (
                    self.crval[0] + (dx * self.cd[0][0] + dy * self.cd[0][1]) / cos_dec,
                    self.crval[1] + dx * self.cd[1][0] + dy * self.cd[1][1],
                )
            })
            .collect()
    }

    /// [`footprint`](Self::footprint) or, for non-TAN headers,
    /// [`linear_footprint`](Self::linear_footprint).
    pub fn polygon(&self) -> Polygon {
        if self.is_tan {
            self.footprint()
        } else {
            self.linear_footprint()
        }
    }
}

/// Sky footprint of extension `ext` of a FITS file.
pub fn wcs_polygon<P: AsRef<Path>>(path: P, ext: usize) -> Result<Polygon> {
    Ok(Wcs::from_fits(path, ext)?.polygon())
}

/// Winding test: the signed angles subtended by each edge sum to more than
/// pi in magnitude for interior points.
pub fn point_in_polygon(x: f64, y: f64, poly: &[(f64, f64)]) -> bool {
    if poly.len() < 3 {
        return false;
    }
    let mut theta = 0.0;
    for (i, &(x1, y1)) in poly.iter().enumerate() {
        let (x2, y2) = poly[(i + 1) % poly.len()];
        let (ax, ay) = (x1 - x, y1 - y);
        let (bx, by) = (x2 - x, y2 - y);
        let dp = ax * bx + ay * by;
        let cp = ax * by - ay * bx;
        theta += cp.atan2(dp);
    }
    theta.abs() > PI
}

/// Pixels inside `poly`, testing 1-based pixel coordinates.
pub fn region_mask(width: usize, height: usize, poly: &[(f64, f64)]) -> Mask {
    let mut mask = Mask::new(width, height, false);
    if poly.len() < 3 {
        return mask;
    }
    let (mut xmin, mut xmax, mut ymin, mut ymax) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    for &(x, y) in poly {
        xmin = xmin.min(x);
        xmax = xmax.max(x);
        ymin = ymin.min(y);
        ymax = ymax.max(y);
    }
    // Only pixels within the bounding box can be inside
    let col_lo = (xmin.floor() - 1.0).max(0.0) as usize;
    let col_hi = ((xmax.ceil()).max(0.0) as usize).min(width);
    let row_lo = (ymin.floor() - 1.0).max(0.0) as usize;
    let row_hi = ((ymax.ceil()).max(0.0) as usize).min(height);
    for row in row_lo..row_hi {
        for col in col_lo..col_hi {
            if point_in_polygon(col as f64 + 1.0, row as f64 + 1.0, poly) {
                mask.set(col, row, true);
            }
        }
    }
    mask
}

fn segments_intersect(p1: (f64, f64), p2: (f64, f64), q1: (f64, f64), q2: (f64, f64)) -> bool {
    let orient = |a: (f64, f64), b: (f64, f64), c: (f64, f64)| {
        (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
    };
    let d1 = orient(q1, q2, p1);
    let d2 = orient(q1, q2, p2);
    let d3 = orient(p1, p2, q1);
    let d4 = orient(p1, p2, q2);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

/// True when either polygon has a vertex inside the other or two edges cross.
pub fn polygons_overlap(a: &[(f64, f64)], b: &[(f64, f64)]) -> bool {
    if a.len() < 3 || b.len() < 3 {
        return false;
    }
    if a.iter().any(|&(x, y)| point_in_polygon(x, y, b))
        || b.iter().any(|&(x, y)| point_in_polygon(x, y, a))
    {
        return true;
    }
    for i in 0..a.len() {
        let (a1, a2) = (a[i], a[(i + 1) % a.len()]);
        for j in 0..b.len() {
            if segments_intersect(a1, a2, b[j], b[(j + 1) % b.len()]) {
                return true;
            }
        }
    }
    false
}

/// Mean of the vertices.
pub fn centroid(poly: &[(f64, f64)]) -> (f64, f64) {
    let n = poly.len().max(1) as f64;
    let (sx, sy) = poly
        .iter()
        .fold((0.0, 0.0), |(sx, sy), &(x, y)| (sx + x, sy + y));
    (sx / n, sy / n)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_wcs() -> Wcs {
        Wcs {
            crpix: [507.0, 507.0],
            crval: [53.1, -27.8],
            cd: [[-3.5e-5, 0.0], [0.0, 3.5e-5]],
            naxis: [1014, 1014],
            is_tan: true,
        }
    }

    #[test]
    fn test_reference_pixel_maps_to_crval() {
        let wcs = test_wcs();
        let (ra, dec) = wcs.pix_to_sky(506.0, 506.0);
        assert!((ra - 53.1).abs() < 1e-10);
        assert!((dec + 27.8).abs() < 1e-10);
    }

    #[test]
    fn test_pix_sky_round_trip() {
        let wcs = test_wcs();
        let (ra, dec) = wcs.pix_to_sky(10.5, 900.25);
        let (x, y) = wcs.sky_to_pix(ra, dec).unwrap();
        assert!((x - 10.5).abs() < 1e-6);
        assert!((y - 900.25).abs() < 1e-6);
        // East is to the left with a negative CD1_1
        let (ra_right, _) = wcs.pix_to_sky(600.0, 506.0);
        assert!(ra_right < 53.1);
    }

    #[test]
    fn test_footprint_and_linear_agree_for_small_fields() {
        let wcs = test_wcs();
        let tan = wcs.footprint();
        let lin = wcs.linear_footprint();
        assert_eq!(tan.len(), 4);
        let (tc, lc) = (centroid(&tan), centroid(&lin));
        assert!((tc.0 - lc.0).abs() < 1e-4);
        assert!((tc.1 - lc.1).abs() < 1e-4);
    }

    #[test]
    fn test_from_header_detects_projection() {
        let mut h = Header::new();
        for (k, v) in [
            ("CRPIX1", 1.0),
            ("CRPIX2", 1.0),
            ("CRVAL1", 10.0),
            ("CRVAL2", 0.0),
            ("CD1_1", -1e-4),
            ("CD2_2", 1e-4),
        ] {
            h.set(k, v);
        }
        h.set("NAXIS1", 100i64);
        h.set("NAXIS2", 50i64);
        h.set("CTYPE1", "RA---TAN");
        h.set("CTYPE2", "DEC--TAN");
        let wcs = Wcs::from_header(&h).unwrap();
        assert!(wcs.is_tan);
        assert_eq!(wcs.naxis, [100, 50]);
        assert_eq!(wcs.cd[0][1], 0.0);

        h.set("CTYPE1", "RA");
        assert!(!Wcs::from_header(&h).unwrap().is_tan);
    }

    #[test]
    fn test_point_in_polygon() {
        let square = vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!(point_in_polygon(5.0, 5.0, &square));
        assert!(!point_in_polygon(15.0, 5.0, &square));
        let reversed: Vec<_> = square.iter().rev().cloned().collect();
        assert!(point_in_polygon(1.0, 9.0, &reversed));
        assert!(!point_in_polygon(1.0, 1.0, &square[..2]));
    }

    #[test]
    fn test_region_mask_uses_one_based_pixels() {
        let poly = vec![(1.5, 1.5), (3.5, 1.5), (3.5, 3.5), (1.5, 3.5)];
        let mask = region_mask(5, 5, &poly);
        // 1-based (2,2)..(3,3) are 0-based (1,1)..(2,2)
        assert_eq!(mask.count(), 4);
        assert!(mask.get(1, 1) && mask.get(2, 2));
        assert!(!mask.get(0, 0) && !mask.get(3, 3));
    }

    #[test]
    fn test_polygons_overlap() {
        let a = vec![(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0)];
        let b = vec![(3.0, 3.0), (6.0, 3.0), (6.0, 6.0), (3.0, 6.0)];
        let c = vec![(10.0, 10.0), (11.0, 10.0), (11.0, 11.0)];
        // Crossing bars share no vertices inside each other
        let h = vec![(-1.0, 1.0), (5.0, 1.0), (5.0, 2.0), (-1.0, 2.0)];
        let v = vec![(1.0, -1.0), (2.0, -1.0), (2.0, 5.0), (1.0, 5.0)];
        assert!(polygons_overlap(&a, &b));
        assert!(!polygons_overlap(&a, &c));
        assert!(polygons_overlap(&h, &v));
    }
}
