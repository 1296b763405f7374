use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::Path;

use crate::fits_io::FitsFile;
use crate::image::Image;

/// One column of the background design matrix.
#[derive(Debug, Clone, PartialEq)]
pub enum BasisTerm {
    /// A fixed reference image, e.g. a master grism sky.
    Reference(String),
    Constant,
    /// `x^x_pow * y^y_pow` in normalized detector coordinates.
    Poly { x_pow: u32, y_pow: u32 },
}

impl fmt::Display for BasisTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BasisTerm::Reference(name) => write!(f, "image[{}]", name),
            BasisTerm::Constant => write!(f, "1"),
            BasisTerm::Poly { x_pow, y_pow } => match (*x_pow, *y_pow) {
                (x, 0) => write!(f, "x**{}", x),
                (0, y) => write!(f, "y**{}", y),
                (x, y) => write!(f, "x**{}*y**{}", x, y),
            },
        }
    }
}

/// Polynomial terms up to `order` in fit order: the constant, then per power
/// the cross terms from the most x-heavy inward, the symmetric term for even
/// powers, and finally `x^p` and `y^p`. `order < 0` yields no terms.
pub fn polynomial_terms(order: i32) -> Vec<BasisTerm> {
    let mut terms = Vec::new();
    if order < 0 {
        return terms;
    }
    terms.push(BasisTerm::Constant);
    for pow in 1..=order as u32 {
        let mut pi = pow as i64 - 1;
        while (pi as f64) > pow as f64 / 2.0 {
            let (a, b) = (pi as u32, pow - pi as u32);
            terms.push(BasisTerm::Poly { x_pow: a, y_pow: b });
            terms.push(BasisTerm::Poly { x_pow: b, y_pow: a });
            pi -= 1;
        }
        if pow % 2 == 0 {
            terms.push(BasisTerm::Poly {
                x_pow: pow / 2,
                y_pow: pow / 2,
            });
        }
        terms.push(BasisTerm::Poly { x_pow: pow, y_pow: 0 });
        terms.push(BasisTerm::Poly { x_pow: 0, y_pow: pow });
    }
    terms
}

/// Number of parameters of a model with the given order and reference images.
pub fn parameter_count(order: i32, n_images: usize) -> usize {
    let poly = if order < 0 {
        0
    } else {
        let o = order as usize;
        (o + 1) * (o + 2) / 2
    };
    poly + n_images
}

/// Polynomial plus reference-image basis over a fixed detector grid.
///
/// Reference images come first, then [`polynomial_terms`]. Coordinates are
/// `x = (col - x0) / width` and `y = (row - y0) / height`.
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    order: i32,
    width: usize,
    height: usize,
    x0: f64,
    y0: f64,
    terms: Vec<BasisTerm>,
    images: Vec<Image>,
    /// `x_pows[p][col]`
    x_pows: Vec<Vec<f64>>,
    /// `y_pows[p][row]`
    y_pows: Vec<Vec<f64>>,
}

impl BackgroundModel {
    /// Build the basis. `reference` defaults to the grid centre.
    pub fn new(
        order: i32,
        width: usize,
        height: usize,
        reference: Option<(f64, f64)>,
        images: Vec<(String, Image)>,
    ) -> Result<Self> {
        if order < -1 {
            bail!("Polynomial order must be -1 or larger, got {}", order);
        }
        if width == 0 || height == 0 {
            bail!("Background grid must be non-empty");
        }
        let (x0, y0) = reference.unwrap_or((width as f64 / 2.0, height as f64 / 2.0));

        let mut terms = Vec::new();
        let mut planes = Vec::new();
        for (name, img) in images {
            if img.shape() != (width, height) {
                bail!(
                    "Reference image {} is {}x{}, expected {}x{}",
                    name,
                    img.width,
                    img.height,
                    width,
                    height
                );
            }
            terms.push(BasisTerm::Reference(name));
            planes.push(img);
        }
        terms.extend(polynomial_terms(order));

        if terms.is_empty() {
            bail!("Background model has no terms (order -1 and no reference images)");
        }

        let max_pow = order.max(0) as usize;
        let x_pows = power_table(width, x0, max_pow);
        let y_pows = power_table(height, y0, max_pow);

        tracing::debug!(
            "Background basis: {}",
            terms
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            order,
            width,
            height,
            x0,
            y0,
            terms,
            images: planes,
            x_pows,
            y_pows,
        })
    }

    /// Build the basis reading reference images from the primary HDU of `paths`.
    pub fn from_files<P: AsRef<Path>>(
        order: i32,
        width: usize,
        height: usize,
        paths: &[P],
    ) -> Result<Self> {
        let mut images = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let img = FitsFile::open(path)?
                .image(0)
                .with_context(|| format!("Failed to read reference image {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            images.push((name, img));
        }
        Self::new(order, width, height, None, images)
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn reference_point(&self) -> (f64, f64) {
        (self.x0, self.y0)
    }

    pub fn nparam(&self) -> usize {
        self.terms.len()
    }

    pub fn terms(&self) -> &[BasisTerm] {
        &self.terms
    }

    /// Fill `out` with every basis value at pixel (`col`, `row`).
    #[inline]
    pub fn evaluate_into(&self, col: usize, row: usize, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.terms.len());
        let mut img_idx = 0;
        for (slot, term) in out.iter_mut().zip(&self.terms) {
            *slot = match term {
                BasisTerm::Reference(_) => {
                    let v = self.images[img_idx].get(col, row) as f64;
                    img_idx += 1;
                    v
                }
                BasisTerm::Constant => 1.0,
                BasisTerm::Poly { x_pow, y_pow } => {
                    self.x_pows[*x_pow as usize][col] * self.y_pows[*y_pow as usize][row]
                }
            };
        }
    }

    /// Model value at a pixel for the given coefficients.
    pub fn evaluate(&self, col: usize, row: usize, coefficients: &[f64], scratch: &mut [f64]) -> f64 {
        self.evaluate_into(col, row, scratch);
        scratch.iter().zip(coefficients).map(|(b, c)| b * c).sum()
    }
}

/// `table[p][i] = ((i - center) / n)^p` for `p` in `0..=max_pow`.
fn power_table(n: usize, center: f64, max_pow: usize) -> Vec<Vec<f64>> {
    let base: Vec<f64> = (0..n).map(|i| (i as f64 - center) / n as f64).collect();
    let mut table = Vec::with_capacity(max_pow + 1);
    table.push(vec![1.0; n]);
    for p in 1..=max_pow {
        let prev: &Vec<f64> = &table[p - 1];
        let next: Vec<f64> = prev.iter().zip(&base).map(|(a, b)| a * b).collect();
        table.push(next);
    }
    table
}
