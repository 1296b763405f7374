use anyhow::{bail, Result};

/// Row-major f32 pixel plane. `data[row * width + col]`, matching FITS
/// NAXIS1 (columns) varying fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Image {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != width * height {
            bail!(
                "Pixel buffer has {} values, expected {}x{} = {}",
                data.len(),
                width,
                height,
                width * height
            );
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build an image by evaluating `f(col, row)` at every pixel.
    pub fn from_fn<F>(width: usize, height: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> f32,
    {
        let mut data = Vec::with_capacity(width * height);
        for row in 0..height {
            for col in 0..width {
                data.push(f(col, row));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    #[inline]
    pub fn get(&self, col: usize, row: usize) -> f32 {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, col: usize, row: usize, value: f32) {
        self.data[row * self.width + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.width..(row + 1) * self.width]
    }

    /// `(col, row, value)` of every pixel in the columns `cols`, row by row.
    pub fn column_block(
        &self,
        cols: std::ops::Range<usize>,
    ) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        let cols = cols.start.min(self.width)..cols.end.min(self.width);
        (0..self.height).flat_map(move |row| {
            cols.clone().map(move |col| (col, row, self.get(col, row)))
        })
    }

    /// Subtract `value` from every pixel of column `col`.
    pub fn sub_column(&mut self, col: usize, value: f32) {
        for row in 0..self.height {
            self.data[row * self.width + col] -= value;
        }
    }

    /// Pixel-wise `self -= other`.
    pub fn sub_assign(&mut self, other: &Image) -> Result<()> {
        if self.shape() != other.shape() {
            bail!(
                "Cannot subtract {}x{} image from {}x{} image",
                other.width,
                other.height,
                self.width,
                self.height
            );
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a -= *b;
        }
        Ok(())
    }

    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Image {
        Image {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Copy of the sub-image starting at (`x0`, `y0`) of the given size.
    pub fn crop(&self, x0: usize, y0: usize, width: usize, height: usize) -> Result<Image> {
        if x0 + width > self.width || y0 + height > self.height {
            bail!(
                "Crop {}x{}+{}+{} exceeds {}x{} image",
                width,
                height,
                x0,
                y0,
                self.width,
                self.height
            );
        }
        let mut data = Vec::with_capacity(width * height);
        for row in y0..y0 + height {
            let start = row * self.width + x0;
            data.extend_from_slice(&self.data[start..start + width]);
        }
        Ok(Image {
            width,
            height,
            data,
        })
    }
}

/// Row-major i32 plane for data-quality and segmentation images.
#[derive(Debug, Clone, PartialEq)]
pub struct IntImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<i32>,
}

impl IntImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    pub fn from_vec(width: usize, height: usize, data: Vec<i32>) -> Result<Self> {
        if data.len() != width * height {
            bail!(
                "Integer buffer has {} values, expected {}x{}",
                data.len(),
                width,
                height
            );
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    #[inline]
    pub fn get(&self, col: usize, row: usize) -> i32 {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, col: usize, row: usize, value: i32) {
        self.data[row * self.width + col] = value;
    }
}

/// Boolean pixel mask; `true` marks a usable pixel unless stated otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub width: usize,
    pub height: usize,
    pub data: Vec<bool>,
}

impl Mask {
    pub fn new(width: usize, height: usize, value: bool) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    #[inline]
    pub fn get(&self, col: usize, row: usize) -> bool {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, col: usize, row: usize, value: bool) {
        self.data[row * self.width + col] = value;
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Image::from_vec(3, 2, vec![0.0; 6]).is_ok());
        let err = Image::from_vec(3, 2, vec![0.0; 5]).unwrap_err();
        assert!(err.to_string().contains("expected 3x2"));
    }

    #[test]
    fn test_row_major_layout() {
        let img = Image::from_fn(4, 3, |col, row| (row * 10 + col) as f32);
        assert_eq!(img.get(2, 1), 12.0);
        assert_eq!(img.row(2), &[20.0, 21.0, 22.0, 23.0]);
    }

    #[test]
    fn test_sub_column_and_sub_assign() {
        let mut img = Image::from_fn(3, 3, |_, _| 5.0);
        img.sub_column(1, 2.0);
        assert_eq!(img.get(1, 0), 3.0);
        assert_eq!(img.get(1, 2), 3.0);
        assert_eq!(img.get(0, 2), 5.0);

        let other = Image::from_fn(3, 3, |_, _| 1.0);
        img.sub_assign(&other).unwrap();
        assert_eq!(img.get(0, 0), 4.0);
        assert!(img.sub_assign(&Image::new(2, 2)).is_err());
    }

    #[test]
    fn test_column_block() {
        let img = Image::from_fn(4, 2, |col, row| (row * 10 + col) as f32);
        let block: Vec<_> = img.column_block(1..3).collect();
        assert_eq!(
            block,
            vec![(1, 0, 1.0), (2, 0, 2.0), (1, 1, 11.0), (2, 1, 12.0)]
        );
        assert_eq!(img.column_block(3..9).count(), 2);
    }

    #[test]
    fn test_crop() {
        let img = Image::from_fn(10, 10, |col, row| (row * 100 + col) as f32);
        let c = img.crop(5, 5, 3, 2).unwrap();
        assert_eq!(c.shape(), (3, 2));
        assert_eq!(c.get(0, 0), 505.0);
        assert_eq!(c.get(2, 1), 607.0);
        assert!(img.crop(8, 0, 3, 1).is_err());
    }

    #[test]
    fn test_mask_count() {
        let mut m = Mask::new(2, 2, false);
        m.set(1, 1, true);
        assert_eq!(m.count(), 1);
        assert!(m.get(1, 1));
    }
}
