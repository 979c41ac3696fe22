//! Dense `f32` tensor on top of `ndarray`.
//!
//! Axis 0 is the ray (or sample) axis for everything the aggregator
//! touches. The wrapper keeps arrays in standard (row-major) layout so
//! [`Tensor::data`] can always hand out a flat slice, and adds the glam
//! conversions the point-cloud code needs.

use std::ops::Range;

use glam::Vec3;
use ndarray::{concatenate, Array1, Array2, ArrayD, ArrayViewD, Axis, Dimension, IntoDimension, IxDyn, Slice};

use super::{Error, Result};

/// Dense row-major `f32` tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    array: ArrayD<f32>,
}

impl Default for Tensor {
    fn default() -> Self {
        Self::zeros(0)
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(array: ArrayD<f32>) -> Self {
        let array = if array.is_standard_layout() {
            array
        } else {
            array.as_standard_layout().into_owned()
        };
        Self { array }
    }
}

impl Tensor {
    /// Create a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: impl IntoDimension, data: Vec<f32>) -> Result<Self> {
        let dim = shape.into_dimension().into_dyn();
        let len = data.len();
        let array = ArrayD::from_shape_vec(dim.clone(), data)
            .map_err(|_| Error::shape(format!("{} elements for {:?}", dim.size(), dim.slice()), len))?;
        Ok(Self { array })
    }

    /// Zero-filled tensor.
    pub fn zeros(shape: impl IntoDimension) -> Self {
        Self {
            array: ArrayD::zeros(shape.into_dimension().into_dyn()),
        }
    }

    /// Rank-1 tensor, one value per row.
    pub fn column(data: Vec<f32>) -> Self {
        Self {
            array: Array1::from_vec(data).into_dyn(),
        }
    }

    /// `(N, 3)` tensor from 3D vectors.
    pub fn from_vec3s(points: &[Vec3]) -> Self {
        let array = Array2::from_shape_fn((points.len(), 3), |(i, j)| points[i][j]);
        Self {
            array: array.into_dyn(),
        }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.array.shape()
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.array.ndim()
    }

    /// Flat row-major view of the elements.
    #[inline]
    pub fn data(&self) -> &[f32] {
        self.array.as_slice().unwrap_or(&[])
    }

    pub fn array(&self) -> &ArrayD<f32> {
        &self.array
    }

    pub fn into_array(self) -> ArrayD<f32> {
        self.array
    }

    /// Number of rows along axis 0. Scalars have none.
    #[inline]
    pub fn rows(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    /// Elements in one axis-0 row.
    fn row_len(&self) -> usize {
        self.shape().iter().skip(1).product()
    }

    /// Borrow one axis-0 row.
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        if self.ndim() == 0 || index >= self.rows() {
            return None;
        }
        let len = self.row_len();
        self.data().get(index * len..(index + 1) * len)
    }

    /// Copy out the rows in `range`.
    pub fn slice_rows(&self, range: Range<usize>) -> Result<Self> {
        if self.ndim() == 0 {
            return Err(Error::InvalidShape("cannot slice a scalar tensor".into()));
        }
        let rows = self.rows();
        if range.start > range.end || range.end > rows {
            return Err(Error::InvalidShape(format!(
                "row range {}..{} out of bounds for {} rows",
                range.start, range.end, rows
            )));
        }
        let view = self.array.slice_axis(Axis(0), Slice::from(range));
        Ok(Self::from(view.to_owned()))
    }

    /// Concatenate tensors along axis 0. Trailing axes must agree.
    pub fn concat_rows(parts: &[Tensor]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| Error::InvalidShape("nothing to concatenate".into()))?;
        if first.ndim() == 0 {
            return Err(Error::InvalidShape("cannot concatenate scalar tensors".into()));
        }
        if let Some(bad) = parts.iter().find(|p| p.shape().get(1..) != first.shape().get(1..)) {
            return Err(Error::shape(first.shape(), bad.shape()));
        }

        let views: Vec<ArrayViewD<'_, f32>> = parts.iter().map(|p| p.array.view()).collect();
        let merged = concatenate(Axis(0), &views).map_err(|e| Error::InvalidShape(e.to_string()))?;
        Ok(Self::from(merged))
    }

    /// Reshape the ray axis into an image grid: `(rows, cols, C)` with `C`
    /// inferred from the element count.
    pub fn into_grid(self, rows: usize, cols: usize) -> Result<Self> {
        let total = self.array.len();
        let pixels = rows * cols;
        if pixels == 0 || total % pixels != 0 {
            return Err(Error::shape(format!("a multiple of {} x {}", rows, cols), self.shape()));
        }
        let actual = self.shape().to_vec();
        let array = self
            .array
            .into_shape_with_order(IxDyn(&[rows, cols, total / pixels]))
            .map_err(|_| Error::shape(format!("[{} x {} x C]", rows, cols), actual))?;
        Ok(Self { array })
    }

    /// Drop a trailing axis of size 1. Rank-1 tensors are left alone.
    pub fn squeeze_trailing(self) -> Self {
        let ndim = self.ndim();
        if ndim > 1 && self.shape()[ndim - 1] == 1 {
            Self::from(self.array.index_axis_move(Axis(ndim - 1), 0))
        } else {
            self
        }
    }

    /// Interpret a `(N, 3)` tensor as 3D vectors.
    pub fn to_vec3s(&self) -> Result<Vec<Vec3>> {
        if self.ndim() != 2 || self.shape()[1] != 3 {
            return Err(Error::shape("[N x 3]", self.shape()));
        }
        Ok(self.data().chunks_exact(3).map(Vec3::from_slice).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(rows: usize, cols: usize) -> Tensor {
        let data = (0..rows * cols).map(|v| v as f32).collect();
        Tensor::new((rows, cols), data).unwrap()
    }

    #[test]
    fn test_new_checks_len() {
        assert!(Tensor::new((2, 3), vec![0.0; 6]).is_ok());
        assert!(matches!(
            Tensor::new((2, 3), vec![0.0; 5]),
            Err(Error::ShapeMismatch { .. })
        ));
        assert_eq!(Tensor::default().rows(), 0);
    }

    #[test]
    fn test_slice_rows() {
        let t = arange(5, 2);
        let s = t.slice_rows(1..3).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.data(), &[2.0, 3.0, 4.0, 5.0]);

        assert!(t.slice_rows(4..6).is_err());
        assert_eq!(t.slice_rows(5..5).unwrap().rows(), 0);
    }

    #[test]
    fn test_concat_rows() {
        let t = arange(5, 2);
        let a = t.slice_rows(0..2).unwrap();
        let b = t.slice_rows(2..5).unwrap();
        assert_eq!(Tensor::concat_rows(&[a, b]).unwrap(), t);

        let bad = [arange(2, 2), arange(2, 3)];
        assert!(matches!(
            Tensor::concat_rows(&bad),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(Tensor::concat_rows(&[]).is_err());
    }

    #[test]
    fn test_grid_and_squeeze() {
        let t = arange(12, 1).into_grid(3, 4).unwrap();
        assert_eq!(t.shape(), &[3, 4, 1]);
        let t = t.squeeze_trailing();
        assert_eq!(t.shape(), &[3, 4]);
        assert_eq!(t.row(2), Some(&[8.0, 9.0, 10.0, 11.0][..]));

        let rgb = arange(6, 3).into_grid(2, 3).unwrap().squeeze_trailing();
        assert_eq!(rgb.shape(), &[2, 3, 3]);

        assert!(Tensor::column(vec![0.0; 12]).into_grid(5, 2).is_err());
        // Leading unit axes stay
        let one = Tensor::column(vec![7.0]).into_grid(1, 1).unwrap().squeeze_trailing();
        assert_eq!(one.shape(), &[1, 1]);
        assert_eq!(Tensor::column(vec![1.0]).squeeze_trailing().shape(), &[1]);
    }

    #[test]
    fn test_vec3_round() {
        let pts = vec![Vec3::new(1.0, 2.0, 3.0), Vec3::new(-1.0, 0.5, 9.0)];
        let t = Tensor::from_vec3s(&pts);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.row(1), Some(&[-1.0, 0.5, 9.0][..]));
        assert_eq!(t.to_vec3s().unwrap(), pts);
        assert!(Tensor::column(vec![1.0, 2.0]).to_vec3s().is_err());
    }
}
