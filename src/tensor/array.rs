//! Concrete n-dimensional arrays exchanged with the op executor

use std::fmt::{self, Debug};
use std::sync::Arc;

use rand::Rng;

use crate::error::{GraphError, GraphResult};
use super::dtype::DType;
use super::shape::strides_for;

/// Dense row-major array.
///
/// Elements are held as `f64` regardless of the logical dtype; every value is
/// rounded to the logical dtype on construction, so an `I32` array only ever
/// holds integral values and a `Bool` array only 0.0 and 1.0. Clones share
/// the underlying buffer.
#[derive(Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    dtype: DType,
    data: Arc<Vec<f64>>,
}

impl NdArray {
    /// Create an array, rounding every element to `dtype`
    pub fn new(shape: &[usize], dtype: DType, data: Vec<f64>) -> GraphResult<Self> {
        if dtype == DType::Utf8 {
            return Err(GraphError::InvalidArgument(
                "string arrays cannot hold numeric buffers".to_string(),
            ));
        }
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(GraphError::InvalidArgument(format!(
                "data length {} doesn't match shape {:?} ({} elements)",
                data.len(),
                shape,
                expected
            )));
        }
        let data = if dtype == DType::F64 {
            data
        } else {
            data.into_iter().map(|v| cast_value(v, dtype)).collect()
        };
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            data: Arc::new(data),
        })
    }

    /// Create a float64 array from raw values
    pub fn from_vec(data: Vec<f64>, shape: &[usize]) -> GraphResult<Self> {
        Self::new(shape, DType::F64, data)
    }

    /// Create a float32 array from raw values
    pub fn from_f32(data: Vec<f32>, shape: &[usize]) -> GraphResult<Self> {
        Self::new(shape, DType::F32, data.into_iter().map(f64::from).collect())
    }

    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self {
            shape: Vec::new(),
            dtype,
            data: Arc::new(vec![cast_value(value, dtype)]),
        }
    }

    pub fn full(shape: &[usize], value: f64, dtype: DType) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            dtype,
            data: Arc::new(vec![cast_value(value, dtype); len]),
        }
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, 0.0, dtype)
    }

    pub fn ones(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, 1.0, dtype)
    }

    /// Uniformly distributed values in `[min, max)`
    pub fn random_uniform<R: Rng + ?Sized>(
        shape: &[usize],
        min: f64,
        max: f64,
        dtype: DType,
        rng: &mut R,
    ) -> Self {
        let len: usize = shape.iter().product();
        let data = (0..len)
            .map(|_| cast_value(min + (max - min) * rng.gen::<f64>(), dtype))
            .collect();
        Self {
            shape: shape.to_vec(),
            dtype,
            data: Arc::new(data),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Get number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Arrays with a zero-sized dimension hold no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn strides(&self) -> Vec<usize> {
        strides_for(&self.shape)
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.data.as_ref().clone()
    }

    /// Value of a single-element array
    pub fn scalar_value(&self) -> Option<f64> {
        if self.data.len() == 1 {
            Some(self.data[0])
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.scalar_value().map(|v| v != 0.0)
    }

    /// Whether both arrays share the same buffer
    pub fn shares_buffer(&self, other: &NdArray) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Convert to another dtype with the target's rounding rules
    pub fn cast(&self, dtype: DType) -> GraphResult<NdArray> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        NdArray::new(&self.shape, dtype, self.data.as_ref().clone())
    }

    /// Same elements under a new shape with equal element count
    pub fn reshape(&self, shape: &[usize]) -> GraphResult<NdArray> {
        let len: usize = shape.iter().product();
        if len != self.len() {
            return Err(GraphError::InvalidArgument(format!(
                "cannot reshape {:?} ({} elements) to {:?}",
                self.shape,
                self.len(),
                shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            dtype: self.dtype,
            data: Arc::clone(&self.data),
        })
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> NdArray {
        Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            data: Arc::new(self.data.iter().map(|&v| cast_value(f(v), self.dtype)).collect()),
        }
    }

    /// `self - scale * other`, used for plain gradient-descent updates
    pub fn sub_scaled(&self, other: &NdArray, scale: f64) -> GraphResult<NdArray> {
        if self.shape != other.shape {
            return Err(GraphError::InvalidArgument(format!(
                "update shape {:?} doesn't match parameter shape {:?}",
                other.shape, self.shape
            )));
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| a - scale * b)
            .collect();
        NdArray::new(&self.shape, self.dtype, data)
    }

    /// Element-wise comparison within an absolute tolerance
    pub fn all_close(&self, other: &NdArray, tolerance: f64) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

impl Debug for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("NdArray");
        s.field("shape", &self.shape).field("dtype", &self.dtype);
        if self.len() <= 16 {
            s.field("data", &self.data);
        } else {
            s.field("size", &self.len());
        }
        s.finish()
    }
}

/// Round a value to what `dtype` can represent
pub fn cast_value(value: f64, dtype: DType) -> f64 {
    match dtype {
        DType::F64 => value,
        DType::F32 => value as f32 as f64,
        DType::F16 => half::f16::from_f64(value).to_f64(),
        DType::Bool => {
            if value != 0.0 {
                1.0
            } else {
                0.0
            }
        }
        DType::I8 => value.trunc().clamp(i8::MIN as f64, i8::MAX as f64),
        DType::I16 => value.trunc().clamp(i16::MIN as f64, i16::MAX as f64),
        DType::I32 => value.trunc().clamp(i32::MIN as f64, i32::MAX as f64),
        DType::I64 => value.trunc().clamp(i64::MIN as f64, i64::MAX as f64),
        DType::U8 => value.trunc().clamp(0.0, u8::MAX as f64),
        DType::U16 => value.trunc().clamp(0.0, u16::MAX as f64),
        DType::U32 => value.trunc().clamp(0.0, u32::MAX as f64),
        DType::U64 => value.trunc().clamp(0.0, u64::MAX as f64),
        DType::Utf8 => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_creation() {
        let array = NdArray::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        assert_eq!(array.shape(), &[2, 3]);
        assert_eq!(array.strides(), vec![3, 1]);
        assert_eq!(array.len(), 6);
        assert!(!array.is_empty());
        assert!(NdArray::from_vec(vec![1.0], &[2]).is_err());
        assert!(NdArray::zeros(&[0, 3], DType::F32).is_empty());
    }

    #[test]
    fn test_cast_rounding() {
        let array = NdArray::from_vec(vec![-1.7, 0.0, 2.9, 300.0], &[4]).unwrap();
        assert_eq!(array.cast(DType::I32).unwrap().data(), &[-1.0, 0.0, 2.0, 300.0]);
        assert_eq!(array.cast(DType::U8).unwrap().data(), &[0.0, 0.0, 2.0, 255.0]);
        assert_eq!(array.cast(DType::Bool).unwrap().data(), &[1.0, 0.0, 1.0, 1.0]);
        let half = NdArray::scalar(0.1, DType::F16);
        assert!((half.data()[0] - 0.1).abs() < 1e-3);
        assert_ne!(half.data()[0], 0.1);
    }

    #[test]
    fn test_reshape_shares_buffer() {
        let array = NdArray::ones(&[2, 3], DType::F32);
        let reshaped = array.reshape(&[3, 2]).unwrap();
        assert!(reshaped.shares_buffer(&array));
        assert!(array.reshape(&[4]).is_err());
    }

    #[test]
    fn test_scalar_helpers() {
        assert_eq!(NdArray::scalar(1.0, DType::Bool).as_bool(), Some(true));
        assert_eq!(NdArray::ones(&[2], DType::F32).scalar_value(), None);
        let a = NdArray::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let b = NdArray::from_vec(vec![0.5, 0.5], &[2]).unwrap();
        assert_eq!(a.sub_scaled(&b, 2.0).unwrap().data(), &[0.0, 1.0]);
    }
}
