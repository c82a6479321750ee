//! Training-data drivers and the gradient-descent loop
//!
//! A [`DataSource`] yields batches of placeholder bindings; `SameDiff::fit`
//! pulls them one at a time and updates every trainable variable after each.

mod trainer;

pub use trainer::{TrainingConfig, TrainingHistory};

use std::collections::HashMap;

use crate::error::{GraphError, GraphResult};
use crate::tensor::NdArray;

/// Placeholder name to the array bound for one step
pub type Batch = HashMap<String, NdArray>;

/// Source of training batches
pub trait DataSource {
    /// Next batch, or `None` at the end of the data
    fn next(&mut self) -> Option<Batch>;

    /// Rewind to the first batch
    fn reset(&mut self);
}

/// Batches held in memory, replayed in order
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    batches: Vec<Batch>,
    cursor: usize,
}

impl InMemorySource {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches, cursor: 0 }
    }

    /// Split row-aligned features and labels into batches of `batch_size` rows.
    ///
    /// The last batch holds the remainder when the row count is not a
    /// multiple of the batch size.
    pub fn from_arrays(
        features_name: &str,
        features: &NdArray,
        labels_name: &str,
        labels: &NdArray,
        batch_size: usize,
    ) -> GraphResult<Self> {
        if batch_size == 0 {
            return Err(GraphError::InvalidArgument("batch size must be positive".to_string()));
        }
        let rows = features.shape().first().copied().unwrap_or(0);
        if labels.shape().first().copied().unwrap_or(0) != rows {
            return Err(GraphError::InvalidArgument(format!(
                "features have {} rows, labels have {:?}",
                rows,
                labels.shape()
            )));
        }
        let mut batches = Vec::new();
        let mut start = 0;
        while start < rows {
            let end = (start + batch_size).min(rows);
            let mut batch = Batch::new();
            batch.insert(features_name.to_string(), slice_rows(features, start, end)?);
            batch.insert(labels_name.to_string(), slice_rows(labels, start, end)?);
            batches.push(batch);
            start = end;
        }
        Ok(Self::new(batches))
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl DataSource for InMemorySource {
    fn next(&mut self) -> Option<Batch> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        batch
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Rows `start..end` along the first axis
fn slice_rows(array: &NdArray, start: usize, end: usize) -> GraphResult<NdArray> {
    let row: usize = array.shape().iter().skip(1).product();
    let mut shape = array.shape().to_vec();
    shape[0] = end - start;
    NdArray::new(&shape, array.dtype(), array.data()[start * row..end * row].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    #[test]
    fn test_in_memory_source_batches_and_rewinds() {
        let x = NdArray::new(&[5, 2], DType::F32, (0..10).map(f64::from).collect()).unwrap();
        let y = NdArray::new(&[5, 1], DType::F32, (0..5).map(f64::from).collect()).unwrap();
        let mut source = InMemorySource::from_arrays("x", &x, "y", &y, 2).unwrap();
        assert_eq!(source.len(), 3);

        let first = source.next().unwrap();
        assert_eq!(first["x"].shape(), &[2, 2]);
        source.next().unwrap();
        let last = source.next().unwrap();
        assert_eq!(last["x"].to_vec(), vec![8.0, 9.0]);
        assert_eq!(last["y"].to_vec(), vec![4.0]);
        assert!(source.next().is_none());

        source.reset();
        assert_eq!(source.next().unwrap()["y"].to_vec(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_row_count_mismatch_rejected() {
        let x = NdArray::zeros(&[4, 2], DType::F32);
        let y = NdArray::zeros(&[3], DType::F32);
        assert!(InMemorySource::from_arrays("x", &x, "y", &y, 2).is_err());
    }
}
