use ndarray::{s, Array2, ArrayView2};
use ort::value::Tensor;

/// Preallocated host-side input buffer for one full inference batch.
///
/// The network graphs have a fixed batch dimension, so the buffer is sized
/// once and reused for the lifetime of its worker. Rows past the number of
/// positions actually written may hold leftovers from a previous batch; the
/// corresponding output rows are never read.
#[derive(Debug, Clone)]
pub struct Batch {
    array: Array2<f32>,
    batch_size: usize,
}

impl Batch {
    pub fn new(batch_size: usize, num_board_features: usize) -> Self {
        let array = Array2::zeros((batch_size, num_board_features));
        Batch { array, batch_size }
    }

    /// Copies one position's flattened planes into row `index`.
    pub fn write_item(&mut self, index: usize, features: &[f32]) {
        debug_assert!(
            index < self.batch_size,
            "index {} out of bounds for batch size {}",
            index,
            self.batch_size
        );
        let mut row = self.array.slice_mut(s![index, ..]);
        row.as_slice_mut()
            .expect("batch rows are contiguous")
            .copy_from_slice(features);
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.array.view()
    }

    pub fn tensor(&self) -> Tensor<f32> {
        Tensor::from_array(self.array.clone()).expect("Failed to convert array to Tensor")
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}
