//! Array capability used by the graph engine
//!
//! The engine never interprets raw bytes: static shapes and dtypes describe
//! graph variables, and `NdArray` is the concrete value handed to and returned
//! from the op executor.

pub mod dtype;
pub mod shape;
pub mod array;

// Re-export main types for convenience
pub use dtype::DType;
pub use shape::{broadcast_shapes, normalize_axis, strides_for, Shape};
pub use array::{cast_value, NdArray};
