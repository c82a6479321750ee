//! Network configurations that translate themselves into graph calls
//!
//! A [`Sequential`] stack of [`Dense`] layers ending in an [`Output`] layer
//! becomes placeholders for features and labels, trainable weights and a
//! registered loss variable on a fresh [`SameDiff`](crate::graph::SameDiff).

mod activation;
mod layers;
mod loss;
mod model;

pub use activation::Activation;
pub use layers::{Dense, Layer, Output};
pub use loss::LossFunction;
pub use model::{NetworkGraph, Sequential};
