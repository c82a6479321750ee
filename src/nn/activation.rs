use serde::{Deserialize, Serialize};

use crate::error::GraphResult;
use crate::graph::SameDiff;
use crate::ops::OpBuilder;

/// Element-wise (or, for softmax, row-wise) layer activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Identity,
    Relu,
    Tanh,
    Sigmoid,
    /// Softmax over the last axis
    Softmax,
}

impl Activation {
    /// Apply to `x`, returning the activated variable
    pub fn apply(&self, sd: &mut SameDiff, x: &str) -> GraphResult<String> {
        match self {
            Activation::Identity => Ok(x.to_string()),
            Activation::Relu => sd.relu(x),
            Activation::Tanh => sd.tanh(x),
            Activation::Sigmoid => sd.sigmoid(x),
            Activation::Softmax => sd.softmax(x, -1),
        }
    }
}
