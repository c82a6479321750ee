use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};
use crate::graph::SameDiff;
use crate::ops::OpBuilder;
use crate::tensor::{DType, NdArray};
use super::{Activation, LossFunction};

/// A fully connected layer configuration
pub trait Layer: fmt::Debug {
    fn n_in(&self) -> usize;

    fn n_out(&self) -> usize;

    fn activation(&self) -> Activation;

    /// Register `W` and `b` in the current scope and return `input @ W + b`
    fn define_affine(&self, sd: &mut SameDiff, input: &str, rng: &mut fastrand::Rng) -> GraphResult<String> {
        let (n_in, n_out) = (self.n_in(), self.n_out());
        if n_in == 0 || n_out == 0 {
            return Err(GraphError::InvalidArgument(format!(
                "layer sizes must be positive, got {} -> {}",
                n_in, n_out
            )));
        }
        // Xavier uniform
        let limit = (6.0 / (n_in + n_out) as f64).sqrt();
        let weights = (0..n_in * n_out).map(|_| (rng.f64() * 2.0 - 1.0) * limit).collect();
        let w = sd.var("W", NdArray::new(&[n_in, n_out], DType::F32, weights)?)?;
        let b = sd.var("b", NdArray::zeros(&[n_out], DType::F32))?;
        let z = sd.matmul(input, &w)?;
        sd.add(&z, &b)
    }
}

/// Hidden layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub n_in: usize,
    pub n_out: usize,
    pub activation: Activation,
}

impl Dense {
    pub fn new(n_in: usize, n_out: usize, activation: Activation) -> Self {
        Self {
            n_in,
            n_out,
            activation,
        }
    }

    pub(crate) fn define(&self, sd: &mut SameDiff, input: &str, rng: &mut fastrand::Rng) -> GraphResult<String> {
        let z = self.define_affine(sd, input, rng)?;
        self.activation.apply(sd, &z)
    }
}

impl Layer for Dense {
    fn n_in(&self) -> usize {
        self.n_in
    }

    fn n_out(&self) -> usize {
        self.n_out
    }

    fn activation(&self) -> Activation {
        self.activation
    }
}

/// Final layer, carrying the loss the network is trained on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub n_in: usize,
    pub n_out: usize,
    pub activation: Activation,
    pub loss: LossFunction,
}

impl Output {
    pub fn new(n_in: usize, n_out: usize, activation: Activation, loss: LossFunction) -> Self {
        Self {
            n_in,
            n_out,
            activation,
            loss,
        }
    }

    /// Returns `(prediction, loss)`
    pub(crate) fn define(
        &self,
        sd: &mut SameDiff,
        input: &str,
        labels: &str,
        rng: &mut fastrand::Rng,
    ) -> GraphResult<(String, String)> {
        let z = self.define_affine(sd, input, rng)?;
        self.loss.define(sd, &z, self.activation, labels)
    }
}

impl Layer for Output {
    fn n_in(&self) -> usize {
        self.n_in
    }

    fn n_out(&self) -> usize {
        self.n_out
    }

    fn activation(&self) -> Activation {
        self.activation
    }
}
