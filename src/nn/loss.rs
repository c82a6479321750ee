use serde::{Deserialize, Serialize};

use crate::error::GraphResult;
use crate::graph::SameDiff;
use crate::ops::OpBuilder;
use super::Activation;

/// Output-layer loss, averaged over the examples of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossFunction {
    /// Multi-class cross entropy against one-hot labels
    Mcxent,
    /// Mean squared error
    Mse,
}

impl LossFunction {
    /// Scalar loss of `pre_activation` passed through `activation`, against `labels`.
    ///
    /// Returns `(prediction, loss)`.
    pub(crate) fn define(
        &self,
        sd: &mut SameDiff,
        pre_activation: &str,
        activation: Activation,
        labels: &str,
    ) -> GraphResult<(String, String)> {
        let prediction = activation.apply(sd, pre_activation)?;
        let loss = match self {
            LossFunction::Mcxent => {
                // log-softmax of the logits is stabler than log of the softmax
                let log_p = if activation == Activation::Softmax {
                    sd.log_softmax(pre_activation, -1)?
                } else {
                    sd.log(&prediction)?
                };
                let weighted = sd.mul(labels, &log_p)?;
                let per_example = sd.sum(&weighted, &[-1], false)?;
                let mean = sd.mean(&per_example, &[], false)?;
                sd.neg(&mean)?
            }
            LossFunction::Mse => {
                let diff = sd.sub(&prediction, labels)?;
                let sq = sd.square(&diff)?;
                sd.mean(&sq, &[], false)?
            }
        };
        Ok((prediction, loss))
    }
}
