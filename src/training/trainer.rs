//! Plain gradient descent over a [`DataSource`]

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GraphError, GraphResult};
use crate::graph::SameDiff;
use super::DataSource;

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Trainable variables to update; empty means all of them
    pub parameters: Vec<String>,
    pub log_frequency: usize, // Log every N steps
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            learning_rate: 1e-2,
            parameters: Vec::new(),
            log_frequency: 100,
        }
    }
}

/// Losses recorded by `fit`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    /// Mean loss of every batch, in the order they were seen
    pub batch_losses: Vec<f64>,
    /// Mean batch loss per epoch
    pub epoch_losses: Vec<f64>,
}

impl TrainingHistory {
    pub fn final_loss(&self) -> Option<f64> {
        self.batch_losses.last().copied()
    }
}

impl SameDiff {
    /// Minimize the registered loss variables over `source`.
    ///
    /// Each batch binds placeholders, evaluates the losses and their
    /// gradients, then moves every parameter by `-learning_rate * gradient`.
    /// The gradient graph is built on the first batch and reused after.
    pub fn fit<S: DataSource + ?Sized>(&mut self, source: &mut S, config: &TrainingConfig) -> GraphResult<TrainingHistory> {
        if config.learning_rate <= 0.0 || !config.learning_rate.is_finite() {
            return Err(GraphError::InvalidArgument(format!(
                "learning rate must be positive, got {}",
                config.learning_rate
            )));
        }
        let parameters: Vec<&str> = config.parameters.iter().map(String::as_str).collect();
        let losses = self.loss_variables.clone();
        let start = Instant::now();
        let mut history = TrainingHistory::default();
        let mut step = 0usize;

        for epoch in 0..config.epochs {
            source.reset();
            let mut epoch_total = 0.0;
            let mut batches = 0usize;
            while let Some(batch) = source.next() {
                let grads = self.cached_gradient_map(&parameters)?;
                let mut requested: Vec<&str> = losses.iter().map(String::as_str).collect();
                requested.extend(grads.iter().map(|(_, g)| g));
                let values = self.execute(&requested, &batch)?;

                let mut loss = 0.0;
                for name in &losses {
                    let value = values
                        .get(name)
                        .ok_or_else(|| GraphError::OutputNotComputed(name.clone()))?;
                    if !value.is_empty() {
                        loss += value.data().iter().sum::<f64>() / value.len() as f64;
                    }
                }

                for (param, grad) in grads.iter() {
                    let gradient = values
                        .get(grad)
                        .ok_or_else(|| GraphError::OutputNotComputed(grad.to_string()))?;
                    let current = self
                        .variable_value(param)?
                        .cloned()
                        .ok_or_else(|| GraphError::Internal(format!("parameter '{}' has no value", param)))?;
                    let updated = current.sub_scaled(gradient, config.learning_rate)?;
                    self.set_variable_value(param, updated)?;
                }

                step += 1;
                batches += 1;
                epoch_total += loss;
                history.batch_losses.push(loss);
                if config.log_frequency > 0 && step % config.log_frequency == 0 {
                    info!(epoch, step, loss, "Training step");
                } else {
                    debug!(epoch, step, loss, "Training step");
                }
            }
            if batches > 0 {
                let mean = epoch_total / batches as f64;
                history.epoch_losses.push(mean);
                info!(epoch, loss = mean, batches, "Epoch finished");
            }
        }

        info!(
            steps = step,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Training finished"
        );
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpBuilder;
    use crate::tensor::{DType, NdArray, Shape};
    use crate::training::InMemorySource;

    /// Fit y = 3x with a single weight and squared error
    fn linear_problem() -> (SameDiff, InMemorySource) {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F64, Shape::from_dims(vec![None, Some(1)])).unwrap();
        sd.placeholder("y", DType::F64, Shape::from_dims(vec![None, Some(1)])).unwrap();
        sd.var("w", NdArray::new(&[1, 1], DType::F64, vec![0.0]).unwrap()).unwrap();
        let pred = sd.matmul("x", "w").unwrap();
        let diff = sd.sub(&pred, "y").unwrap();
        let sq = sd.square(&diff).unwrap();
        let loss = sd.mean(&sq, &[], false).unwrap();
        sd.set_loss_variables(&[&loss]).unwrap();

        let xs: Vec<f64> = (1..=8).map(|i| i as f64 / 8.0).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 3.0 * x).collect();
        let x = NdArray::new(&[8, 1], DType::F64, xs).unwrap();
        let y = NdArray::new(&[8, 1], DType::F64, ys).unwrap();
        let source = InMemorySource::from_arrays("x", &x, "y", &y, 4).unwrap();
        (sd, source)
    }

    #[test]
    fn test_fit_reduces_loss() {
        let (mut sd, mut source) = linear_problem();
        let config = TrainingConfig {
            epochs: 30,
            learning_rate: 0.5,
            ..Default::default()
        };
        let history = sd.fit(&mut source, &config).unwrap();
        assert_eq!(history.batch_losses.len(), 60);
        assert_eq!(history.epoch_losses.len(), 30);
        assert!(history.final_loss().unwrap() < history.batch_losses[0] * 0.01);

        let w = sd.variable_value("w").unwrap().unwrap().to_vec()[0];
        assert!((w - 3.0).abs() < 0.1, "w = {w}");
    }

    #[test]
    fn test_fit_reuses_gradient_graph() {
        let (mut sd, mut source) = linear_problem();
        let config = TrainingConfig::default();
        sd.fit(&mut source, &config).unwrap();
        let ops = sd.num_operations();
        sd.fit(&mut source, &config).unwrap();
        assert_eq!(sd.num_operations(), ops);
    }

    #[test]
    fn test_fit_rejects_bad_learning_rate() {
        let (mut sd, mut source) = linear_problem();
        let config = TrainingConfig {
            learning_rate: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            sd.fit(&mut source, &config),
            Err(GraphError::InvalidArgument(_))
        ));
    }
}
