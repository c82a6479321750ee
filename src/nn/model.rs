use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GraphError, GraphResult};
use crate::graph::SameDiff;
use crate::ops::OpBuilder;
use crate::tensor::{DType, Shape};
use super::{Dense, Layer, Output};

/// A feed-forward network: dense layers followed by one output layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequential {
    pub hidden: Vec<Dense>,
    pub output: Output,
    /// Seed for weight initialization
    pub seed: u64,
}

/// Names of the interesting variables of a converted network
#[derive(Debug)]
pub struct NetworkGraph {
    pub graph: SameDiff,
    pub input: String,
    pub labels: String,
    pub prediction: String,
    pub loss: String,
    /// Trainable variables, layer by layer
    pub parameters: Vec<String>,
}

impl Sequential {
    pub fn new(hidden: Vec<Dense>, output: Output) -> Self {
        Self {
            hidden,
            output,
            seed: 42,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Layers must chain: every `n_in` equals the previous `n_out`
    pub fn validate(&self) -> GraphResult<()> {
        let mut layers: Vec<&dyn Layer> = self.hidden.iter().map(|l| l as &dyn Layer).collect();
        layers.push(&self.output);
        for (i, pair) in layers.windows(2).enumerate() {
            if pair[0].n_out() != pair[1].n_in() {
                return Err(GraphError::InvalidArgument(format!(
                    "layer {} outputs {} features but layer {} expects {}",
                    i,
                    pair[0].n_out(),
                    i + 1,
                    pair[1].n_in()
                )));
            }
        }
        Ok(())
    }

    /// Build the network on a fresh graph.
    ///
    /// Features bind to placeholder `input` of shape `[?, n_in]` and one-hot
    /// or regression targets to `labels` of shape `[?, n_out]`. Layer `i`
    /// keeps its parameters in scope `layer{i}`; the loss is registered as
    /// the graph's loss variable.
    pub fn to_samediff(&self) -> GraphResult<NetworkGraph> {
        self.validate()?;
        let mut sd = SameDiff::new();
        let mut rng = fastrand::Rng::with_seed(self.seed);
        let n_in = self.hidden.first().map_or(self.output.n_in, |l| l.n_in);

        let input = sd.placeholder("input", DType::F32, Shape::from_dims(vec![None, Some(n_in)]))?;
        let labels = sd.placeholder(
            "labels",
            DType::F32,
            Shape::from_dims(vec![None, Some(self.output.n_out)]),
        )?;

        let mut x = input.clone();
        for (i, layer) in self.hidden.iter().enumerate() {
            sd.push_scope(&format!("layer{}", i));
            let out = layer.define(&mut sd, &x, &mut rng);
            sd.pop_scope();
            x = out?;
        }
        sd.push_scope(&format!("layer{}", self.hidden.len()));
        let out = self.output.define(&mut sd, &x, &labels, &mut rng);
        sd.pop_scope();
        let (prediction, loss) = out?;
        sd.set_loss_variables(&[&loss])?;

        let parameters: Vec<String> = (0..=self.hidden.len())
            .flat_map(|i| [format!("layer{}/W", i), format!("layer{}/b", i)])
            .collect();
        info!(
            layers = self.hidden.len() + 1,
            parameters = parameters.len(),
            operations = sd.num_operations(),
            "Converted network to graph"
        );
        Ok(NetworkGraph {
            graph: sd,
            input,
            labels,
            prediction,
            loss,
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::graph::VariableKind;
    use crate::nn::{Activation, LossFunction};
    use crate::tensor::NdArray;
    use crate::training::{InMemorySource, TrainingConfig};

    fn classifier() -> Sequential {
        Sequential::new(
            vec![Dense::new(2, 8, Activation::Tanh)],
            Output::new(8, 2, Activation::Softmax, LossFunction::Mcxent),
        )
    }

    #[test]
    fn test_layer_sizes_must_chain() {
        let net = Sequential::new(
            vec![Dense::new(2, 8, Activation::Relu)],
            Output::new(4, 2, Activation::Softmax, LossFunction::Mcxent),
        );
        assert!(matches!(net.to_samediff(), Err(GraphError::InvalidArgument(_))));
    }

    #[test]
    fn test_parameters_are_trainable_variables() {
        let net = classifier().to_samediff().unwrap();
        assert_eq!(net.parameters, vec!["layer0/W", "layer0/b", "layer1/W", "layer1/b"]);
        for p in &net.parameters {
            assert_eq!(net.graph.variable(p).unwrap().kind(), VariableKind::Variable);
        }
        assert_eq!(net.graph.variable("layer0/W").unwrap().shape().to_known(), Some(vec![2, 8]));
        assert_eq!(net.graph.loss_variables(), &[net.loss.clone()]);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = classifier().to_samediff().unwrap();
        let b = classifier().to_samediff().unwrap();
        let c = classifier().with_seed(7).to_samediff().unwrap();
        let w = |n: &NetworkGraph| n.graph.variable_value("layer0/W").unwrap().unwrap().to_vec();
        assert_eq!(w(&a), w(&b));
        assert_ne!(w(&a), w(&c));
    }

    #[test]
    fn test_predictions_are_distributions() {
        let net = classifier().to_samediff().unwrap();
        let mut bindings = HashMap::new();
        bindings.insert(
            net.input.clone(),
            NdArray::from_f32(vec![0.0, 1.0, 1.0, 0.0, 0.5, 0.5], &[3, 2]).unwrap(),
        );
        let p = net.graph.execute_one(&net.prediction, &bindings).unwrap();
        assert_eq!(p.shape(), &[3, 2]);
        for row in p.data().chunks(2) {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_training_separates_classes() {
        let mut net = classifier().to_samediff().unwrap();
        // class 0 left of the y axis, class 1 right of it
        let xs = vec![-1.0, 0.5, -0.8, -0.3, -0.6, 0.9, 0.7, -0.4, 0.9, 0.2, 0.6, 0.8];
        let ys = vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0];
        let x = NdArray::from_f32(xs, &[6, 2]).unwrap();
        let y = NdArray::from_f32(ys, &[6, 2]).unwrap();
        let mut source = InMemorySource::from_arrays(&net.input, &x, &net.labels, &y, 6).unwrap();
        let config = TrainingConfig {
            epochs: 200,
            learning_rate: 0.5,
            ..Default::default()
        };
        let history = net.graph.fit(&mut source, &config).unwrap();
        assert!(history.final_loss().unwrap() < 0.2, "{:?}", history.final_loss());
    }
}
