//! SameDiff-rs - automatic differentiation over named computation graphs
//!
//! Features:
//! - Graph building with eager shape and dtype inference
//! - Structured if/while blocks lowered to dataflow control flow
//! - Reverse-mode gradients built into the same graph, differentiable again
//! - Frame-aware execution with parallel dispatch and a value cache
//! - Pluggable op executor with a reference CPU implementation
//! - Gradient-descent training, network conversion and interpreter value exchange

pub mod autodiff;
pub mod config;
pub mod control_flow;
pub mod error;
pub mod exec;
pub mod graph;
pub mod interop;
pub mod nn;
pub mod ops;
pub mod tensor;
pub mod training;

use std::sync::Once;

pub use autodiff::GradientMap;
pub use config::{ConfigBuilder, EngineConfig};
pub use error::{GraphError, GraphResult};
pub use exec::{CpuExecutor, InferenceSession, NativeError, OpContext, OpExecutor};
pub use graph::{OpArgs, OpId, SameDiff, Variable, VariableKind};
pub use ops::{OpBuilder, OpType};
pub use tensor::{DType, NdArray, Shape};

/// Everything needed to build and run graphs
pub mod prelude {
    pub use crate::autodiff::GradientMap;
    pub use crate::config::EngineConfig;
    pub use crate::control_flow::BlockContext;
    pub use crate::error::{GraphError, GraphResult};
    pub use crate::graph::{SameDiff, VariableKind};
    pub use crate::ops::{OpBuilder, OpType};
    pub use crate::tensor::{DType, NdArray, Shape};
    pub use crate::training::{DataSource, InMemorySource, TrainingConfig};
}

/// Install the fmt tracing subscriber; later calls do nothing
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Another subscriber may already be installed by the host application
        let _ = tracing_subscriber::fmt().try_init();
        tracing::info!(version = version(), "samediff initialized");
    });
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::prelude::*;

    #[test]
    fn test_init_is_idempotent() {
        super::init();
        super::init();
        assert!(!super::version().is_empty());
    }

    #[test]
    fn test_build_differentiate_execute() {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F64, Shape::known(&[3])).unwrap();
        sd.var("w", NdArray::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap()).unwrap();
        let prod = sd.mul("x", "w").unwrap();
        let loss = sd.sum(&prod, &[], false).unwrap();
        sd.set_loss_variables(&[&loss]).unwrap();

        let mut bindings = HashMap::new();
        bindings.insert("x".to_string(), NdArray::from_vec(vec![4.0, 5.0, 6.0], &[3]).unwrap());
        assert_eq!(sd.execute_one(&loss, &bindings).unwrap().scalar_value(), Some(32.0));

        let grads = sd.calculate_gradients(&bindings, &["w"]).unwrap();
        assert_eq!(grads["w"].to_vec(), vec![4.0, 5.0, 6.0]);
    }
}
