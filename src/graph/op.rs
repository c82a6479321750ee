//! Operation records

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ops::OpType;
use crate::tensor::DType;

/// Index of an operation in the graph's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub(crate) usize);

impl OpId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Non-tensor configuration of an operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpArgs {
    pub floats: Vec<f64>,
    pub ints: Vec<i64>,
    pub bools: Vec<bool>,
    /// Target dtype for casts and generators
    pub dtype: Option<DType>,
    /// Execution frame of loop primitives
    pub frame: Option<String>,
    /// Forward frame a backward loop walks in reverse, set on its enters
    #[serde(default)]
    pub replays: Option<String>,
}

impl OpArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_floats(mut self, floats: &[f64]) -> Self {
        self.floats = floats.to_vec();
        self
    }

    pub fn with_ints(mut self, ints: &[i64]) -> Self {
        self.ints = ints.to_vec();
        self
    }

    pub fn with_bools(mut self, bools: &[bool]) -> Self {
        self.bools = bools.to_vec();
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_frame(mut self, frame: &str) -> Self {
        self.frame = Some(frame.to_string());
        self
    }

    pub fn with_replays(mut self, forward_frame: &str) -> Self {
        self.replays = Some(forward_frame.to_string());
        self
    }

    pub fn float(&self, index: usize) -> Option<f64> {
        self.floats.get(index).copied()
    }

    pub fn int(&self, index: usize) -> Option<i64> {
        self.ints.get(index).copied()
    }

    /// Boolean flag, false when absent
    pub fn flag(&self, index: usize) -> bool {
        self.bools.get(index).copied().unwrap_or(false)
    }
}

/// One instance of an op type applied to ordered inputs
#[derive(Debug, Clone)]
pub struct OpRecord {
    pub(crate) id: OpId,
    pub(crate) name: String,
    pub(crate) op_type: OpType,
    pub(crate) inputs: Vec<String>,
    pub(crate) outputs: Vec<String>,
    pub(crate) args: OpArgs,
    /// Variables that must be computed before this op runs without feeding it data
    pub(crate) control_deps: Vec<String>,
    pub(crate) scope: Option<String>,
}

impl OpRecord {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn args(&self) -> &OpArgs {
        &self.args
    }

    pub fn control_deps(&self) -> &[String] {
        &self.control_deps
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn input(&self, index: usize) -> Option<&str> {
        self.inputs.get(index).map(|s| s.as_str())
    }

    pub fn output(&self, index: usize) -> Option<&str> {
        self.outputs.get(index).map(|s| s.as_str())
    }

    /// Frame named by a loop primitive
    pub fn frame(&self) -> Option<&str> {
        self.args.frame.as_deref()
    }
}
