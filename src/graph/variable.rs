//! Graph variables

use serde::{Deserialize, Serialize};

use crate::tensor::{DType, NdArray, Shape};
use super::op::OpId;

/// How a variable obtains its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableKind {
    /// Supplied fresh at each execution call
    Placeholder,
    /// Fixed value baked into the graph
    Constant,
    /// Produced by exactly one operation
    Array,
    /// Trainable parameter with a persistent value
    Variable,
}

impl VariableKind {
    /// Kinds whose value does not come from an operation
    pub fn is_global(&self) -> bool {
        !matches!(self, VariableKind::Array)
    }

    pub(crate) fn base_name(&self) -> &'static str {
        match self {
            VariableKind::Placeholder => "placeholder",
            VariableKind::Constant => "constant",
            VariableKind::Array => "array",
            VariableKind::Variable => "variable",
        }
    }
}

/// A named value flowing through the graph
#[derive(Debug, Clone)]
pub struct Variable {
    pub(crate) name: String,
    pub(crate) kind: VariableKind,
    pub(crate) shape: Shape,
    pub(crate) dtype: DType,
    pub(crate) value: Option<NdArray>,
    pub(crate) producer: Option<OpId>,
    pub(crate) scope: Option<String>,
    /// Creation sequence number, monotonic per graph
    pub(crate) seq: u64,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Attached value: always present for constants and trainable
    /// variables, a default for placeholders
    pub fn value(&self) -> Option<&NdArray> {
        self.value.as_ref()
    }

    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == VariableKind::Placeholder
    }
}
