use thiserror::Error;

use crate::tensor::DType;

/// Main error type for graph construction, differentiation and execution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// A variable or operation name is already taken
    #[error("Name collision: '{name}' is already in use")]
    NameCollision { name: String },

    #[error("Unknown variable: '{0}'")]
    UnknownVariable(String),

    #[error("Unknown operation: '{0}'")]
    UnknownOperation(String),

    /// An operation references an input variable that is not registered
    #[error("Missing input '{input}' for operation '{op}'")]
    MissingInput { op: String, input: String },

    #[error("Unknown operation type: '{0}'")]
    UnknownOperationType(String),

    /// An input violates the op type's declared type constraint
    #[error("Type mismatch in '{op}': {message}")]
    TypeMismatch { op: String, message: String },

    #[error("Invalid axis {axis} for '{op}' (input rank {rank})")]
    InvalidAxis { op: String, axis: i64, rank: usize },

    #[error("Cannot broadcast shapes {a} and {b} in '{op}'")]
    BroadcastShape { op: String, a: String, b: String },

    /// Static shape incompatibility that is not a broadcast failure
    #[error("Shape error in '{op}': {message}")]
    ShapeInference { op: String, message: String },

    /// The predicate of an if/while block is not boolean
    #[error("Condition '{name}' must be boolean, got {dtype}")]
    ConditionType { name: String, dtype: DType },

    #[error("No gradient rule for op type '{op_type}' (operation '{op}')")]
    NoGradientRule { op_type: String, op: String },

    #[error("Placeholder '{0}' has no binding and no default value")]
    MissingPlaceholder(String),

    #[error("Shape mismatch at runtime for '{name}': expected {expected}, got {actual}")]
    ShapeMismatchAtRuntime {
        name: String,
        expected: String,
        actual: String,
    },

    /// Failure reported by the op executor, code and message verbatim
    #[error("Native execution failed in '{op}' (code {code}): {message}")]
    NativeExecution {
        op: String,
        code: i32,
        message: String,
    },

    /// A requested output lies on a switch branch that was not taken
    #[error("Output '{0}' was not computed: it is only reachable through an untaken branch")]
    OutputNotComputed(String),

    #[error("Loop frame '{frame}' exceeded {limit} iterations")]
    LoopLimitExceeded { frame: String, limit: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Value exchange with the embedded interpreter failed
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GraphError {
    pub fn name_collision(name: &str) -> Self {
        GraphError::NameCollision {
            name: name.to_string(),
        }
    }

    pub fn missing_input(op: &str, input: &str) -> Self {
        GraphError::MissingInput {
            op: op.to_string(),
            input: input.to_string(),
        }
    }

    pub fn type_mismatch(op: &str, message: impl Into<String>) -> Self {
        GraphError::TypeMismatch {
            op: op.to_string(),
            message: message.into(),
        }
    }

    pub fn shape_inference(op: &str, message: impl Into<String>) -> Self {
        GraphError::ShapeInference {
            op: op.to_string(),
            message: message.into(),
        }
    }

    pub fn native(op: &str, code: i32, message: &str) -> Self {
        GraphError::NativeExecution {
            op: op.to_string(),
            code,
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for GraphError {
    fn from(err: std::io::Error) -> Self {
        GraphError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Serialization(err.to_string())
    }
}

/// Result type for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NameCollision,
    UnknownEntity,
    MissingInput,
    TypeMismatch,
    InvalidShape,
    InvalidCondition,
    NoGradient,
    MissingBinding,
    NativeFailure,
    Unreachable,
    InvalidConfig,
    ConversionFailed,
    InternalError,
}

/// The stage of the graph lifecycle an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorPhase {
    Construction,
    Differentiation,
    Execution,
    Environment,
}

impl GraphError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            GraphError::NameCollision { .. } => ErrorCode::NameCollision,
            GraphError::UnknownVariable(_)
            | GraphError::UnknownOperation(_)
            | GraphError::UnknownOperationType(_) => ErrorCode::UnknownEntity,
            GraphError::MissingInput { .. } => ErrorCode::MissingInput,
            GraphError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            GraphError::InvalidAxis { .. }
            | GraphError::BroadcastShape { .. }
            | GraphError::ShapeInference { .. }
            | GraphError::ShapeMismatchAtRuntime { .. } => ErrorCode::InvalidShape,
            GraphError::ConditionType { .. } => ErrorCode::InvalidCondition,
            GraphError::NoGradientRule { .. } => ErrorCode::NoGradient,
            GraphError::MissingPlaceholder(_) => ErrorCode::MissingBinding,
            GraphError::NativeExecution { .. } => ErrorCode::NativeFailure,
            GraphError::OutputNotComputed(_) | GraphError::LoopLimitExceeded { .. } => {
                ErrorCode::Unreachable
            }
            GraphError::InvalidArgument(_) | GraphError::Configuration(_) => {
                ErrorCode::InvalidConfig
            }
            GraphError::Io(_) | GraphError::Serialization(_) | GraphError::Conversion(_) => {
                ErrorCode::ConversionFailed
            }
            GraphError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Which propagation group this error belongs to
    pub fn phase(&self) -> ErrorPhase {
        match self {
            GraphError::NameCollision { .. }
            | GraphError::UnknownVariable(_)
            | GraphError::UnknownOperation(_)
            | GraphError::MissingInput { .. }
            | GraphError::UnknownOperationType(_)
            | GraphError::TypeMismatch { .. }
            | GraphError::InvalidAxis { .. }
            | GraphError::BroadcastShape { .. }
            | GraphError::ShapeInference { .. }
            | GraphError::ConditionType { .. } => ErrorPhase::Construction,
            GraphError::NoGradientRule { .. } => ErrorPhase::Differentiation,
            GraphError::MissingPlaceholder(_)
            | GraphError::ShapeMismatchAtRuntime { .. }
            | GraphError::NativeExecution { .. }
            | GraphError::OutputNotComputed(_)
            | GraphError::LoopLimitExceeded { .. } => ErrorPhase::Execution,
            GraphError::InvalidArgument(_)
            | GraphError::Configuration(_)
            | GraphError::Io(_)
            | GraphError::Serialization(_)
            | GraphError::Conversion(_)
            | GraphError::Internal(_) => ErrorPhase::Environment,
        }
    }
}
