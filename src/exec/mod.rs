//! Execution: the op-executor contract, the reference CPU executor and the
//! graph execution engine

pub mod cpu;
mod engine;
mod session;

pub use cpu::CpuExecutor;
pub use session::InferenceSession;

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use crate::graph::{OpArgs, OpRecord};
use crate::ops::OpType;
use crate::tensor::{DType, NdArray};

/// Error codes reported by [`CpuExecutor`]
pub mod codes {
    pub const INVALID_ARGUMENT: i32 = 1;
    pub const SHAPE_MISMATCH: i32 = 2;
    pub const UNSUPPORTED_OP: i32 = 3;
    pub const UNSUPPORTED_DTYPE: i32 = 4;
}

/// Failure reported by an op executor
#[derive(Error, Debug, Clone, PartialEq)]
#[error("native error {code}: {message}")]
pub struct NativeError {
    pub code: i32,
    pub message: String,
}

impl NativeError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Per-invocation arguments handed to the executor.
///
/// One context is built for every dispatched op, so concurrently running
/// ops never share argument buffers or RNG state.
#[derive(Debug)]
pub struct OpContext {
    pub op_name: String,
    pub op_type: OpType,
    pub native_id: i32,
    pub int_args: Vec<i64>,
    pub float_args: Vec<f64>,
    pub bool_args: Vec<bool>,
    /// Explicit dtype argument (casts, generators)
    pub dtype_arg: Option<DType>,
    /// Dtypes the outputs must have
    pub output_dtypes: Vec<DType>,
    /// Preallocated outputs; empty asks the executor to allocate
    pub outputs: Vec<NdArray>,
    pub rng: StdRng,
}

impl OpContext {
    pub fn new(op_name: &str, op_type: OpType, args: &OpArgs, output_dtypes: Vec<DType>, seed: u64) -> Self {
        Self {
            op_name: op_name.to_string(),
            op_type,
            native_id: op_type.native_id(),
            int_args: args.ints.clone(),
            float_args: args.floats.clone(),
            bool_args: args.bools.clone(),
            dtype_arg: args.dtype,
            output_dtypes,
            outputs: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn for_op(op: &OpRecord, output_dtypes: Vec<DType>, seed: u64) -> Self {
        Self::new(&op.name, op.op_type, &op.args, output_dtypes, seed)
    }

    pub fn int_arg(&self, index: usize) -> Option<i64> {
        self.int_args.get(index).copied()
    }

    pub fn float_arg(&self, index: usize) -> Option<f64> {
        self.float_args.get(index).copied()
    }

    pub fn bool_arg(&self, index: usize) -> bool {
        self.bool_args.get(index).copied().unwrap_or(false)
    }

    pub fn output_dtype(&self, index: usize) -> DType {
        self.output_dtypes.get(index).copied().unwrap_or(DType::F32)
    }
}

/// The native backend the engine dispatches non-control-flow ops to.
///
/// Implementations must be callable from several worker threads at once
/// with distinct arguments.
pub trait OpExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(&self, ctx: &mut OpContext, inputs: &[NdArray]) -> Result<Vec<NdArray>, NativeError>;
}
