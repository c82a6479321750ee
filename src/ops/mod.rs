//! Op-type table
//!
//! Every op type is a variant of `OpType`; its contract (input arity, type
//! constraints, output shape and dtype rules, native op number and gradient
//! rule) is one `OpDescriptor` entry in a lazily built table. Creating an op
//! or differentiating through one is a table lookup.

pub mod inference;
pub mod gradients;
pub mod builder;

pub use builder::OpBuilder;
pub use inference::infer_outputs;

use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};
use crate::graph::{OpRecord, SameDiff};
use crate::tensor::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpType {
    // Element-wise binary arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
    // Comparisons and logic
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Not,
    // Element-wise unary math
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Square,
    Tanh,
    Sigmoid,
    Relu,
    Sin,
    Cos,
    Sign,
    Step,
    // Scalar-argument ops
    AddScalar,
    MulScalar,
    PowScalar,
    // Reductions
    Sum,
    Mean,
    Max,
    Min,
    Prod,
    ArgMax,
    Softmax,
    LogSoftmax,
    MatMul,
    Transpose,
    Reshape,
    Cast,
    Identity,
    OnesLike,
    ZerosLike,
    Shape,
    RandomUniform,
    // Backprop helpers
    SumBp,
    MeanBp,
    MaxBp,
    MinBp,
    ReduceToShape,
    // Control-flow primitives
    Enter,
    Exit,
    Switch,
    Merge,
    NextIteration,
    /// Forward iteration replayed by the current backward loop iteration
    ForwardIteration,
    GradientBackwardsMarker,
}

impl OpType {
    pub fn descriptor(&self) -> &'static OpDescriptor {
        &OP_TABLE[self]
    }

    pub fn name(&self) -> &'static str {
        self.descriptor().name
    }

    pub fn native_id(&self) -> i32 {
        self.descriptor().native_id
    }

    /// Look up an op type by its registered name
    pub fn from_name(name: &str) -> GraphResult<OpType> {
        OP_NAMES
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownOperationType(name.to_string()))
    }

    /// Primitives interpreted by the execution engine rather than the executor
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            OpType::Enter
                | OpType::Exit
                | OpType::Switch
                | OpType::Merge
                | OpType::NextIteration
                | OpType::ForwardIteration
        )
    }

    pub fn all() -> impl Iterator<Item = OpType> {
        OP_LIST.iter().map(|d| d.0)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of data inputs an op type accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    Between(usize, usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Exact(k) => n == k,
            Arity::Between(lo, hi) => n >= lo && n <= hi,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(k) => write!(f, "{}", k),
            Arity::Between(lo, hi) => write!(f, "{} to {}", lo, hi),
        }
    }
}

/// Dtype family an input must belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeConstraint {
    Any,
    Numeric,
    Float,
    Integer,
    Bool,
    NumericOrBool,
}

impl TypeConstraint {
    pub fn accepts(&self, dtype: DType) -> bool {
        match self {
            TypeConstraint::Any => true,
            TypeConstraint::Numeric => dtype.is_numeric(),
            TypeConstraint::Float => dtype.is_float(),
            TypeConstraint::Integer => dtype.is_int(),
            TypeConstraint::Bool => dtype.is_bool(),
            TypeConstraint::NumericOrBool => dtype.is_numeric() || dtype.is_bool(),
        }
    }
}

impl fmt::Display for TypeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeConstraint::Any => "any",
            TypeConstraint::Numeric => "numeric",
            TypeConstraint::Float => "floating point",
            TypeConstraint::Integer => "integer",
            TypeConstraint::Bool => "boolean",
            TypeConstraint::NumericOrBool => "numeric or boolean",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DTypeRule {
    /// Promoted type of all inputs
    Promote,
    /// Promoted type, integers widened to float32
    FloatPromote,
    Bool,
    FromInput(usize),
    /// `args.dtype`, required
    Explicit,
    /// `args.dtype` when given
    ArgOr(DType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeRule {
    FromInput(usize),
    /// Same as input 0, validating the axis in `ints[0]`
    SameWithAxis,
    Broadcast,
    /// Axes in `ints` (all when empty), keep dims in `bools[0]`
    Reduce,
    MatMul,
    Transpose,
    Reshape,
    ShapeOf,
    /// Shape listed in `ints`
    FromArgs,
    Merge,
}

pub type GradFn = fn(&mut SameDiff, &OpRecord, &[Option<String>]) -> GraphResult<Vec<Option<String>>>;

#[derive(Clone, Copy)]
pub enum GradRule {
    Rule(GradFn),
    /// Gradient is identically zero or undefined; nothing flows to the inputs
    NotDifferentiable,
    Missing,
}

impl fmt::Debug for GradRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GradRule::Rule(_) => f.write_str("Rule"),
            GradRule::NotDifferentiable => f.write_str("NotDifferentiable"),
            GradRule::Missing => f.write_str("Missing"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpDescriptor {
    pub op_type: OpType,
    pub name: &'static str,
    pub native_id: i32,
    pub arity: Arity,
    /// Per-input constraints, the last one repeating
    pub constraints: &'static [TypeConstraint],
    pub num_outputs: usize,
    pub dtype_rule: DTypeRule,
    pub shape_rule: ShapeRule,
    pub gradient: GradRule,
    /// Produces different values on every run
    pub stateful: bool,
}

impl OpDescriptor {
    pub fn constraint(&self, index: usize) -> TypeConstraint {
        self.constraints
            .get(index)
            .or_else(|| self.constraints.last())
            .copied()
            .unwrap_or(TypeConstraint::Any)
    }
}

use self::gradients as g;
use self::Arity::{Between, Exact};
use self::TypeConstraint as C;

const NUMERIC: &[TypeConstraint] = &[C::Numeric];
const ANY: &[TypeConstraint] = &[C::Any];
const BOOL: &[TypeConstraint] = &[C::Bool];
const NONE: &[TypeConstraint] = &[];

type Entry = (
    OpType,
    &'static str,
    Arity,
    &'static [TypeConstraint],
    usize,
    DTypeRule,
    ShapeRule,
    GradRule,
);

lazy_static! {
    static ref OP_LIST: Vec<Entry> = {
        use self::DTypeRule as D;
        use self::GradRule::{Missing, NotDifferentiable as ND, Rule};
        use self::ShapeRule as S;
        vec![
            (OpType::Add, "add", Exact(2), NUMERIC, 1, D::Promote, S::Broadcast, Rule(g::add)),
            (OpType::Sub, "sub", Exact(2), NUMERIC, 1, D::Promote, S::Broadcast, Rule(g::sub)),
            (OpType::Mul, "mul", Exact(2), NUMERIC, 1, D::Promote, S::Broadcast, Rule(g::mul)),
            (OpType::Div, "div", Exact(2), NUMERIC, 1, D::Promote, S::Broadcast, Rule(g::div)),
            (OpType::Maximum, "maximum", Exact(2), NUMERIC, 1, D::Promote, S::Broadcast, Rule(g::maximum)),
            (OpType::Minimum, "minimum", Exact(2), NUMERIC, 1, D::Promote, S::Broadcast, Rule(g::minimum)),
            (OpType::Eq, "eq", Exact(2), &[C::NumericOrBool], 1, D::Bool, S::Broadcast, ND),
            (OpType::Neq, "neq", Exact(2), &[C::NumericOrBool], 1, D::Bool, S::Broadcast, ND),
            (OpType::Lt, "lt", Exact(2), NUMERIC, 1, D::Bool, S::Broadcast, ND),
            (OpType::Lte, "lte", Exact(2), NUMERIC, 1, D::Bool, S::Broadcast, ND),
            (OpType::Gt, "gt", Exact(2), NUMERIC, 1, D::Bool, S::Broadcast, ND),
            (OpType::Gte, "gte", Exact(2), NUMERIC, 1, D::Bool, S::Broadcast, ND),
            (OpType::And, "and", Exact(2), BOOL, 1, D::Bool, S::Broadcast, ND),
            (OpType::Or, "or", Exact(2), BOOL, 1, D::Bool, S::Broadcast, ND),
            (OpType::Not, "not", Exact(1), BOOL, 1, D::Bool, S::FromInput(0), ND),
            (OpType::Neg, "neg", Exact(1), NUMERIC, 1, D::FromInput(0), S::FromInput(0), Rule(g::neg)),
            (OpType::Abs, "abs", Exact(1), NUMERIC, 1, D::FromInput(0), S::FromInput(0), Rule(g::abs)),
            (OpType::Exp, "exp", Exact(1), NUMERIC, 1, D::FloatPromote, S::FromInput(0), Rule(g::exp)),
            (OpType::Log, "log", Exact(1), NUMERIC, 1, D::FloatPromote, S::FromInput(0), Rule(g::log)),
            (OpType::Sqrt, "sqrt", Exact(1), NUMERIC, 1, D::FloatPromote, S::FromInput(0), Rule(g::sqrt)),
            (OpType::Square, "square", Exact(1), NUMERIC, 1, D::FromInput(0), S::FromInput(0), Rule(g::square)),
            (OpType::Tanh, "tanh", Exact(1), NUMERIC, 1, D::FloatPromote, S::FromInput(0), Rule(g::tanh)),
            (OpType::Sigmoid, "sigmoid", Exact(1), NUMERIC, 1, D::FloatPromote, S::FromInput(0), Rule(g::sigmoid)),
            (OpType::Relu, "relu", Exact(1), NUMERIC, 1, D::FromInput(0), S::FromInput(0), Rule(g::relu)),
            (OpType::Sin, "sin", Exact(1), NUMERIC, 1, D::FloatPromote, S::FromInput(0), Rule(g::sin)),
            (OpType::Cos, "cos", Exact(1), NUMERIC, 1, D::FloatPromote, S::FromInput(0), Rule(g::cos)),
            (OpType::Sign, "sign", Exact(1), NUMERIC, 1, D::FromInput(0), S::FromInput(0), ND),
            (OpType::Step, "step", Exact(1), NUMERIC, 1, D::FromInput(0), S::FromInput(0), ND),
            (OpType::AddScalar, "add_scalar", Exact(1), NUMERIC, 1, D::FromInput(0), S::FromInput(0), Rule(g::add_scalar)),
            (OpType::MulScalar, "mul_scalar", Exact(1), NUMERIC, 1, D::FromInput(0), S::FromInput(0), Rule(g::mul_scalar)),
            (OpType::PowScalar, "pow_scalar", Exact(1), NUMERIC, 1, D::FloatPromote, S::FromInput(0), Rule(g::pow_scalar)),
            (OpType::Sum, "reduce_sum", Exact(1), NUMERIC, 1, D::FromInput(0), S::Reduce, Rule(g::sum)),
            (OpType::Mean, "reduce_mean", Exact(1), NUMERIC, 1, D::FloatPromote, S::Reduce, Rule(g::mean)),
            (OpType::Max, "reduce_max", Exact(1), NUMERIC, 1, D::FromInput(0), S::Reduce, Rule(g::max)),
            (OpType::Min, "reduce_min", Exact(1), NUMERIC, 1, D::FromInput(0), S::Reduce, Rule(g::min)),
            (OpType::Prod, "reduce_prod", Exact(1), NUMERIC, 1, D::FromInput(0), S::Reduce, Missing),
            (OpType::ArgMax, "argmax", Exact(1), NUMERIC, 1, D::ArgOr(DType::I64), S::Reduce, ND),
            (OpType::Softmax, "softmax", Exact(1), NUMERIC, 1, D::FloatPromote, S::SameWithAxis, Rule(g::softmax)),
            (OpType::LogSoftmax, "log_softmax", Exact(1), NUMERIC, 1, D::FloatPromote, S::SameWithAxis, Rule(g::log_softmax)),
            (OpType::MatMul, "matmul", Exact(2), NUMERIC, 1, D::Promote, S::MatMul, Rule(g::matmul)),
            (OpType::Transpose, "transpose", Exact(1), ANY, 1, D::FromInput(0), S::Transpose, Rule(g::transpose)),
            (OpType::Reshape, "reshape", Between(1, 2), &[C::Any, C::Integer], 1, D::FromInput(0), S::Reshape, Rule(g::reshape)),
            (OpType::Cast, "cast", Exact(1), &[C::NumericOrBool], 1, D::Explicit, S::FromInput(0), Rule(g::cast)),
            (OpType::Identity, "identity", Exact(1), ANY, 1, D::FromInput(0), S::FromInput(0), Rule(g::identity)),
            (OpType::OnesLike, "ones_like", Exact(1), ANY, 1, D::FromInput(0), S::FromInput(0), ND),
            (OpType::ZerosLike, "zeros_like", Exact(1), ANY, 1, D::FromInput(0), S::FromInput(0), ND),
            (OpType::Shape, "shape_of", Exact(1), ANY, 1, D::ArgOr(DType::I64), S::ShapeOf, ND),
            (OpType::RandomUniform, "random_uniform", Exact(0), NONE, 1, D::ArgOr(DType::F32), S::FromArgs, ND),
            (OpType::SumBp, "reduce_sum_bp", Exact(2), NUMERIC, 1, D::FromInput(1), S::FromInput(0), Rule(g::sum_bp)),
            (OpType::MeanBp, "reduce_mean_bp", Exact(2), NUMERIC, 1, D::FromInput(1), S::FromInput(0), Rule(g::mean_bp)),
            (OpType::MaxBp, "reduce_max_bp", Exact(2), NUMERIC, 1, D::FromInput(1), S::FromInput(0), Missing),
            (OpType::MinBp, "reduce_min_bp", Exact(2), NUMERIC, 1, D::FromInput(1), S::FromInput(0), Missing),
            (OpType::ReduceToShape, "reduce_to_shape", Exact(2), &[C::Numeric, C::Any], 1, D::FromInput(0), S::FromInput(1), Rule(g::reduce_to_shape)),
            (OpType::Enter, "enter", Exact(1), ANY, 1, D::FromInput(0), S::FromInput(0), Rule(g::enter)),
            (OpType::Exit, "exit", Exact(1), ANY, 1, D::FromInput(0), S::FromInput(0), Rule(g::exit)),
            (OpType::Switch, "switch", Exact(2), &[C::Any, C::Bool], 2, D::FromInput(0), S::FromInput(0), Rule(g::switch)),
            (OpType::Merge, "merge", Between(1, 2), ANY, 1, D::FromInput(0), S::Merge, Rule(g::merge)),
            (OpType::NextIteration, "next_iteration", Exact(1), ANY, 1, D::FromInput(0), S::FromInput(0), Rule(g::next_iteration)),
            (OpType::ForwardIteration, "forward_iteration", Exact(1), ANY, 1, D::ArgOr(DType::I64), S::FromArgs, ND),
            (OpType::GradientBackwardsMarker, "gradient_backwards_marker", Exact(1), &[C::Float], 1, D::FromInput(0), S::FromInput(0), ND),
        ]
    };

    static ref OP_TABLE: HashMap<OpType, OpDescriptor> = OP_LIST
        .iter()
        .enumerate()
        .map(|(i, &(op_type, name, arity, constraints, num_outputs, dtype_rule, shape_rule, gradient))| {
            let descriptor = OpDescriptor {
                op_type,
                name,
                native_id: 1 + i as i32,
                arity,
                constraints,
                num_outputs,
                dtype_rule,
                shape_rule,
                gradient,
                stateful: op_type == OpType::RandomUniform,
            };
            (op_type, descriptor)
        })
        .collect();

    static ref OP_NAMES: HashMap<&'static str, OpType> =
        OP_LIST.iter().map(|e| (e.1, e.0)).collect();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_op_type_has_descriptor() {
        let mut ids = std::collections::HashSet::new();
        for op_type in OpType::all() {
            let d = op_type.descriptor();
            assert_eq!(d.op_type, op_type);
            assert!(ids.insert(d.native_id));
            assert_eq!(OpType::from_name(d.name).unwrap(), op_type);
        }
        assert_eq!(ids.len(), OP_TABLE.len());
    }

    #[test]
    fn test_unknown_op_type() {
        assert_eq!(
            OpType::from_name("conv9d").unwrap_err(),
            GraphError::UnknownOperationType("conv9d".to_string())
        );
    }

    #[test]
    fn test_constraints() {
        let d = OpType::Reshape.descriptor();
        assert_eq!(d.constraint(0), TypeConstraint::Any);
        assert_eq!(d.constraint(1), TypeConstraint::Integer);
        assert_eq!(OpType::Add.descriptor().constraint(5), TypeConstraint::Numeric);
        assert!(!TypeConstraint::Numeric.accepts(DType::Bool));
        assert!(Arity::Between(1, 2).accepts(2));
        assert!(OpType::Switch.is_control_flow());
    }
}
