//! Typed op-creation façade
//!
//! Every convenience method funnels into `add_op`, which resolves its inputs
//! through the builder (so control-flow blocks can intercept references to
//! outer variables) and then registers the operation on the graph.

use crate::control_flow::{self, BlockContext};
use crate::error::{GraphError, GraphResult};
use crate::graph::{OpArgs, SameDiff, VariableKind};
use crate::tensor::{DType, NdArray, Shape};
use super::OpType;

macro_rules! binary_ops {
    ($($(#[$doc:meta])* $method:ident => $op:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            fn $method(&mut self, a: &str, b: &str) -> GraphResult<String> {
                self.op1(OpType::$op, OpArgs::new(), &[a, b])
            }
        )*
    };
}

macro_rules! unary_ops {
    ($($(#[$doc:meta])* $method:ident => $op:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            fn $method(&mut self, x: &str) -> GraphResult<String> {
                self.op1(OpType::$op, OpArgs::new(), &[x])
            }
        )*
    };
}

macro_rules! reduce_ops {
    ($($method:ident => $op:ident),* $(,)?) => {
        $(
            fn $method(&mut self, x: &str, axes: &[i64], keep_dims: bool) -> GraphResult<String> {
                let args = OpArgs::new().with_ints(axes).with_bools(&[keep_dims]);
                self.op1(OpType::$op, args, &[x])
            }
        )*
    };
}

/// Graph-building surface shared by the graph itself and control-flow blocks
pub trait OpBuilder {
    fn graph(&self) -> &SameDiff;

    fn graph_mut(&mut self) -> &mut SameDiff;

    /// Name under which `name` is usable from this builder
    fn resolve(&mut self, name: &str) -> GraphResult<String>;

    /// Generic op creation: resolve inputs, infer outputs, register
    fn add_op(
        &mut self,
        name: Option<&str>,
        op_type: OpType,
        args: OpArgs,
        inputs: &[&str],
    ) -> GraphResult<Vec<String>> {
        let mut resolved = Vec::with_capacity(inputs.len());
        for input in inputs {
            resolved.push(self.resolve(input)?);
        }
        self.graph_mut().declare_operation(name, op_type, args, &resolved)
    }

    /// `add_op` keyed by the op type's registered name
    fn add_op_by_name(
        &mut self,
        name: Option<&str>,
        op_type: &str,
        args: OpArgs,
        inputs: &[&str],
    ) -> GraphResult<Vec<String>> {
        let op_type = OpType::from_name(op_type)?;
        self.add_op(name, op_type, args, inputs)
    }

    /// Single-output op with a generated name
    fn op1(&mut self, op_type: OpType, args: OpArgs, inputs: &[&str]) -> GraphResult<String> {
        first(self.add_op(None, op_type, args, inputs)?)
    }

    /// Single-output op with an explicit name
    fn named(&mut self, name: &str, op_type: OpType, args: OpArgs, inputs: &[&str]) -> GraphResult<String> {
        first(self.add_op(Some(name), op_type, args, inputs)?)
    }

    fn placeholder(&mut self, name: &str, dtype: DType, shape: Shape) -> GraphResult<String> {
        self.graph_mut()
            .declare_variable(Some(name), VariableKind::Placeholder, shape, dtype, None)
    }

    fn constant(&mut self, name: &str, value: NdArray) -> GraphResult<String> {
        let dtype = value.dtype();
        self.graph_mut()
            .declare_variable(Some(name), VariableKind::Constant, Shape::unknown(), dtype, Some(value))
    }

    /// Scalar constant with a generated name
    fn scalar(&mut self, value: f64, dtype: DType) -> GraphResult<String> {
        self.graph_mut().declare_variable(
            None,
            VariableKind::Constant,
            Shape::scalar(),
            dtype,
            Some(NdArray::scalar(value, dtype)),
        )
    }

    /// Trainable variable
    fn var(&mut self, name: &str, value: NdArray) -> GraphResult<String> {
        let dtype = value.dtype();
        self.graph_mut()
            .declare_variable(Some(name), VariableKind::Variable, Shape::unknown(), dtype, Some(value))
    }

    binary_ops! {
        add => Add,
        sub => Sub,
        mul => Mul,
        div => Div,
        maximum => Maximum,
        minimum => Minimum,
        eq => Eq,
        neq => Neq,
        lt => Lt,
        lte => Lte,
        gt => Gt,
        gte => Gte,
        and => And,
        or => Or,
        /// Sum `g` over the dimensions broadcast away from `like`'s shape
        reduce_to_shape => ReduceToShape,
    }

    unary_ops! {
        not => Not,
        neg => Neg,
        abs => Abs,
        exp => Exp,
        log => Log,
        sqrt => Sqrt,
        square => Square,
        tanh => Tanh,
        sigmoid => Sigmoid,
        relu => Relu,
        sin => Sin,
        cos => Cos,
        sign => Sign,
        /// 1 where the input is positive, 0 elsewhere
        step => Step,
        identity => Identity,
        ones_like => OnesLike,
        zeros_like => ZerosLike,
        /// Runtime shape as a 1-D int64 array
        shape_of => Shape,
    }

    reduce_ops! {
        sum => Sum,
        mean => Mean,
        max => Max,
        min => Min,
        prod => Prod,
    }

    fn argmax(&mut self, x: &str, axis: i64, keep_dims: bool) -> GraphResult<String> {
        let args = OpArgs::new().with_ints(&[axis]).with_bools(&[keep_dims]);
        self.op1(OpType::ArgMax, args, &[x])
    }

    fn add_scalar(&mut self, x: &str, value: f64) -> GraphResult<String> {
        self.op1(OpType::AddScalar, OpArgs::new().with_floats(&[value]), &[x])
    }

    fn mul_scalar(&mut self, x: &str, value: f64) -> GraphResult<String> {
        self.op1(OpType::MulScalar, OpArgs::new().with_floats(&[value]), &[x])
    }

    fn pow_scalar(&mut self, x: &str, exponent: f64) -> GraphResult<String> {
        self.op1(OpType::PowScalar, OpArgs::new().with_floats(&[exponent]), &[x])
    }

    fn softmax(&mut self, x: &str, axis: i64) -> GraphResult<String> {
        self.op1(OpType::Softmax, OpArgs::new().with_ints(&[axis]), &[x])
    }

    fn log_softmax(&mut self, x: &str, axis: i64) -> GraphResult<String> {
        self.op1(OpType::LogSoftmax, OpArgs::new().with_ints(&[axis]), &[x])
    }

    fn matmul(&mut self, a: &str, b: &str) -> GraphResult<String> {
        self.matmul_t(a, b, false, false)
    }

    fn matmul_t(&mut self, a: &str, b: &str, transpose_a: bool, transpose_b: bool) -> GraphResult<String> {
        let args = OpArgs::new().with_bools(&[transpose_a, transpose_b]);
        self.op1(OpType::MatMul, args, &[a, b])
    }

    /// Permute dimensions; an empty permutation reverses them
    fn transpose(&mut self, x: &str, permutation: &[i64]) -> GraphResult<String> {
        self.op1(OpType::Transpose, OpArgs::new().with_ints(permutation), &[x])
    }

    fn reshape(&mut self, x: &str, shape: &[i64]) -> GraphResult<String> {
        self.op1(OpType::Reshape, OpArgs::new().with_ints(shape), &[x])
    }

    /// Reshape to a shape held by an integer variable
    fn reshape_dynamic(&mut self, x: &str, shape: &str) -> GraphResult<String> {
        self.op1(OpType::Reshape, OpArgs::new(), &[x, shape])
    }

    fn cast(&mut self, x: &str, dtype: DType) -> GraphResult<String> {
        self.op1(OpType::Cast, OpArgs::new().with_dtype(dtype), &[x])
    }

    fn random_uniform(&mut self, shape: &[usize], min: f64, max: f64, dtype: DType) -> GraphResult<String> {
        let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
        let args = OpArgs::new().with_ints(&dims).with_floats(&[min, max]).with_dtype(dtype);
        self.op1(OpType::RandomUniform, args, &[])
    }

    /// Structured conditional lowered to switch/merge.
    ///
    /// `cond` runs against this builder and must yield a boolean scalar;
    /// each branch returns its single result.
    fn if_cond<C, T, F>(&mut self, name: Option<&str>, cond: C, true_body: T, false_body: F) -> GraphResult<String>
    where
        Self: Sized,
        C: FnOnce(&mut Self) -> GraphResult<String>,
        T: FnOnce(&mut BlockContext<'_>) -> GraphResult<String>,
        F: FnOnce(&mut BlockContext<'_>) -> GraphResult<String>,
    {
        control_flow::if_cond(self, name, cond, true_body, false_body)
    }

    /// Structured loop lowered to enter/merge/switch/next-iteration/exit.
    ///
    /// `cond` receives the current loop values and returns a boolean scalar;
    /// `body` returns one updated value per loop variable. The result holds
    /// the loop variables' final values.
    fn while_loop<C, B>(&mut self, name: Option<&str>, loop_vars: &[&str], cond: C, body: B) -> GraphResult<Vec<String>>
    where
        Self: Sized,
        C: FnOnce(&mut BlockContext<'_>, &[String]) -> GraphResult<String>,
        B: FnOnce(&mut BlockContext<'_>, &[String]) -> GraphResult<Vec<String>>,
    {
        control_flow::while_loop(self, name, loop_vars, cond, body)
    }
}

fn first(outputs: Vec<String>) -> GraphResult<String> {
    outputs
        .into_iter()
        .next()
        .ok_or_else(|| GraphError::Internal("operation produced no outputs".to_string()))
}

impl OpBuilder for SameDiff {
    fn graph(&self) -> &SameDiff {
        self
    }

    fn graph_mut(&mut self) -> &mut SameDiff {
        self
    }

    fn resolve(&mut self, name: &str) -> GraphResult<String> {
        Ok(name.to_string())
    }
}
