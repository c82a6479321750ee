//! Gradient rules
//!
//! Each rule maps an operation and the gradients of its outputs to the
//! gradients of its inputs, using ordinary builder calls on the same graph.
//! A `None` entry means no gradient flows to that input.

use crate::error::{GraphError, GraphResult};
use crate::graph::{OpArgs, OpRecord, SameDiff};
use super::{OpBuilder, OpType};

type Grads = GraphResult<Vec<Option<String>>>;

fn out_grad<'a>(op: &OpRecord, grads: &'a [Option<String>]) -> GraphResult<&'a str> {
    grads
        .first()
        .and_then(|g| g.as_deref())
        .ok_or_else(|| GraphError::Internal(format!("no output gradient for '{}'", op.name())))
}

fn input<'a>(op: &'a OpRecord, index: usize) -> GraphResult<&'a str> {
    op.input(index)
        .ok_or_else(|| GraphError::Internal(format!("'{}' has no input {}", op.name(), index)))
}

fn output<'a>(op: &'a OpRecord, index: usize) -> GraphResult<&'a str> {
    op.output(index)
        .ok_or_else(|| GraphError::Internal(format!("'{}' has no output {}", op.name(), index)))
}

/// Sum a gradient down to the shape of the input it belongs to
fn reduce_to(sd: &mut SameDiff, grad: &str, like: &str) -> GraphResult<String> {
    let g = sd.variable(grad)?.shape();
    let l = sd.variable(like)?.shape();
    if g.is_fully_known() && g == l {
        return Ok(grad.to_string());
    }
    sd.reduce_to_shape(grad, like)
}

fn one(grad: String) -> Grads {
    Ok(vec![Some(grad)])
}

pub(crate) fn add(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    let (a, b) = (input(op, 0)?, input(op, 1)?);
    Ok(vec![Some(reduce_to(sd, g, a)?), Some(reduce_to(sd, g, b)?)])
}

pub(crate) fn sub(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    let (a, b) = (input(op, 0)?, input(op, 1)?);
    let neg = sd.neg(g)?;
    Ok(vec![Some(reduce_to(sd, g, a)?), Some(reduce_to(sd, &neg, b)?)])
}

pub(crate) fn mul(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    let (a, b) = (input(op, 0)?, input(op, 1)?);
    let ga = sd.mul(g, b)?;
    let gb = sd.mul(g, a)?;
    Ok(vec![Some(reduce_to(sd, &ga, a)?), Some(reduce_to(sd, &gb, b)?)])
}

pub(crate) fn div(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    let (a, b) = (input(op, 0)?, input(op, 1)?);
    let ga = sd.div(g, b)?;
    // d(a/b)/db = -a / b^2
    let b2 = sd.square(b)?;
    let ratio = sd.div(a, &b2)?;
    let scaled = sd.mul(g, &ratio)?;
    let gb = sd.neg(&scaled)?;
    Ok(vec![Some(reduce_to(sd, &ga, a)?), Some(reduce_to(sd, &gb, b)?)])
}

fn select_grad(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>], pick_a: OpType) -> Grads {
    let g = out_grad(op, grads)?;
    let (a, b) = (input(op, 0)?, input(op, 1)?);
    let dtype = sd.variable(g)?.dtype();
    let mask_a = sd.op1(pick_a, OpArgs::new(), &[a, b])?;
    let mask_a = sd.cast(&mask_a, dtype)?;
    let mask_b = sd.neg(&mask_a)?;
    let mask_b = sd.add_scalar(&mask_b, 1.0)?;
    let ga = sd.mul(g, &mask_a)?;
    let gb = sd.mul(g, &mask_b)?;
    Ok(vec![Some(reduce_to(sd, &ga, a)?), Some(reduce_to(sd, &gb, b)?)])
}

pub(crate) fn maximum(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    select_grad(sd, op, grads, OpType::Gte)
}

pub(crate) fn minimum(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    select_grad(sd, op, grads, OpType::Lte)
}

pub(crate) fn neg(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    one(sd.neg(out_grad(op, grads)?)?)
}

pub(crate) fn abs(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let sign = sd.sign(input(op, 0)?)?;
    one(sd.mul(out_grad(op, grads)?, &sign)?)
}

pub(crate) fn exp(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    one(sd.mul(out_grad(op, grads)?, output(op, 0)?)?)
}

pub(crate) fn log(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    one(sd.div(out_grad(op, grads)?, input(op, 0)?)?)
}

pub(crate) fn sqrt(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let twice = sd.mul_scalar(output(op, 0)?, 2.0)?;
    one(sd.div(out_grad(op, grads)?, &twice)?)
}

pub(crate) fn square(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let twice = sd.mul_scalar(input(op, 0)?, 2.0)?;
    one(sd.mul(out_grad(op, grads)?, &twice)?)
}

pub(crate) fn tanh(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let y2 = sd.square(output(op, 0)?)?;
    let neg = sd.neg(&y2)?;
    let dy = sd.add_scalar(&neg, 1.0)?;
    one(sd.mul(out_grad(op, grads)?, &dy)?)
}

pub(crate) fn sigmoid(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let y = output(op, 0)?;
    let neg = sd.neg(y)?;
    let complement = sd.add_scalar(&neg, 1.0)?;
    let dy = sd.mul(y, &complement)?;
    one(sd.mul(out_grad(op, grads)?, &dy)?)
}

pub(crate) fn relu(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let mask = sd.step(input(op, 0)?)?;
    one(sd.mul(out_grad(op, grads)?, &mask)?)
}

pub(crate) fn sin(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let cos = sd.cos(input(op, 0)?)?;
    one(sd.mul(out_grad(op, grads)?, &cos)?)
}

pub(crate) fn cos(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let sin = sd.sin(input(op, 0)?)?;
    let prod = sd.mul(out_grad(op, grads)?, &sin)?;
    one(sd.neg(&prod)?)
}

pub(crate) fn add_scalar(_sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    one(out_grad(op, grads)?.to_string())
}

pub(crate) fn mul_scalar(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let factor = op.args().float(0).unwrap_or(1.0);
    one(sd.mul_scalar(out_grad(op, grads)?, factor)?)
}

pub(crate) fn pow_scalar(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let p = op.args().float(0).unwrap_or(1.0);
    let lowered = sd.pow_scalar(input(op, 0)?, p - 1.0)?;
    let dy = sd.mul_scalar(&lowered, p)?;
    one(sd.mul(out_grad(op, grads)?, &dy)?)
}

fn reduction_bp(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>], bp: OpType) -> Grads {
    let g = out_grad(op, grads)?;
    let x = input(op, 0)?;
    one(sd.op1(bp, op.args().clone(), &[x, g])?)
}

pub(crate) fn sum(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    reduction_bp(sd, op, grads, OpType::SumBp)
}

pub(crate) fn mean(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    reduction_bp(sd, op, grads, OpType::MeanBp)
}

pub(crate) fn max(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    reduction_bp(sd, op, grads, OpType::MaxBp)
}

pub(crate) fn min(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    reduction_bp(sd, op, grads, OpType::MinBp)
}

/// Second-order rule of a reduction backprop: linear in the incoming gradient
fn bp_grad(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>], forward: OpType) -> Grads {
    let gg = out_grad(op, grads)?;
    Ok(vec![None, Some(sd.op1(forward, op.args().clone(), &[gg])?)])
}

pub(crate) fn sum_bp(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    bp_grad(sd, op, grads, OpType::Sum)
}

pub(crate) fn mean_bp(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    bp_grad(sd, op, grads, OpType::Mean)
}

pub(crate) fn reduce_to_shape(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let gg = out_grad(op, grads)?;
    let zeros = sd.zeros_like(input(op, 0)?)?;
    Ok(vec![Some(sd.add(&zeros, gg)?), None])
}

pub(crate) fn softmax(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    let y = output(op, 0)?;
    let axis = op.args().int(0).unwrap_or(-1);
    let gy = sd.mul(g, y)?;
    let total = sd.sum(&gy, &[axis], true)?;
    let correction = sd.mul(y, &total)?;
    one(sd.sub(&gy, &correction)?)
}

pub(crate) fn log_softmax(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    let y = output(op, 0)?;
    let axis = op.args().int(0).unwrap_or(-1);
    let total = sd.sum(g, &[axis], true)?;
    let probs = sd.exp(y)?;
    let correction = sd.mul(&probs, &total)?;
    one(sd.sub(g, &correction)?)
}

pub(crate) fn matmul(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    let (a, b) = (input(op, 0)?, input(op, 1)?);
    let (ta, tb) = (op.args().flag(0), op.args().flag(1));
    let (ga, gb) = match (ta, tb) {
        (false, false) => (sd.matmul_t(g, b, false, true)?, sd.matmul_t(a, g, true, false)?),
        (false, true) => (sd.matmul_t(g, b, false, false)?, sd.matmul_t(g, a, true, false)?),
        (true, false) => (sd.matmul_t(b, g, false, true)?, sd.matmul_t(a, g, false, false)?),
        (true, true) => (sd.matmul_t(b, g, true, true)?, sd.matmul_t(g, a, true, true)?),
    };
    Ok(vec![Some(ga), Some(gb)])
}

pub(crate) fn transpose(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    let perm = &op.args().ints;
    if perm.is_empty() {
        return one(sd.transpose(g, &[])?);
    }
    let rank = perm.len() as i64;
    let mut inverse = vec![0i64; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        let p = if p < 0 { p + rank } else { p };
        inverse[p as usize] = i as i64;
    }
    one(sd.transpose(g, &inverse)?)
}

pub(crate) fn reshape(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    let x = input(op, 0)?;
    let shape = sd.shape_of(x)?;
    let gx = sd.reshape_dynamic(g, &shape)?;
    let mut out = vec![Some(gx)];
    out.resize(op.inputs().len(), None);
    Ok(out)
}

pub(crate) fn cast(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    let dtype = sd.variable(input(op, 0)?)?.dtype();
    if !dtype.is_float() {
        return Ok(vec![None]);
    }
    one(sd.cast(g, dtype)?)
}

pub(crate) fn identity(_sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    one(out_grad(op, grads)?.to_string())
}

/// Frame of the backward loop that walks `forward` in reverse
pub(crate) fn backward_frame(sd: &SameDiff, forward: &str) -> String {
    format!("{}{}", forward, sd.config().naming.gradient_suffix)
}

fn loop_frame(op: &OpRecord) -> GraphResult<&str> {
    op.frame()
        .ok_or_else(|| GraphError::Internal(format!("'{}' has no frame", op.name())))
}

/// A forward enter becomes an exit of the backward loop
pub(crate) fn enter(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    let frame = backward_frame(sd, loop_frame(op)?);
    one(sd.op1(OpType::Exit, OpArgs::new().with_frame(&frame), &[g])?)
}

/// A forward exit becomes an enter of the backward loop
pub(crate) fn exit(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    one(enter_backward(sd, loop_frame(op)?, g)?)
}

/// Enter `value` into the backward loop of `forward`
pub(crate) fn enter_backward(sd: &mut SameDiff, forward: &str, value: &str) -> GraphResult<String> {
    let args = OpArgs::new()
        .with_frame(&backward_frame(sd, forward))
        .with_bools(&[false])
        .with_replays(forward);
    sd.op1(OpType::Enter, args, &[value])
}

pub(crate) fn next_iteration(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    one(next_backward(sd, loop_frame(op)?, g)?)
}

pub(crate) fn next_backward(sd: &mut SameDiff, forward: &str, value: &str) -> GraphResult<String> {
    let frame = backward_frame(sd, forward);
    sd.op1(OpType::NextIteration, OpArgs::new().with_frame(&frame), &[value])
}

/// Merge of the gradients of whichever switch output was taken; the
/// untaken side is represented by zeros of its (dead) forward value
pub(crate) fn switch(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let mut branch_grads = Vec::with_capacity(2);
    for i in 0..2 {
        let g = match grads.get(i).cloned().flatten() {
            Some(g) => g,
            None => sd.zeros_like(output(op, i)?)?,
        };
        branch_grads.push(g);
    }
    let merged = sd.add_op(
        None,
        OpType::Merge,
        OpArgs::new(),
        &[branch_grads[0].as_str(), branch_grads[1].as_str()],
    )?;
    let merged = merged
        .into_iter()
        .next()
        .ok_or_else(|| GraphError::Internal("merge produced no output".to_string()))?;
    let predicate = input(op, 1)?;
    let merge_op = sd
        .producer_of(&merged)
        .map(|m| m.name().to_string())
        .ok_or_else(|| GraphError::Internal(format!("'{}' has no producer", merged)))?;
    sd.add_control_dependency(&merge_op, predicate)?;
    Ok(vec![Some(merged), None])
}

/// Switch of the incoming gradient on the predicate a conditional merge
/// records as control dependency. Loop merges are differentiated together
/// with the rest of their loop.
pub(crate) fn merge(sd: &mut SameDiff, op: &OpRecord, grads: &[Option<String>]) -> Grads {
    let g = out_grad(op, grads)?;
    match op.control_deps().first() {
        Some(pred) => {
            let routed = sd.add_op(None, OpType::Switch, OpArgs::new(), &[g, pred.as_str()])?;
            Ok(op
                .inputs()
                .iter()
                .enumerate()
                .map(|(i, _)| routed.get(i.min(1)).cloned())
                .collect())
        }
        None => Ok(vec![Some(g.to_string()); op.inputs().len()]),
    }
}
