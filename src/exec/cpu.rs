//! Reference CPU executor
//!
//! Straightforward kernels for every non-control-flow op type. Elements are
//! computed in `f64` and rounded to the requested output dtype.

use crate::ops::OpType;
use crate::tensor::{broadcast_shapes, normalize_axis, strides_for, DType, NdArray};
use super::codes::{INVALID_ARGUMENT, SHAPE_MISMATCH, UNSUPPORTED_DTYPE, UNSUPPORTED_OP};
use super::{NativeError, OpContext, OpExecutor};

type KernelResult = Result<NdArray, NativeError>;

#[derive(Debug, Default, Clone, Copy)]
pub struct CpuExecutor;

impl CpuExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl OpExecutor for CpuExecutor {
    fn name(&self) -> &str {
        "cpu"
    }

    fn invoke(&self, ctx: &mut OpContext, inputs: &[NdArray]) -> Result<Vec<NdArray>, NativeError> {
        let out = run_kernel(ctx, inputs)?;
        if let Some(pre) = ctx.outputs.first() {
            if pre.shape() != out.shape() {
                return Err(NativeError::new(
                    SHAPE_MISMATCH,
                    format!("preallocated output {:?} but computed {:?}", pre.shape(), out.shape()),
                ));
            }
        }
        Ok(vec![out])
    }
}

fn run_kernel(ctx: &mut OpContext, inputs: &[NdArray]) -> KernelResult {
    let dtype = ctx.output_dtype(0);
    let x = || arg(inputs, 0);
    let y = || arg(inputs, 1);
    match ctx.op_type {
        OpType::Add => binary(x()?, y()?, dtype, |a, b| a + b),
        OpType::Sub => binary(x()?, y()?, dtype, |a, b| a - b),
        OpType::Mul => binary(x()?, y()?, dtype, |a, b| a * b),
        OpType::Div => {
            let (a, b) = (x()?, y()?);
            if dtype.is_int() && b.data().iter().any(|&v| v == 0.0) {
                return Err(NativeError::new(INVALID_ARGUMENT, "integer division by zero"));
            }
            binary(a, b, dtype, |a, b| a / b)
        }
        OpType::Maximum => binary(x()?, y()?, dtype, f64::max),
        OpType::Minimum => binary(x()?, y()?, dtype, f64::min),
        OpType::Eq => binary(x()?, y()?, dtype, |a, b| flag(a == b)),
        OpType::Neq => binary(x()?, y()?, dtype, |a, b| flag(a != b)),
        OpType::Lt => binary(x()?, y()?, dtype, |a, b| flag(a < b)),
        OpType::Lte => binary(x()?, y()?, dtype, |a, b| flag(a <= b)),
        OpType::Gt => binary(x()?, y()?, dtype, |a, b| flag(a > b)),
        OpType::Gte => binary(x()?, y()?, dtype, |a, b| flag(a >= b)),
        OpType::And => binary(x()?, y()?, dtype, |a, b| flag(a != 0.0 && b != 0.0)),
        OpType::Or => binary(x()?, y()?, dtype, |a, b| flag(a != 0.0 || b != 0.0)),
        OpType::Not => unary(x()?, dtype, |a| flag(a == 0.0)),
        OpType::Neg => unary(x()?, dtype, |a| -a),
        OpType::Abs => unary(x()?, dtype, f64::abs),
        OpType::Exp => unary(x()?, dtype, f64::exp),
        OpType::Log => unary(x()?, dtype, f64::ln),
        OpType::Sqrt => unary(x()?, dtype, f64::sqrt),
        OpType::Square => unary(x()?, dtype, |a| a * a),
        OpType::Tanh => unary(x()?, dtype, f64::tanh),
        OpType::Sigmoid => unary(x()?, dtype, |a| 1.0 / (1.0 + (-a).exp())),
        OpType::Relu => unary(x()?, dtype, |a| a.max(0.0)),
        OpType::Sin => unary(x()?, dtype, f64::sin),
        OpType::Cos => unary(x()?, dtype, f64::cos),
        OpType::Sign => unary(x()?, dtype, |a| if a == 0.0 { 0.0 } else { a.signum() }),
        OpType::Step => unary(x()?, dtype, |a| flag(a > 0.0)),
        OpType::AddScalar => {
            let s = ctx.float_arg(0).unwrap_or(0.0);
            unary(x()?, dtype, |a| a + s)
        }
        OpType::MulScalar => {
            let s = ctx.float_arg(0).unwrap_or(1.0);
            unary(x()?, dtype, |a| a * s)
        }
        OpType::PowScalar => {
            let p = ctx.float_arg(0).unwrap_or(1.0);
            unary(x()?, dtype, |a| a.powf(p))
        }
        OpType::Sum => reduce(ctx, x()?, dtype, Reduction::Sum),
        OpType::Mean => reduce(ctx, x()?, dtype, Reduction::Mean),
        OpType::Max => reduce(ctx, x()?, dtype, Reduction::Max),
        OpType::Min => reduce(ctx, x()?, dtype, Reduction::Min),
        OpType::Prod => reduce(ctx, x()?, dtype, Reduction::Prod),
        OpType::ArgMax => argmax(ctx, x()?, dtype),
        OpType::Softmax => softmax(ctx, x()?, dtype, false),
        OpType::LogSoftmax => softmax(ctx, x()?, dtype, true),
        OpType::MatMul => matmul(ctx, x()?, y()?, dtype),
        OpType::Transpose => transpose(&ctx.int_args, x()?, dtype),
        OpType::Reshape => reshape(ctx, inputs),
        OpType::Cast => x()?.cast(dtype).map_err(invalid),
        OpType::Identity => Ok(x()?.clone()),
        OpType::OnesLike => Ok(NdArray::ones(x()?.shape(), dtype)),
        OpType::ZerosLike => Ok(NdArray::zeros(x()?.shape(), dtype)),
        OpType::GradientBackwardsMarker => Ok(NdArray::ones(x()?.shape(), dtype)),
        OpType::Shape => {
            let dims: Vec<f64> = x()?.shape().iter().map(|&d| d as f64).collect();
            make(&[dims.len()], dtype, dims)
        }
        OpType::RandomUniform => random_uniform(ctx, dtype),
        OpType::SumBp => reduction_bp(ctx, x()?, y()?, dtype, false),
        OpType::MeanBp => reduction_bp(ctx, x()?, y()?, dtype, true),
        OpType::MaxBp => extremum_bp(ctx, x()?, y()?, dtype, Reduction::Max),
        OpType::MinBp => extremum_bp(ctx, x()?, y()?, dtype, Reduction::Min),
        OpType::ReduceToShape => reduce_to_shape(x()?, y()?, dtype),
        OpType::Enter
        | OpType::Exit
        | OpType::Switch
        | OpType::Merge
        | OpType::NextIteration
        | OpType::ForwardIteration => Err(
            NativeError::new(UNSUPPORTED_OP, format!("'{}' is interpreted by the engine", ctx.op_type)),
        ),
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn arg(inputs: &[NdArray], index: usize) -> Result<&NdArray, NativeError> {
    inputs
        .get(index)
        .ok_or_else(|| NativeError::new(INVALID_ARGUMENT, format!("missing input {}", index)))
}

fn invalid(err: crate::error::GraphError) -> NativeError {
    NativeError::new(INVALID_ARGUMENT, err.to_string())
}

fn make(shape: &[usize], dtype: DType, data: Vec<f64>) -> KernelResult {
    if dtype == DType::Utf8 {
        return Err(NativeError::new(UNSUPPORTED_DTYPE, "string outputs are not supported"));
    }
    NdArray::new(shape, dtype, data).map_err(invalid)
}

/// For every element of `to`, the flat offset of the element of `from` that
/// broadcasts onto it
fn broadcast_offsets(from: &[usize], to: &[usize]) -> Vec<usize> {
    let rank = to.len();
    let lead = rank - from.len().min(rank);
    let from_strides = strides_for(from);
    let step: Vec<usize> = (0..rank)
        .map(|i| {
            if i < lead || from[i - lead] == 1 {
                0
            } else {
                from_strides[i - lead]
            }
        })
        .collect();
    let total: usize = to.iter().product();
    let mut offsets = Vec::with_capacity(total);
    let mut index = vec![0usize; rank];
    let mut pos = 0usize;
    for _ in 0..total {
        offsets.push(pos);
        for d in (0..rank).rev() {
            index[d] += 1;
            pos += step[d];
            if index[d] < to[d] {
                break;
            }
            pos -= step[d] * to[d];
            index[d] = 0;
        }
    }
    offsets
}

fn binary(a: &NdArray, b: &NdArray, dtype: DType, f: impl Fn(f64, f64) -> f64) -> KernelResult {
    if a.shape() == b.shape() {
        let data = a.data().iter().zip(b.data()).map(|(&x, &y)| f(x, y)).collect();
        return make(a.shape(), dtype, data);
    }
    let shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
        NativeError::new(
            SHAPE_MISMATCH,
            format!("cannot broadcast {:?} and {:?}", a.shape(), b.shape()),
        )
    })?;
    let ia = broadcast_offsets(a.shape(), &shape);
    let ib = broadcast_offsets(b.shape(), &shape);
    let (da, db) = (a.data(), b.data());
    let data = ia.iter().zip(&ib).map(|(&i, &j)| f(da[i], db[j])).collect();
    make(&shape, dtype, data)
}

fn unary(x: &NdArray, dtype: DType, f: impl Fn(f64) -> f64) -> KernelResult {
    make(x.shape(), dtype, x.data().iter().map(|&v| f(v)).collect())
}

#[derive(Debug, Clone, Copy)]
enum Reduction {
    Sum,
    Mean,
    Max,
    Min,
    Prod,
}

impl Reduction {
    fn init(&self) -> f64 {
        match self {
            Reduction::Sum | Reduction::Mean => 0.0,
            Reduction::Max => f64::NEG_INFINITY,
            Reduction::Min => f64::INFINITY,
            Reduction::Prod => 1.0,
        }
    }

    fn fold(&self, acc: f64, v: f64) -> f64 {
        match self {
            Reduction::Sum | Reduction::Mean => acc + v,
            Reduction::Max => acc.max(v),
            Reduction::Min => acc.min(v),
            Reduction::Prod => acc * v,
        }
    }
}

/// Reduced-axis mask for `ints` over `rank` dimensions; empty reduces all
fn reduced_axes(op: &OpContext, rank: usize) -> Result<Vec<bool>, NativeError> {
    let mut mask = vec![op.int_args.is_empty(); rank];
    for &axis in &op.int_args {
        let a = normalize_axis(axis, rank).ok_or_else(|| {
            NativeError::new(INVALID_ARGUMENT, format!("axis {} out of range for rank {}", axis, rank))
        })?;
        mask[a] = true;
    }
    Ok(mask)
}

/// Input shape with reduced dimensions set to 1
fn keep_dims_shape(shape: &[usize], mask: &[bool]) -> Vec<usize> {
    shape.iter().zip(mask).map(|(&d, &r)| if r { 1 } else { d }).collect()
}

fn squeeze(shape: &[usize], mask: &[bool]) -> Vec<usize> {
    shape.iter().zip(mask).filter(|(_, &r)| !r).map(|(&d, _)| d).collect()
}

/// Fold `x` into its keep-dims reduction
fn fold_keep_dims(x: &NdArray, kept: &[usize], how: Reduction) -> Vec<f64> {
    let mut acc = vec![how.init(); kept.iter().product()];
    let offsets = broadcast_offsets(kept, x.shape());
    for (&v, &o) in x.data().iter().zip(&offsets) {
        acc[o] = how.fold(acc[o], v);
    }
    if let Reduction::Mean = how {
        let count = (x.len() / acc.len().max(1)).max(1) as f64;
        acc.iter_mut().for_each(|a| *a /= count);
    }
    acc
}

fn reduce(ctx: &OpContext, x: &NdArray, dtype: DType, how: Reduction) -> KernelResult {
    let mask = reduced_axes(ctx, x.rank())?;
    let kept = keep_dims_shape(x.shape(), &mask);
    let data = fold_keep_dims(x, &kept, how);
    let shape = if ctx.bool_arg(0) { kept } else { squeeze(x.shape(), &mask) };
    make(&shape, dtype, data)
}

fn argmax(ctx: &OpContext, x: &NdArray, dtype: DType) -> KernelResult {
    let keep = ctx.bool_arg(0);
    if ctx.int_args.is_empty() {
        let best = x
            .data()
            .iter()
            .enumerate()
            .fold((0usize, f64::NEG_INFINITY), |b, (i, &v)| if v > b.1 { (i, v) } else { b });
        let shape = if keep { vec![1; x.rank()] } else { Vec::new() };
        return make(&shape, dtype, vec![best.0 as f64]);
    }
    let mask = reduced_axes(ctx, x.rank())?;
    let axis = mask.iter().position(|&r| r).unwrap_or(0);
    let kept = keep_dims_shape(x.shape(), &mask);
    let offsets = broadcast_offsets(&kept, x.shape());
    let stride = x.strides().get(axis).copied().unwrap_or(1);
    let extent = x.shape().get(axis).copied().unwrap_or(1);
    let mut best = vec![(0usize, f64::NEG_INFINITY); kept.iter().product()];
    for (i, (&v, &o)) in x.data().iter().zip(&offsets).enumerate() {
        if v > best[o].1 {
            best[o] = ((i / stride) % extent, v);
        }
    }
    let shape = if keep { kept } else { squeeze(x.shape(), &mask) };
    make(&shape, dtype, best.into_iter().map(|(i, _)| i as f64).collect())
}

fn softmax(ctx: &OpContext, x: &NdArray, dtype: DType, log: bool) -> KernelResult {
    let rank = x.rank();
    let axis = normalize_axis(ctx.int_arg(0).unwrap_or(-1), rank.max(1))
        .ok_or_else(|| NativeError::new(INVALID_ARGUMENT, "softmax axis out of range"))?;
    let mut mask = vec![false; rank];
    if rank > 0 {
        mask[axis] = true;
    }
    let kept = keep_dims_shape(x.shape(), &mask);
    let max = fold_keep_dims(x, &kept, Reduction::Max);
    let offsets = broadcast_offsets(&kept, x.shape());
    let shifted: Vec<f64> = x.data().iter().zip(&offsets).map(|(&v, &o)| v - max[o]).collect();
    let mut sums = vec![0.0; max.len()];
    for (&s, &o) in shifted.iter().zip(&offsets) {
        sums[o] += s.exp();
    }
    let data = shifted
        .iter()
        .zip(&offsets)
        .map(|(&s, &o)| if log { s - sums[o].ln() } else { s.exp() / sums[o] })
        .collect();
    make(x.shape(), dtype, data)
}

fn matmul(ctx: &OpContext, a: &NdArray, b: &NdArray, dtype: DType) -> KernelResult {
    if a.rank() != 2 || b.rank() != 2 {
        return Err(NativeError::new(
            SHAPE_MISMATCH,
            format!("matmul needs rank-2 inputs, got {:?} and {:?}", a.shape(), b.shape()),
        ));
    }
    let (ta, tb) = (ctx.bool_arg(0), ctx.bool_arg(1));
    let (ar, ac) = (a.shape()[0], a.shape()[1]);
    let (br, bc) = (b.shape()[0], b.shape()[1]);
    let (m, k) = if ta { (ac, ar) } else { (ar, ac) };
    let (k2, n) = if tb { (bc, br) } else { (br, bc) };
    if k != k2 {
        return Err(NativeError::new(
            SHAPE_MISMATCH,
            format!("inner dimensions differ: {:?} x {:?}", a.shape(), b.shape()),
        ));
    }
    let (da, db) = (a.data(), b.data());
    let at = |i: usize, p: usize| if ta { da[p * ac + i] } else { da[i * ac + p] };
    let bt = |p: usize, j: usize| if tb { db[j * bc + p] } else { db[p * bc + j] };
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let av = at(i, p);
            for j in 0..n {
                out[i * n + j] += av * bt(p, j);
            }
        }
    }
    make(&[m, n], dtype, out)
}

fn transpose(perm: &[i64], x: &NdArray, dtype: DType) -> KernelResult {
    let rank = x.rank();
    let perm: Vec<usize> = if perm.is_empty() {
        (0..rank).rev().collect()
    } else {
        let mut axes = Vec::with_capacity(perm.len());
        for &p in perm {
            axes.push(normalize_axis(p, rank).ok_or_else(|| {
                NativeError::new(INVALID_ARGUMENT, format!("axis {} out of range for rank {}", p, rank))
            })?);
        }
        axes
    };
    if perm.len() != rank {
        return Err(NativeError::new(INVALID_ARGUMENT, "permutation doesn't match rank"));
    }
    let shape: Vec<usize> = perm.iter().map(|&p| x.shape()[p]).collect();
    let in_strides = x.strides();
    let step: Vec<usize> = perm.iter().map(|&p| in_strides[p]).collect();
    let total = x.len();
    let data = x.data();
    let mut out = Vec::with_capacity(total);
    let mut index = vec![0usize; rank];
    let mut pos = 0usize;
    for _ in 0..total {
        out.push(data[pos]);
        for d in (0..rank).rev() {
            index[d] += 1;
            pos += step[d];
            if index[d] < shape[d] {
                break;
            }
            pos -= step[d] * shape[d];
            index[d] = 0;
        }
    }
    make(&shape, dtype, out)
}

fn reshape(ctx: &OpContext, inputs: &[NdArray]) -> KernelResult {
    let x = arg(inputs, 0)?;
    let target: Vec<i64> = match inputs.get(1) {
        Some(shape) => shape.data().iter().map(|&d| d as i64).collect(),
        None => ctx.int_args.clone(),
    };
    let known: usize = target.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
    let wildcards = target.iter().filter(|&&d| d == -1).count();
    let bad = || NativeError::new(SHAPE_MISMATCH, format!("cannot reshape {:?} to {:?}", x.shape(), target));
    if wildcards > 1 || target.iter().any(|&d| d < -1) {
        return Err(bad());
    }
    let shape: Vec<usize> = if wildcards == 1 {
        if known == 0 || x.len() % known != 0 {
            return Err(bad());
        }
        target
            .iter()
            .map(|&d| if d == -1 { x.len() / known } else { d as usize })
            .collect()
    } else {
        target.iter().map(|&d| d as usize).collect()
    };
    x.reshape(&shape).map_err(|_| bad())
}

fn random_uniform(ctx: &mut OpContext, dtype: DType) -> KernelResult {
    let shape: Vec<usize> = ctx.int_args.iter().map(|&d| d.max(0) as usize).collect();
    let min = ctx.float_arg(0).unwrap_or(0.0);
    let max = ctx.float_arg(1).unwrap_or(1.0);
    Ok(NdArray::random_uniform(&shape, min, max, dtype, &mut ctx.rng))
}

/// Spread the gradient of a reduction back over its input's shape
fn reduction_bp(ctx: &OpContext, x: &NdArray, g: &NdArray, dtype: DType, mean: bool) -> KernelResult {
    let mask = reduced_axes(ctx, x.rank())?;
    let kept = keep_dims_shape(x.shape(), &mask);
    let count: usize = kept.iter().product();
    if g.len() != count {
        return Err(NativeError::new(
            SHAPE_MISMATCH,
            format!("gradient {:?} doesn't match reduction of {:?}", g.shape(), x.shape()),
        ));
    }
    let scale = if mean { count as f64 / x.len().max(1) as f64 } else { 1.0 };
    let offsets = broadcast_offsets(&kept, x.shape());
    let gd = g.data();
    make(x.shape(), dtype, offsets.iter().map(|&o| gd[o] * scale).collect())
}

fn extremum_bp(ctx: &OpContext, x: &NdArray, g: &NdArray, dtype: DType, how: Reduction) -> KernelResult {
    let mask = reduced_axes(ctx, x.rank())?;
    let kept = keep_dims_shape(x.shape(), &mask);
    if g.len() != kept.iter().product::<usize>() {
        return Err(NativeError::new(SHAPE_MISMATCH, "gradient doesn't match reduction"));
    }
    let best = fold_keep_dims(x, &kept, how);
    let offsets = broadcast_offsets(&kept, x.shape());
    let gd = g.data();
    let data = x
        .data()
        .iter()
        .zip(&offsets)
        .map(|(&v, &o)| if v == best[o] { gd[o] } else { 0.0 })
        .collect();
    make(x.shape(), dtype, data)
}

/// Sum `g` over the dimensions that broadcasting added relative to `like`
fn reduce_to_shape(g: &NdArray, like: &NdArray, dtype: DType) -> KernelResult {
    let target = like.shape();
    if g.shape() == target {
        return g.cast(dtype).map_err(invalid);
    }
    match broadcast_shapes(target, g.shape()) {
        Some(s) if s == g.shape() => {}
        _ => {
            return Err(NativeError::new(
                SHAPE_MISMATCH,
                format!("{:?} doesn't broadcast to {:?}", target, g.shape()),
            ))
        }
    }
    let mut acc = vec![0.0; target.iter().product()];
    let offsets = broadcast_offsets(target, g.shape());
    for (&v, &o) in g.data().iter().zip(&offsets) {
        acc[o] += v;
    }
    make(target, dtype, acc)
}
