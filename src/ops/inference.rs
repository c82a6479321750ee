//! Static shape and dtype inference

use crate::error::{GraphError, GraphResult};
use crate::graph::{OpArgs, Variable};
use crate::tensor::{normalize_axis, DType, Shape};
use super::{DTypeRule, OpType, ShapeRule};

/// Infer `(shape, dtype)` for every output of `op_type` applied to `inputs`.
///
/// `op` names the operation in error messages. Arity and per-input type
/// constraints are checked first.
pub fn infer_outputs(
    op: &str,
    op_type: OpType,
    args: &OpArgs,
    inputs: &[&Variable],
) -> GraphResult<Vec<(Shape, DType)>> {
    let descriptor = op_type.descriptor();
    if !descriptor.arity.accepts(inputs.len()) {
        return Err(GraphError::InvalidArgument(format!(
            "'{}' ({}) takes {} inputs, got {}",
            op,
            descriptor.name,
            descriptor.arity,
            inputs.len()
        )));
    }
    for (i, input) in inputs.iter().enumerate() {
        let constraint = descriptor.constraint(i);
        if !constraint.accepts(input.dtype()) {
            return Err(GraphError::type_mismatch(
                op,
                format!(
                    "input {} ('{}') has dtype {}, expected {}",
                    i,
                    input.name(),
                    input.dtype(),
                    constraint
                ),
            ));
        }
    }

    let dtype = infer_dtype(op, descriptor.dtype_rule, args, inputs)?;
    let shape = infer_shape(op, descriptor.shape_rule, args, inputs)?;
    Ok(vec![(shape, dtype); descriptor.num_outputs])
}

fn infer_dtype(op: &str, rule: DTypeRule, args: &OpArgs, inputs: &[&Variable]) -> GraphResult<DType> {
    match rule {
        DTypeRule::Promote | DTypeRule::FloatPromote => {
            let mut dtype = inputs
                .first()
                .map(|v| v.dtype())
                .ok_or_else(|| GraphError::Internal(format!("'{}' has no inputs to promote", op)))?;
            for input in &inputs[1..] {
                dtype = DType::promote(dtype, input.dtype()).ok_or_else(|| {
                    GraphError::type_mismatch(
                        op,
                        format!("no common type for {} and {}", dtype, input.dtype()),
                    )
                })?;
            }
            if rule == DTypeRule::FloatPromote && !dtype.is_float() {
                dtype = DType::F32;
            }
            Ok(dtype)
        }
        DTypeRule::Bool => Ok(DType::Bool),
        DTypeRule::FromInput(i) => inputs
            .get(i)
            .map(|v| v.dtype())
            .ok_or_else(|| GraphError::Internal(format!("'{}' has no input {}", op, i))),
        DTypeRule::Explicit => args.dtype.ok_or_else(|| {
            GraphError::InvalidArgument(format!("'{}' requires a target dtype", op))
        }),
        DTypeRule::ArgOr(default) => Ok(args.dtype.unwrap_or(default)),
    }
}

fn infer_shape(op: &str, rule: ShapeRule, args: &OpArgs, inputs: &[&Variable]) -> GraphResult<Shape> {
    let input_shape = |i: usize| -> GraphResult<&Shape> {
        inputs
            .get(i)
            .map(|v| v.shape())
            .ok_or_else(|| GraphError::Internal(format!("'{}' has no input {}", op, i)))
    };
    match rule {
        ShapeRule::FromInput(i) => Ok(input_shape(i)?.clone()),
        ShapeRule::SameWithAxis => {
            let shape = input_shape(0)?;
            let axis = args.int(0).unwrap_or(-1);
            if let Some(rank) = shape.rank() {
                normalize_axis(axis, rank).ok_or_else(|| GraphError::InvalidAxis {
                    op: op.to_string(),
                    axis,
                    rank,
                })?;
            }
            Ok(shape.clone())
        }
        ShapeRule::Broadcast => {
            let mut shape = input_shape(0)?.clone();
            for input in &inputs[1..] {
                shape = Shape::broadcast(&shape, input.shape()).ok_or_else(|| {
                    GraphError::BroadcastShape {
                        op: op.to_string(),
                        a: shape.to_string(),
                        b: input.shape().to_string(),
                    }
                })?;
            }
            Ok(shape)
        }
        ShapeRule::Reduce => reduce_shape(op, input_shape(0)?, &args.ints, args.flag(0)),
        ShapeRule::MatMul => matmul_shape(op, input_shape(0)?, input_shape(1)?, args.flag(0), args.flag(1)),
        ShapeRule::Transpose => transpose_shape(op, input_shape(0)?, &args.ints),
        ShapeRule::Reshape => reshape_shape(op, args, inputs),
        ShapeRule::ShapeOf => Ok(match input_shape(0)?.rank() {
            Some(rank) => Shape::known(&[rank]),
            None => Shape::with_rank(1),
        }),
        ShapeRule::FromArgs => {
            let mut dims = Vec::with_capacity(args.ints.len());
            for &d in &args.ints {
                if d < 0 {
                    return Err(GraphError::InvalidArgument(format!(
                        "'{}': negative dimension {} in {:?}",
                        op, d, args.ints
                    )));
                }
                dims.push(d as usize);
            }
            Ok(Shape::known(&dims))
        }
        ShapeRule::Merge => {
            let first = input_shape(0)?;
            if inputs.iter().any(|v| v.dtype() != inputs[0].dtype()) {
                return Err(GraphError::type_mismatch(op, "merged values must share one dtype"));
            }
            Ok(inputs[1..].iter().fold(first.clone(), |acc, v| acc.merge(v.shape())))
        }
    }
}

/// Reduction output shape; empty `axes` reduces every dimension
pub fn reduce_shape(op: &str, input: &Shape, axes: &[i64], keep_dims: bool) -> GraphResult<Shape> {
    let dims = match input.dims() {
        Some(d) => d,
        None if axes.is_empty() && !keep_dims => return Ok(Shape::scalar()),
        None => return Ok(Shape::unknown()),
    };
    let rank = dims.len();
    let mut reduced = vec![false; rank];
    if axes.is_empty() {
        reduced.iter_mut().for_each(|r| *r = true);
    }
    for &axis in axes {
        let a = normalize_axis(axis, rank).ok_or_else(|| GraphError::InvalidAxis {
            op: op.to_string(),
            axis,
            rank,
        })?;
        reduced[a] = true;
    }
    let out = dims
        .iter()
        .zip(&reduced)
        .filter_map(|(&d, &r)| match (r, keep_dims) {
            (true, true) => Some(Some(1)),
            (true, false) => None,
            (false, _) => Some(d),
        })
        .collect();
    Ok(Shape::from_dims(out))
}

fn matmul_shape(op: &str, a: &Shape, b: &Shape, transpose_a: bool, transpose_b: bool) -> GraphResult<Shape> {
    let as_matrix = |s: &Shape, transpose: bool| -> GraphResult<(Option<usize>, Option<usize>)> {
        match s.rank() {
            None => Ok((None, None)),
            Some(2) => {
                let (r, c) = (s.dim(0), s.dim(1));
                Ok(if transpose { (c, r) } else { (r, c) })
            }
            Some(rank) => Err(GraphError::shape_inference(
                op,
                format!("matmul requires rank-2 inputs, got rank {}", rank),
            )),
        }
    };
    let (m, k) = as_matrix(a, transpose_a)?;
    let (k2, n) = as_matrix(b, transpose_b)?;
    if let (Some(k), Some(k2)) = (k, k2) {
        if k != k2 {
            return Err(GraphError::shape_inference(
                op,
                format!("inner dimensions differ: {} x {}", a, b),
            ));
        }
    }
    Ok(Shape::from_dims(vec![m, n]))
}

fn transpose_shape(op: &str, input: &Shape, perm: &[i64]) -> GraphResult<Shape> {
    let dims = match input.dims() {
        Some(d) => d,
        None if perm.is_empty() => return Ok(Shape::unknown()),
        None => return Ok(Shape::with_rank(perm.len())),
    };
    if perm.is_empty() {
        return Ok(Shape::from_dims(dims.iter().rev().copied().collect()));
    }
    let mut seen = vec![false; dims.len()];
    let mut out = Vec::with_capacity(dims.len());
    for &p in perm {
        let axis = normalize_axis(p, dims.len()).ok_or_else(|| GraphError::InvalidAxis {
            op: op.to_string(),
            axis: p,
            rank: dims.len(),
        })?;
        if seen[axis] {
            return Err(GraphError::shape_inference(op, format!("{:?} is not a permutation", perm)));
        }
        seen[axis] = true;
        out.push(dims[axis]);
    }
    if out.len() != dims.len() {
        return Err(GraphError::shape_inference(
            op,
            format!("permutation {:?} doesn't match rank {}", perm, dims.len()),
        ));
    }
    Ok(Shape::from_dims(out))
}

fn reshape_shape(op: &str, args: &OpArgs, inputs: &[&Variable]) -> GraphResult<Shape> {
    // A shape operand can be reassigned after the op exists, so only its
    // length is trusted
    match inputs.get(1) {
        None => resolve_reshape(op, inputs[0].shape(), &args.ints),
        Some(shape_var) => Ok(match shape_var.shape().dim(0) {
            Some(rank) => Shape::with_rank(rank),
            None => Shape::unknown(),
        }),
    }
}

/// Resolve a reshape target with at most one `-1` against the input shape
pub fn resolve_reshape(op: &str, input: &Shape, target: &[i64]) -> GraphResult<Shape> {
    let wildcards = target.iter().filter(|&&d| d == -1).count();
    if wildcards > 1 || target.iter().any(|&d| d < -1) {
        return Err(GraphError::shape_inference(op, format!("invalid reshape target {:?}", target)));
    }
    let known: usize = target.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
    match input.num_elements() {
        Some(total) => {
            if wildcards == 1 {
                if known == 0 || total % known != 0 {
                    return Err(GraphError::shape_inference(
                        op,
                        format!("cannot reshape {} to {:?}", input, target),
                    ));
                }
                let fill = total / known;
                Ok(Shape::known(
                    &target.iter().map(|&d| if d == -1 { fill } else { d as usize }).collect::<Vec<_>>(),
                ))
            } else if known != total {
                Err(GraphError::shape_inference(
                    op,
                    format!("cannot reshape {} ({} elements) to {:?}", input, total, target),
                ))
            } else {
                Ok(Shape::from_i64(target))
            }
        }
        None => Ok(Shape::from_i64(target)),
    }
}

#[cfg(test)]
mod tests {
    use crate::error::GraphError;
    use crate::graph::{OpArgs, SameDiff};
    use crate::ops::{OpBuilder, OpType};
    use crate::tensor::{DType, NdArray, Shape};

    fn graph() -> SameDiff {
        let mut sd = SameDiff::new();
        sd.placeholder("a", DType::F32, Shape::from_i64(&[-1, 4])).unwrap();
        sd.placeholder("b", DType::F64, Shape::known(&[3])).unwrap();
        sd.placeholder("flag", DType::Bool, Shape::known(&[4])).unwrap();
        sd.placeholder("n", DType::I32, Shape::known(&[2, 4])).unwrap();
        sd
    }

    fn shape_of(sd: &SameDiff, name: &str) -> Shape {
        sd.variable(name).unwrap().shape().clone()
    }

    #[test]
    fn test_broadcast_failure() {
        let mut sd = graph();
        let err = sd.add("a", "b").unwrap_err();
        assert!(matches!(err, GraphError::BroadcastShape { .. }));
    }

    #[test]
    fn test_numeric_only_rejects_bool() {
        let mut sd = graph();
        let err = sd.add("a", "flag").unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
        let err = sd.sum("flag", &[], false).unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
    }

    #[test]
    fn test_dtype_rules() {
        let mut sd = graph();
        let promoted = sd.mul("n", "a").unwrap();
        assert_eq!(sd.variable(&promoted).unwrap().dtype(), DType::F32);
        let cmp = sd.gt("a", "n").unwrap();
        assert_eq!(sd.variable(&cmp).unwrap().dtype(), DType::Bool);
        let e = sd.exp("n").unwrap();
        assert_eq!(sd.variable(&e).unwrap().dtype(), DType::F32);
        let cast = sd.cast("a", DType::F16).unwrap();
        assert_eq!(sd.variable(&cast).unwrap().dtype(), DType::F16);
        let err = sd.add_op(None, OpType::Cast, OpArgs::new(), &["a"]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
    }

    #[test]
    fn test_reduction_shapes() {
        let mut sd = graph();
        let s = sd.sum("n", &[1], false).unwrap();
        assert_eq!(shape_of(&sd, &s), Shape::known(&[2]));
        let k = sd.mean("n", &[-1], true).unwrap();
        assert_eq!(shape_of(&sd, &k), Shape::known(&[2, 1]));
        let all = sd.sum("a", &[], false).unwrap();
        assert_eq!(shape_of(&sd, &all), Shape::scalar());
        let err = sd.sum("n", &[2], false).unwrap_err();
        assert_eq!(
            err,
            GraphError::InvalidAxis {
                op: "reduce_sum".to_string(),
                axis: 2,
                rank: 2
            }
        );
        assert!(matches!(sd.softmax("n", 3), Err(GraphError::InvalidAxis { .. })));
    }

    #[test]
    fn test_matmul_and_transpose_shapes() {
        let mut sd = graph();
        let w = sd.constant("w", NdArray::ones(&[4, 5], DType::F32)).unwrap();
        let y = sd.matmul("a", &w).unwrap();
        assert_eq!(shape_of(&sd, &y), Shape::from_i64(&[-1, 5]));
        let yt = sd.matmul_t(&w, "a", true, true).unwrap();
        assert_eq!(shape_of(&sd, &yt), Shape::from_i64(&[5, -1]));
        let err = sd.matmul(&w, &w).unwrap_err();
        assert!(matches!(err, GraphError::ShapeInference { .. }));
        let t = sd.transpose("a", &[]).unwrap();
        assert_eq!(shape_of(&sd, &t), Shape::from_i64(&[4, -1]));
    }

    #[test]
    fn test_reshape_shapes() {
        let mut sd = graph();
        let r = sd.reshape("n", &[-1]).unwrap();
        assert_eq!(shape_of(&sd, &r), Shape::known(&[8]));
        let r = sd.reshape("n", &[4, -1]).unwrap();
        assert_eq!(shape_of(&sd, &r), Shape::known(&[4, 2]));
        assert!(matches!(sd.reshape("n", &[3, -1]), Err(GraphError::ShapeInference { .. })));

        // Runtime shape operand leaves only the rank known
        sd.placeholder("target", DType::I64, Shape::known(&[3])).unwrap();
        let dynamic = sd.reshape_dynamic("a", "target").unwrap();
        assert_eq!(shape_of(&sd, &dynamic), Shape::with_rank(3));

        let fixed = sd
            .constant("fixed", NdArray::new(&[2], DType::I64, vec![1.0, 8.0]).unwrap())
            .unwrap();
        let r = sd.reshape_dynamic("n", &fixed).unwrap();
        assert_eq!(shape_of(&sd, &r), Shape::with_rank(2));
    }

    #[test]
    fn test_reshape_follows_reassigned_shape_constant() {
        let mut sd = SameDiff::new();
        sd.constant("m", NdArray::ones(&[2, 4], DType::F32)).unwrap();
        sd.constant("t", NdArray::new(&[2], DType::I64, vec![4.0, 2.0]).unwrap()).unwrap();
        let r = sd.reshape_dynamic("m", "t").unwrap();
        let bindings = std::collections::HashMap::new();
        assert_eq!(sd.execute_one(&r, &bindings).unwrap().shape(), &[4, 2]);

        sd.set_variable_value("t", NdArray::new(&[2], DType::I64, vec![8.0, 1.0]).unwrap())
            .unwrap();
        assert_eq!(sd.execute_one(&r, &bindings).unwrap().shape(), &[8, 1]);
    }

    #[test]
    fn test_arity_checked() {
        let mut sd = graph();
        let err = sd.add_op(None, OpType::Add, OpArgs::new(), &["a"]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
    }
}
