//! Structured control flow
//!
//! `if_cond` and `while_loop` are lowered at build time onto the dataflow
//! primitives enter, exit, switch, merge and next-iteration. Block bodies
//! receive a [`BlockContext`] whose `resolve` wraps references to outer
//! variables in the right boundary primitive.

pub mod context;
mod conditional;
mod looping;

pub use conditional::if_cond;
pub use context::BlockContext;
pub use looping::while_loop;

use crate::error::{GraphError, GraphResult};
use crate::graph::SameDiff;
use crate::tensor::DType;

/// A block predicate must be a boolean with at most one element
pub(crate) fn check_condition(graph: &SameDiff, name: &str) -> GraphResult<()> {
    let var = graph.variable(name)?;
    if var.dtype != DType::Bool {
        return Err(GraphError::ConditionType {
            name: name.to_string(),
            dtype: var.dtype,
        });
    }
    if let Some(n) = var.shape.num_elements() {
        if n != 1 {
            return Err(GraphError::shape_inference(
                name,
                format!("condition must be a scalar, got shape {}", var.shape),
            ));
        }
    }
    Ok(())
}

pub(crate) fn first(outputs: Vec<String>) -> GraphResult<String> {
    outputs
        .into_iter()
        .next()
        .ok_or_else(|| GraphError::Internal("operation produced no outputs".to_string()))
}

pub(crate) fn producer_name(graph: &SameDiff, variable: &str) -> GraphResult<String> {
    graph
        .producer_of(variable)
        .map(|op| op.name.clone())
        .ok_or_else(|| GraphError::Internal(format!("'{}' has no producing operation", variable)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::config::EngineConfig;
    use crate::error::GraphError;
    use crate::graph::SameDiff;
    use crate::ops::{OpBuilder, OpType};
    use crate::tensor::{DType, NdArray, Shape};

    fn bind(name: &str, value: f64) -> HashMap<String, NdArray> {
        let mut bindings = HashMap::new();
        bindings.insert(name.to_string(), NdArray::scalar(value, DType::F32));
        bindings
    }

    fn scalar_of(sd: &SameDiff, output: &str, bindings: &HashMap<String, NdArray>) -> f64 {
        sd.execute_one(output, bindings).unwrap().scalar_value().unwrap()
    }

    fn conditional_graph() -> (SameDiff, String) {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F32, Shape::scalar()).unwrap();
        sd.constant("zero", NdArray::scalar(0.0, DType::F32)).unwrap();
        let out = sd
            .if_cond(
                None,
                |g| g.gt("x", "zero"),
                |b| b.mul_scalar("x", 2.0),
                |b| b.neg("x"),
            )
            .unwrap();
        (sd, out)
    }

    #[test]
    fn test_if_takes_true_branch() {
        let (sd, out) = conditional_graph();
        assert_eq!(scalar_of(&sd, &out, &bind("x", 3.0)), 6.0);
    }

    #[test]
    fn test_if_takes_false_branch() {
        let (sd, out) = conditional_graph();
        assert_eq!(scalar_of(&sd, &out, &bind("x", -3.0)), 3.0);
    }

    #[test]
    fn test_if_block_is_scoped() {
        let (sd, out) = conditional_graph();
        assert!(out.starts_with("if/"));
        assert!(!sd.ops_in_scope("if/true").is_empty());
        assert!(!sd.ops_in_scope("if/false").is_empty());
    }

    #[test]
    fn test_non_boolean_condition_rolls_back() {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F32, Shape::scalar()).unwrap();
        let vars = sd.num_variables();
        let ops = sd.num_operations();

        let err = sd
            .if_cond(None, |g| g.add("x", "x"), |b| b.identity("x"), |b| b.neg("x"))
            .unwrap_err();
        assert!(matches!(err, GraphError::ConditionType { dtype: DType::F32, .. }));
        assert_eq!(sd.num_variables(), vars);
        assert_eq!(sd.num_operations(), ops);
    }

    #[test]
    fn test_failing_branch_rolls_back() {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F32, Shape::scalar()).unwrap();
        sd.placeholder("flag", DType::Bool, Shape::scalar()).unwrap();
        let ops = sd.num_operations();

        let err = sd
            .if_cond(
                None,
                |g| g.identity("flag"),
                |b| b.sqrt("flag"),
                |b| b.identity("x"),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
        assert_eq!(sd.num_operations(), ops);
    }

    #[test]
    fn test_outer_references_share_one_switch() {
        let (sd, _) = conditional_graph();
        let switches_on_x = sd
            .operations()
            .filter(|op| op.op_type() == OpType::Switch && op.input(0) == Some("x"))
            .count();
        assert_eq!(switches_on_x, 1);
    }

    fn counter_loop(limit: f64) -> (SameDiff, String) {
        let mut sd = SameDiff::new();
        let start = sd.constant("start", NdArray::scalar(0.0, DType::F32)).unwrap();
        sd.constant("limit", NdArray::scalar(limit, DType::F32)).unwrap();
        let outs = sd
            .while_loop(
                None,
                &[start.as_str()],
                |b, v| b.lt(&v[0], "limit"),
                |b, v| Ok(vec![b.add_scalar(&v[0], 1.0)?]),
            )
            .unwrap();
        (sd, outs[0].clone())
    }

    #[test]
    fn test_while_counts_to_limit() {
        let (sd, out) = counter_loop(5.0);
        assert_eq!(scalar_of(&sd, &out, &HashMap::new()), 5.0);
    }

    #[test]
    fn test_while_false_on_entry_runs_zero_iterations() {
        let (sd, out) = counter_loop(-1.0);
        assert_eq!(scalar_of(&sd, &out, &HashMap::new()), 0.0);
    }

    #[test]
    fn test_loop_invariant_entered_once() {
        let (sd, _) = counter_loop(5.0);
        let enters_of_limit = sd
            .operations()
            .filter(|op| op.op_type() == OpType::Enter && op.input(0) == Some("limit"))
            .count();
        assert_eq!(enters_of_limit, 1);
    }

    #[test]
    fn test_while_with_two_loop_variables() {
        let mut sd = SameDiff::new();
        let i = sd.constant("i", NdArray::scalar(0.0, DType::F32)).unwrap();
        let acc = sd.constant("acc", NdArray::scalar(1.0, DType::F32)).unwrap();
        sd.constant("n", NdArray::scalar(4.0, DType::F32)).unwrap();
        let outs = sd
            .while_loop(
                Some("pow2"),
                &[i.as_str(), acc.as_str()],
                |b, v| b.lt(&v[0], "n"),
                |b, v| {
                    let next_i = b.add_scalar(&v[0], 1.0)?;
                    let next_acc = b.mul_scalar(&v[1], 2.0)?;
                    Ok(vec![next_i, next_acc])
                },
            )
            .unwrap();
        let result = sd.execute(&[&outs[0], &outs[1]], &HashMap::new()).unwrap();
        assert_eq!(result[&outs[0]].scalar_value(), Some(4.0));
        assert_eq!(result[&outs[1]].scalar_value(), Some(16.0));
    }

    #[test]
    fn test_conditional_inside_loop_body() {
        let mut sd = SameDiff::new();
        let start = sd.constant("start", NdArray::scalar(0.0, DType::F32)).unwrap();
        sd.constant("three", NdArray::scalar(3.0, DType::F32)).unwrap();
        sd.constant("six", NdArray::scalar(6.0, DType::F32)).unwrap();
        let outs = sd
            .while_loop(
                None,
                &[start.as_str()],
                |b, v| b.lt(&v[0], "six"),
                |b, v| {
                    let v0 = v[0].clone();
                    let stepped = b.if_cond(
                        None,
                        |c| c.lt(&v0, "three"),
                        |t| t.add_scalar(&v0, 1.0),
                        |f| f.add_scalar(&v0, 2.0),
                    )?;
                    Ok(vec![stepped])
                },
            )
            .unwrap();
        // 0 -> 1 -> 2 -> 3 -> 5 -> 7
        assert_eq!(scalar_of(&sd, &outs[0], &HashMap::new()), 7.0);
    }

    #[test]
    fn test_body_arity_mismatch_rolls_back() {
        let mut sd = SameDiff::new();
        let start = sd.constant("start", NdArray::scalar(0.0, DType::F32)).unwrap();
        sd.constant("limit", NdArray::scalar(3.0, DType::F32)).unwrap();
        let ops = sd.num_operations();
        let err = sd
            .while_loop(None, &[start.as_str()], |b, v| b.lt(&v[0], "limit"), |_, _| Ok(vec![]))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
        assert_eq!(sd.num_operations(), ops);
    }

    #[test]
    fn test_runaway_loop_hits_iteration_limit() {
        let mut config = EngineConfig::default();
        config.execution.max_loop_iterations = 10;
        let mut sd = SameDiff::with_config(config);
        let start = sd.constant("start", NdArray::scalar(0.0, DType::F32)).unwrap();
        sd.constant("limit", NdArray::scalar(1e9, DType::F32)).unwrap();
        let outs = sd
            .while_loop(
                None,
                &[start.as_str()],
                |b, v| b.lt(&v[0], "limit"),
                |b, v| Ok(vec![b.add_scalar(&v[0], 1.0)?]),
            )
            .unwrap();
        let err = sd.execute_one(&outs[0], &HashMap::new()).unwrap_err();
        assert!(matches!(err, GraphError::LoopLimitExceeded { limit: 10, .. }));
    }
}
