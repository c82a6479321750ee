//! `if` lowering onto switch and merge

use std::collections::HashMap;

use tracing::debug;

use crate::error::GraphResult;
use crate::graph::OpArgs;
use crate::ops::{OpBuilder, OpType};
use super::context::{BlockContext, BlockKind};
use super::{check_condition, first, producer_name};

/// Lower a conditional inside its own uniquely named scope.
///
/// On any error the partially built block is removed before the error is
/// returned, leaving the graph as it was before the call.
pub fn if_cond<B, C, T, F>(
    builder: &mut B,
    name: Option<&str>,
    cond: C,
    true_body: T,
    false_body: F,
) -> GraphResult<String>
where
    B: OpBuilder,
    C: FnOnce(&mut B) -> GraphResult<String>,
    T: FnOnce(&mut BlockContext<'_>) -> GraphResult<String>,
    F: FnOnce(&mut BlockContext<'_>) -> GraphResult<String>,
{
    let block = builder.graph_mut().new_block_name(name.unwrap_or("if"));
    let checkpoint = builder.graph().checkpoint();
    builder.graph_mut().push_scope(&block);
    let result = lower(builder, cond, true_body, false_body);
    builder.graph_mut().pop_scope();

    match result {
        Ok(output) => {
            debug!(block = %block, output = %output, "Lowered conditional");
            Ok(output)
        }
        Err(e) => {
            builder.graph_mut().rollback(checkpoint);
            Err(e)
        }
    }
}

fn lower<B, C, T, F>(builder: &mut B, cond: C, true_body: T, false_body: F) -> GraphResult<String>
where
    B: OpBuilder,
    C: FnOnce(&mut B) -> GraphResult<String>,
    T: FnOnce(&mut BlockContext<'_>) -> GraphResult<String>,
    F: FnOnce(&mut BlockContext<'_>) -> GraphResult<String>,
{
    builder.graph_mut().push_scope("cond");
    let predicate = cond(builder);
    builder.graph_mut().pop_scope();
    let predicate = predicate?;
    check_condition(builder.graph(), &predicate)?;

    // Everything declared so far, the predicate included, is outer to the branches
    let start_seq = builder.graph().next_seq;

    let branch = |taken| BlockKind::Branch {
        predicate: predicate.clone(),
        taken,
    };
    let (true_out, memo) = run_branch(builder, branch(1), start_seq, HashMap::new(), "true", true_body)?;
    let (false_out, _) = run_branch(builder, branch(0), start_seq, memo, "false", false_body)?;

    let merged = first(builder.add_op(
        None,
        OpType::Merge,
        OpArgs::new(),
        &[false_out.as_str(), true_out.as_str()],
    )?)?;
    let merge_op = producer_name(builder.graph(), &merged)?;
    builder.graph_mut().add_control_dependency(&merge_op, &predicate)?;
    Ok(merged)
}

fn run_branch<B, Body>(
    builder: &mut B,
    kind: BlockKind,
    start_seq: u64,
    memo: HashMap<String, Vec<String>>,
    scope: &str,
    body: Body,
) -> GraphResult<(String, HashMap<String, Vec<String>>)>
where
    B: OpBuilder,
    Body: FnOnce(&mut BlockContext<'_>) -> GraphResult<String>,
{
    let mut ctx = BlockContext::new(builder, kind, start_seq, memo);
    ctx.graph_mut().push_scope(scope);
    let output = match body(&mut ctx) {
        Ok(out) => ctx.export(&out),
        Err(e) => Err(e),
    };
    ctx.graph_mut().pop_scope();
    let output = output?;
    Ok((output, ctx.into_memo()))
}
