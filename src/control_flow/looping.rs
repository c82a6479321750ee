//! `while` lowering onto enter, merge, switch, next-iteration and exit

use tracing::debug;

use crate::error::{GraphError, GraphResult};
use crate::graph::OpArgs;
use crate::ops::{OpBuilder, OpType};
use super::context::{BlockContext, BlockKind};
use super::{check_condition, first, producer_name};

/// Lower a loop inside its own uniquely named frame.
///
/// The frame name is the block's scope path, so nested loops get distinct
/// frames. As with conditionals, a failure removes the partially built
/// block before the error is returned.
pub fn while_loop<B, C, Body>(
    builder: &mut B,
    name: Option<&str>,
    loop_vars: &[&str],
    cond: C,
    body: Body,
) -> GraphResult<Vec<String>>
where
    B: OpBuilder,
    C: FnOnce(&mut BlockContext<'_>, &[String]) -> GraphResult<String>,
    Body: FnOnce(&mut BlockContext<'_>, &[String]) -> GraphResult<Vec<String>>,
{
    if loop_vars.is_empty() {
        return Err(GraphError::InvalidArgument(
            "while_loop needs at least one loop variable".to_string(),
        ));
    }

    let block = builder.graph_mut().new_block_name(name.unwrap_or("while"));
    let frame = builder.graph().scoped_name(&block);
    let checkpoint = builder.graph().checkpoint();
    builder.graph_mut().push_scope(&block);
    let result = lower(builder, &frame, loop_vars, cond, body);
    builder.graph_mut().pop_scope();

    match result {
        Ok(outputs) => {
            debug!(frame = %frame, outputs = outputs.len(), "Lowered loop");
            Ok(outputs)
        }
        Err(e) => {
            builder.graph_mut().rollback(checkpoint);
            Err(e)
        }
    }
}

fn lower<B, C, Body>(
    builder: &mut B,
    frame: &str,
    loop_vars: &[&str],
    cond: C,
    body: Body,
) -> GraphResult<Vec<String>>
where
    B: OpBuilder,
    C: FnOnce(&mut BlockContext<'_>, &[String]) -> GraphResult<String>,
    Body: FnOnce(&mut BlockContext<'_>, &[String]) -> GraphResult<Vec<String>>,
{
    // Loop variables may themselves need wrapping by an enclosing block
    let mut initial = Vec::with_capacity(loop_vars.len());
    for var in loop_vars {
        initial.push(builder.resolve(var)?);
    }

    let start_seq = builder.graph().next_seq;

    let mut merged = Vec::with_capacity(initial.len());
    let mut merge_ops = Vec::with_capacity(initial.len());
    for var in &initial {
        let args = OpArgs::new().with_frame(frame).with_bools(&[false]);
        let entered = first(builder.graph_mut().declare_operation(
            None,
            OpType::Enter,
            args,
            &[var.clone()],
        )?)?;
        // Second input is back-patched with the next-iteration value below
        let m = first(builder.graph_mut().declare_operation(
            None,
            OpType::Merge,
            OpArgs::new(),
            &[entered.clone(), entered],
        )?)?;
        merge_ops.push(producer_name(builder.graph(), &m)?);
        merged.push(m);
    }

    let kind = BlockKind::Loop {
        frame: frame.to_string(),
    };

    let mut ctx = BlockContext::new(builder, kind.clone(), start_seq, Default::default());
    ctx.graph_mut().push_scope("cond");
    let predicate = match cond(&mut ctx, &merged) {
        Ok(p) => ctx.export(&p),
        Err(e) => Err(e),
    };
    ctx.graph_mut().pop_scope();
    let predicate = predicate?;
    check_condition(ctx.graph(), &predicate)?;
    let memo = ctx.into_memo();

    let mut exits_from = Vec::with_capacity(merged.len());
    let mut taken = Vec::with_capacity(merged.len());
    for m in &merged {
        let outputs = builder.graph_mut().declare_operation(
            None,
            OpType::Switch,
            OpArgs::new(),
            &[m.clone(), predicate.clone()],
        )?;
        let (f, t) = match outputs.as_slice() {
            [f, t] => (f.clone(), t.clone()),
            _ => return Err(GraphError::Internal("switch must have two outputs".to_string())),
        };
        exits_from.push(f);
        taken.push(t);
    }

    let mut ctx = BlockContext::new(builder, kind, start_seq, memo);
    ctx.graph_mut().push_scope("body");
    let updated = match body(&mut ctx, &taken) {
        Ok(values) => export_all(&mut ctx, &values),
        Err(e) => Err(e),
    };
    ctx.graph_mut().pop_scope();
    let updated = updated?;
    drop(ctx);

    if updated.len() != merged.len() {
        return Err(GraphError::InvalidArgument(format!(
            "loop body returned {} values for {} loop variables",
            updated.len(),
            merged.len()
        )));
    }

    for (value, merge_op) in updated.iter().zip(&merge_ops) {
        let next = first(builder.graph_mut().declare_operation(
            None,
            OpType::NextIteration,
            OpArgs::new().with_frame(frame),
            &[value.clone()],
        )?)?;
        builder.graph_mut().replace_input(merge_op, 1, &next)?;
    }

    let mut outputs = Vec::with_capacity(exits_from.len());
    for f in exits_from {
        outputs.push(first(builder.graph_mut().declare_operation(
            None,
            OpType::Exit,
            OpArgs::new().with_frame(frame),
            &[f],
        )?)?);
    }
    Ok(outputs)
}

fn export_all(ctx: &mut BlockContext<'_>, values: &[String]) -> GraphResult<Vec<String>> {
    values.iter().map(|v| ctx.export(v)).collect()
}
