//! Builder context handed to control-flow block bodies

use std::collections::HashMap;

use crate::error::{GraphError, GraphResult};
use crate::graph::{OpArgs, SameDiff};
use crate::ops::{OpBuilder, OpType};

#[derive(Debug, Clone)]
pub(crate) enum BlockKind {
    /// One side of a conditional; `taken` is the switch output feeding it
    Branch { predicate: String, taken: usize },
    /// A loop body or condition running inside `frame`
    Loop { frame: String },
}

/// Builder for the inside of an `if_cond` branch or a `while_loop` body.
///
/// Any reference to a variable declared before the block started is routed
/// through the block's boundary primitive: a switch on the predicate for
/// conditionals, a loop-invariant enter for loops. Wrappers are memoized, so
/// repeated references reuse the same switch or enter.
pub struct BlockContext<'a> {
    parent: &'a mut dyn OpBuilder,
    kind: BlockKind,
    /// Variables created at or after this sequence number belong to the block
    start_seq: u64,
    memo: HashMap<String, Vec<String>>,
}

impl<'a> BlockContext<'a> {
    pub(crate) fn new(
        parent: &'a mut dyn OpBuilder,
        kind: BlockKind,
        start_seq: u64,
        memo: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            parent,
            kind,
            start_seq,
            memo,
        }
    }

    pub(crate) fn into_memo(self) -> HashMap<String, Vec<String>> {
        self.memo
    }

    /// Frame of the enclosing loop, if this is a loop block
    pub fn frame(&self) -> Option<&str> {
        match &self.kind {
            BlockKind::Loop { frame } => Some(frame),
            BlockKind::Branch { .. } => None,
        }
    }

    /// Whether `name` was declared outside this block
    pub fn is_outer(&self, name: &str) -> bool {
        self.parent
            .graph()
            .variables
            .get(name)
            .map_or(false, |v| v.seq < self.start_seq)
    }

    fn wrapped_index(&self) -> usize {
        match &self.kind {
            BlockKind::Branch { taken, .. } => *taken,
            BlockKind::Loop { .. } => 0,
        }
    }

    fn wrap(&mut self, name: &str) -> GraphResult<Vec<String>> {
        match self.kind.clone() {
            BlockKind::Branch { predicate, .. } => {
                self.parent
                    .add_op(None, OpType::Switch, OpArgs::new(), &[name, predicate.as_str()])
            }
            BlockKind::Loop { frame } => {
                let args = OpArgs::new().with_frame(&frame).with_bools(&[true]);
                self.parent.add_op(None, OpType::Enter, args, &[name])
            }
        }
    }

    /// Make a block result usable outside the block.
    ///
    /// Outer variables and constants carry no frame or branch of their own,
    /// so they are routed through the boundary primitive as well.
    pub(crate) fn export(&mut self, name: &str) -> GraphResult<String> {
        let graph = self.parent.graph();
        let var = graph.variable(name)?;
        if var.seq >= self.start_seq && var.kind.is_global() {
            let index = self.wrapped_index();
            let wrapped = self.wrap(name)?;
            return wrapped
                .get(index)
                .cloned()
                .ok_or_else(|| GraphError::Internal(format!("no boundary output for '{}'", name)));
        }
        self.resolve(name)
    }
}

impl OpBuilder for BlockContext<'_> {
    fn graph(&self) -> &SameDiff {
        self.parent.graph()
    }

    fn graph_mut(&mut self) -> &mut SameDiff {
        self.parent.graph_mut()
    }

    fn resolve(&mut self, name: &str) -> GraphResult<String> {
        if !self.is_outer(name) {
            return Ok(name.to_string());
        }
        let index = self.wrapped_index();
        if let Some(pick) = self.memo.get(name).and_then(|w| w.get(index)) {
            // A rolled-back nested block may have removed the wrapper
            if self.parent.graph().has_variable(pick) {
                return Ok(pick.clone());
            }
        }
        let wrapped = self.wrap(name)?;
        let pick = wrapped
            .get(index)
            .cloned()
            .ok_or_else(|| GraphError::Internal(format!("no boundary output for '{}'", name)))?;
        self.memo.insert(name.to_string(), wrapped);
        Ok(pick)
    }
}
