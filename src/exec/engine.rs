//! Frame-aware dataflow execution
//!
//! Values live in slots keyed by variable and frame. The root frame holds
//! everything outside loops; each loop iteration is its own frame whose
//! parent is the frame the loop was entered from. A slot is either a value
//! or dead, deadness marking the untaken side of a switch. Ops fire as soon
//! as their inputs resolve, in waves; every op of a wave is independent of
//! the others and may run on the rayon pool.
//!
//! A backward loop replays a finished forward loop last iteration first.
//! Its iteration `j` reads forward values from forward iteration `n - 1 - j`,
//! `n` being the number of times the forward body ran.

use std::collections::{HashMap, HashSet};
use std::sync::Once;

use rand::Rng;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, trace, warn};

use crate::error::{GraphError, GraphResult};
use crate::graph::{OpId, OpRecord, SameDiff, VariableKind};
use crate::ops::OpType;
use crate::tensor::{DType, NdArray};
use super::OpContext;

type FrameId = usize;

const ROOT: FrameId = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FrameKey {
    parent: FrameId,
    name: String,
    iteration: usize,
}

/// Interned frame instances; id 0 is the root frame
#[derive(Debug, Default)]
struct Frames {
    keys: Vec<Option<FrameKey>>,
    index: HashMap<FrameKey, FrameId>,
    /// Iterations started per `(parent, loop)`
    started: HashMap<(FrameId, String), usize>,
}

impl Frames {
    fn new() -> Self {
        Self {
            keys: vec![None],
            index: HashMap::new(),
            started: HashMap::new(),
        }
    }

    /// Frame id for the key, and whether it was created by this call
    fn intern(&mut self, parent: FrameId, name: &str, iteration: usize) -> (FrameId, bool) {
        let key = FrameKey {
            parent,
            name: name.to_string(),
            iteration,
        };
        if let Some(&id) = self.index.get(&key) {
            return (id, false);
        }
        let id = self.keys.len();
        self.keys.push(Some(key.clone()));
        self.index.insert(key, id);
        *self.started.entry((parent, name.to_string())).or_default() += 1;
        (id, true)
    }

    fn started(&self, parent: FrameId, name: &str) -> usize {
        self.started.get(&(parent, name.to_string())).copied().unwrap_or(0)
    }

    fn find(&self, parent: FrameId, name: &str, iteration: usize) -> Option<FrameId> {
        self.index
            .get(&FrameKey {
                parent,
                name: name.to_string(),
                iteration,
            })
            .copied()
    }

    fn key(&self, id: FrameId) -> Option<&FrameKey> {
        self.keys.get(id).and_then(|k| k.as_ref())
    }

    fn parent(&self, id: FrameId) -> Option<FrameId> {
        self.key(id).map(|k| k.parent)
    }

    fn first_iteration(&self, id: FrameId) -> Option<FrameId> {
        let key = self.key(id)?;
        if key.iteration == 0 {
            return Some(id);
        }
        self.find(key.parent, &key.name, 0)
    }

    /// Every started iteration of loop `name` entered from `parent`
    fn iterations(&self, parent: FrameId, name: &str) -> Vec<FrameId> {
        self.keys
            .iter()
            .enumerate()
            .filter_map(|(id, k)| match k {
                Some(k) if k.parent == parent && k.name == name => Some(id),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Value(NdArray),
    Dead,
}

/// A compute op whose inputs are all live
struct Work {
    op: OpId,
    frame: FrameId,
    inputs: Vec<NdArray>,
    seed: u64,
}

type Dispatched = (OpId, FrameId, GraphResult<Vec<NdArray>>);

struct Run<'g> {
    graph: &'g SameDiff,
    needed: HashSet<OpId>,
    consumers: HashMap<String, Vec<OpId>>,
    /// Loop-invariant enter outputs per frame name
    invariants: HashMap<String, Vec<String>>,
    /// Switches whose false output leaves a loop
    loop_switches: HashSet<OpId>,
    /// Backward loop frame name to the forward frame it replays
    replays: HashMap<String, String>,
    /// Ops that only run inside a backward loop, with that loop's frame name
    replay_ops: HashMap<OpId, String>,
    /// Loop instances `(parent, frame)` whose condition came out false or dead
    finished: HashSet<(FrameId, String)>,
    /// Backward iterations waiting for their forward loop to finish
    waiting: Vec<(OpId, FrameId)>,
    frames: Frames,
    slots: HashMap<FrameId, HashMap<String, Slot>>,
    fired: HashSet<(OpId, FrameId)>,
    /// Globals reachable from the outputs
    globals: Vec<String>,
    pending: Vec<(OpId, FrameId)>,
    dispatched: usize,
}

impl SameDiff {
    /// Compute the requested variables.
    ///
    /// `bindings` supplies placeholder values; unbound placeholders fall back
    /// to their defaults. Array values computed here are cached for later
    /// calls until the graph, a persistent value or a placeholder they
    /// depend on changes. On failure, values computed before the failing op
    /// stay cached.
    pub fn execute(
        &self,
        outputs: &[&str],
        bindings: &HashMap<String, NdArray>,
    ) -> GraphResult<HashMap<String, NdArray>> {
        for name in outputs {
            self.variable(name)?;
        }
        let effective = self.effective_placeholders(bindings)?;
        configure_thread_pool(self.config.execution.num_worker_threads);

        let mut run = Run::new(self);
        let from_cache = run.plan(outputs, &effective)?;
        run.preload(&effective)?;
        let result = run.run_waves();
        self.cache_results(&run, &from_cache, &effective);
        result?;

        debug!(
            outputs = outputs.len(),
            dispatched = run.dispatched,
            frames = run.frames.keys.len(),
            "Executed graph"
        );

        let mut values = HashMap::with_capacity(outputs.len());
        for name in outputs {
            match run.slot(name, ROOT) {
                Some(Slot::Value(v)) => {
                    values.insert(name.to_string(), v.clone());
                }
                _ => return Err(GraphError::OutputNotComputed(name.to_string())),
            }
        }
        Ok(values)
    }

    /// `execute` for a single output
    pub fn execute_one(&self, output: &str, bindings: &HashMap<String, NdArray>) -> GraphResult<NdArray> {
        let mut values = self.execute(&[output], bindings)?;
        values
            .remove(output)
            .ok_or_else(|| GraphError::OutputNotComputed(output.to_string()))
    }

    /// Bound or default value of every placeholder that has one
    fn effective_placeholders(&self, bindings: &HashMap<String, NdArray>) -> GraphResult<HashMap<String, NdArray>> {
        let mut effective = HashMap::new();
        for (name, value) in bindings {
            let var = self
                .variables
                .get(name)
                .ok_or_else(|| GraphError::UnknownVariable(name.clone()))?;
            if var.kind != VariableKind::Placeholder {
                return Err(GraphError::InvalidArgument(format!(
                    "'{}' is a {:?} variable, only placeholders can be bound",
                    name, var.kind
                )));
            }
            if value.dtype() != var.dtype {
                return Err(GraphError::type_mismatch(
                    name,
                    format!("placeholder is {}, bound array is {}", var.dtype, value.dtype()),
                ));
            }
            if !var.shape.is_compatible_with(value.shape()) {
                return Err(GraphError::ShapeMismatchAtRuntime {
                    name: name.clone(),
                    expected: var.shape.to_string(),
                    actual: format!("{:?}", value.shape()),
                });
            }
            effective.insert(name.clone(), value.clone());
        }
        for var in self.variables() {
            if var.kind == VariableKind::Placeholder && !effective.contains_key(&var.name) {
                if let Some(default) = &var.value {
                    effective.insert(var.name.clone(), default.clone());
                }
            }
        }
        Ok(effective)
    }

    /// Placeholders upstream of `var`, or `None` when a stateful op is
    fn cache_dependencies(&self, var: &str, effective: &HashMap<String, NdArray>) -> Option<Vec<(String, NdArray)>> {
        let mut deps = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![var.to_string()];
        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let v = self.variables.get(&name)?;
            if v.kind == VariableKind::Placeholder {
                deps.push((name.clone(), effective.get(&name)?.clone()));
                continue;
            }
            if let Some(op) = self.producer_of(&name) {
                if op.op_type.descriptor().stateful {
                    return None;
                }
                stack.extend(op.inputs.iter().cloned());
                stack.extend(op.control_deps.iter().cloned());
            }
        }
        Some(deps)
    }

    fn cache_results(&self, run: &Run<'_>, from_cache: &HashSet<String>, effective: &HashMap<String, NdArray>) {
        let root = match run.slots.get(&ROOT) {
            Some(root) => root,
            None => return,
        };
        let mut session = self.session.lock();
        for (name, slot) in root {
            let value = match slot {
                Slot::Value(v) => v,
                Slot::Dead => continue,
            };
            if from_cache.contains(name) {
                continue;
            }
            let is_array = self
                .variables
                .get(name)
                .map_or(false, |v| v.kind == VariableKind::Array);
            if !is_array {
                continue;
            }
            if let Some(deps) = self.cache_dependencies(name, effective) {
                session.store(name, value.clone(), self.version, self.value_version, deps);
            }
        }
    }
}

impl<'g> Run<'g> {
    fn new(graph: &'g SameDiff) -> Self {
        Self {
            graph,
            needed: HashSet::new(),
            consumers: HashMap::new(),
            invariants: HashMap::new(),
            loop_switches: HashSet::new(),
            replays: HashMap::new(),
            replay_ops: HashMap::new(),
            finished: HashSet::new(),
            waiting: Vec::new(),
            frames: Frames::new(),
            slots: HashMap::new(),
            fired: HashSet::new(),
            globals: Vec::new(),
            pending: Vec::new(),
            dispatched: 0,
        }
    }

    /// Collect the ops the outputs need, loading still-valid cached values.
    ///
    /// Returns the names served from the cache.
    fn plan(&mut self, outputs: &[&str], effective: &HashMap<String, NdArray>) -> GraphResult<HashSet<String>> {
        let graph = self.graph;
        let mut from_cache = HashSet::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<String> = outputs.iter().map(|s| s.to_string()).collect();
        {
            let mut session = graph.session.lock();
            while let Some(name) = stack.pop() {
                if !visited.insert(name.clone()) {
                    continue;
                }
                let var = graph.variable(&name)?;
                if var.kind.is_global() {
                    self.globals.push(name);
                    continue;
                }
                if let Some(value) = session.lookup(&name, graph.version, graph.value_version, effective) {
                    self.set(&name, ROOT, Slot::Value(value));
                    from_cache.insert(name);
                    continue;
                }
                let op = graph
                    .producer_of(&name)
                    .ok_or_else(|| GraphError::Internal(format!("'{}' has no producing operation", name)))?;
                if self.needed.insert(op.id) {
                    stack.extend(op.inputs.iter().cloned());
                    stack.extend(op.control_deps.iter().cloned());
                    if let (OpType::Enter, Some(backward), Some(forward)) =
                        (op.op_type, op.frame(), op.args.replays.as_deref())
                    {
                        // Replaying needs every forward iteration even when
                        // the forward exits are cached
                        for next in graph
                            .operations()
                            .filter(|o| o.op_type == OpType::NextIteration && o.frame() == Some(forward))
                        {
                            stack.extend(next.outputs.iter().cloned());
                        }
                        self.replays.insert(backward.to_string(), forward.to_string());
                    }
                }
            }
        }

        for op in graph.operations().filter(|op| op.op_type == OpType::Exit) {
            if let Some(switch) = op.input(0).and_then(|i| graph.producer_of(i)) {
                if switch.op_type == OpType::Switch {
                    self.loop_switches.insert(switch.id);
                }
            }
        }

        let mut ids: Vec<OpId> = self.needed.iter().copied().collect();
        ids.sort();
        for &id in &ids {
            let op = match graph.op_by_id(id) {
                Some(op) => op,
                None => continue,
            };
            for name in op.inputs.iter().chain(&op.control_deps) {
                let list = self.consumers.entry(name.clone()).or_default();
                if !list.contains(&id) {
                    list.push(id);
                }
            }
            if op.op_type == OpType::Enter && op.args.flag(0) {
                if let (Some(frame), Some(out)) = (op.frame(), op.output(0)) {
                    self.invariants
                        .entry(frame.to_string())
                        .or_default()
                        .push(out.to_string());
                }
            }
            self.pending.push((id, ROOT));
        }
        self.mark_replay_ops();
        Ok(from_cache)
    }

    /// Collect the ops between each backward loop's enters and its exits
    fn mark_replay_ops(&mut self) {
        let graph = self.graph;
        let backward_frames: Vec<String> = self.replays.keys().cloned().collect();
        for backward in backward_frames {
            let mut stack: Vec<OpId> = Vec::new();
            for &id in &self.needed {
                let op = match graph.op_by_id(id) {
                    Some(op) => op,
                    None => continue,
                };
                if op.op_type == OpType::Enter && op.frame() == Some(backward.as_str()) {
                    for out in &op.outputs {
                        stack.extend(self.consumers.get(out).into_iter().flatten().copied());
                    }
                }
            }
            while let Some(id) = stack.pop() {
                if self.replay_ops.insert(id, backward.clone()).is_some() {
                    continue;
                }
                let op = match graph.op_by_id(id) {
                    Some(op) => op,
                    None => continue,
                };
                if op.op_type == OpType::Exit && op.frame() == Some(backward.as_str()) {
                    continue;
                }
                for out in &op.outputs {
                    stack.extend(self.consumers.get(out).into_iter().flatten().copied());
                }
            }
        }
        if !self.replay_ops.is_empty() {
            debug!(loops = self.replays.len(), operations = self.replay_ops.len(), "Planned backward loops");
        }
    }

    /// Place every reachable global into the root frame
    fn preload(&mut self, effective: &HashMap<String, NdArray>) -> GraphResult<()> {
        let graph = self.graph;
        for name in std::mem::take(&mut self.globals) {
            let var = graph.variable(&name)?;
            let value = match var.kind {
                VariableKind::Placeholder => effective
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| GraphError::MissingPlaceholder(name.clone()))?,
                _ => var
                    .value
                    .clone()
                    .ok_or_else(|| GraphError::Internal(format!("'{}' has no value", name)))?,
            };
            self.set(&name, ROOT, Slot::Value(value));
        }
        Ok(())
    }

    fn set(&mut self, name: &str, frame: FrameId, slot: Slot) {
        self.slots.entry(frame).or_default().insert(name.to_string(), slot);
    }

    fn exact(&self, name: &str, frame: FrameId) -> Option<&Slot> {
        self.slots.get(&frame).and_then(|s| s.get(name))
    }

    /// Resolve `name` as seen from `frame`: the frame itself, the first
    /// iteration for loop-invariant enter outputs, the replayed forward
    /// iteration for backward loop frames, then enclosing frames
    fn slot(&self, name: &str, frame: FrameId) -> Option<&Slot> {
        let from_enter = self
            .graph
            .producer_of(name)
            .map_or(false, |op| op.op_type == OpType::Enter);
        let mut current = Some(frame);
        while let Some(f) = current {
            if let Some(slot) = self.exact(name, f) {
                return Some(slot);
            }
            if from_enter {
                if let Some(first) = self.frames.first_iteration(f) {
                    if let Some(slot) = self.exact(name, first) {
                        return Some(slot);
                    }
                }
            }
            if let Some(forward) = self.replayed(f) {
                if let Some(slot) = self.slot(name, forward) {
                    return Some(slot);
                }
            }
            current = self.frames.parent(f);
        }
        None
    }

    /// Forward iteration index replayed by iteration `iteration` of a
    /// backward loop; -1 once none is left, `None` while the forward loop
    /// is still running
    fn replayed_index(&self, parent: FrameId, forward: &str, iteration: usize) -> Option<i64> {
        if !self.finished.contains(&(parent, forward.to_string())) {
            return None;
        }
        // The last forward iteration only evaluated the condition
        let body_runs = self.frames.started(parent, forward) as i64 - 1;
        Some(body_runs - 1 - iteration as i64)
    }

    /// Forward iteration frame a backward iteration frame reads from
    fn replayed(&self, frame: FrameId) -> Option<FrameId> {
        let key = self.frames.key(frame)?;
        let forward = self.replays.get(&key.name)?;
        let index = self.replayed_index(key.parent, forward, key.iteration)?;
        let index = usize::try_from(index).ok()?;
        self.frames.find(key.parent, forward, index)
    }

    /// Store a value and wake up its consumers in that frame
    fn commit(&mut self, name: &str, frame: FrameId, slot: Slot) {
        self.set(name, frame, slot);
        self.trigger(name, frame);
        if !self.replays.is_empty() {
            self.trigger_replays(name, frame);
        }
    }

    /// Wake backward loop consumers of a forward or outer value in every
    /// started backward iteration
    fn trigger_replays(&mut self, name: &str, frame: FrameId) {
        let parent = match self.frames.key(frame) {
            Some(key) if self.replays.contains_key(&key.name) => return,
            Some(key) => key.parent,
            None => frame,
        };
        let consumers = match self.consumers.get(name) {
            Some(c) => c.clone(),
            None => return,
        };
        for id in consumers {
            let backward = match self.replay_ops.get(&id) {
                Some(b) => b.clone(),
                None => continue,
            };
            for iteration in self.frames.iterations(parent, &backward) {
                if !self.fired.contains(&(id, iteration)) {
                    self.pending.push((id, iteration));
                }
            }
        }
    }

    fn trigger(&mut self, name: &str, frame: FrameId) {
        if let Some(consumers) = self.consumers.get(name) {
            for &id in consumers {
                if !self.fired.contains(&(id, frame)) {
                    self.pending.push((id, frame));
                }
            }
        }
    }

    fn run_waves(&mut self) -> GraphResult<()> {
        let mut first_error: Option<GraphError> = None;
        while !self.pending.is_empty() {
            let mut batch = std::mem::take(&mut self.pending);
            batch.sort();
            batch.dedup();

            let mut work = Vec::new();
            for (id, frame) in batch {
                match self.step(id, frame) {
                    Ok(Some(w)) => work.push(w),
                    Ok(None) => {}
                    Err(e) => {
                        first_error.get_or_insert(e);
                        break;
                    }
                }
            }
            if work.is_empty() && first_error.is_some() {
                break;
            }

            for (id, frame, result) in self.dispatch(work) {
                match result {
                    Ok(values) => {
                        let outputs = match self.graph.op_by_id(id) {
                            Some(op) => op.outputs.clone(),
                            None => continue,
                        };
                        for (name, value) in outputs.iter().zip(values) {
                            self.commit(name, frame, Slot::Value(value));
                        }
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if first_error.is_some() {
                break;
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fire `(id, frame)` if its inputs are resolved.
    ///
    /// Control-flow primitives and dead propagation complete here; a compute
    /// op with live inputs comes back as work for the executor.
    fn step(&mut self, id: OpId, frame: FrameId) -> GraphResult<Option<Work>> {
        if self.fired.contains(&(id, frame)) {
            return Ok(None);
        }
        let graph = self.graph;
        let op = graph
            .op_by_id(id)
            .ok_or_else(|| GraphError::Internal(format!("operation {} vanished", id)))?;

        if let Some(backward) = self.replay_ops.get(&id) {
            if self.frames.key(frame).map(|k| &k.name) != Some(backward) {
                return Ok(None);
            }
        }
        if op.control_deps.iter().any(|d| self.slot(d, frame).is_none()) {
            return Ok(None);
        }
        if op.op_type == OpType::Merge {
            return self.merge(op, frame).map(|_| None);
        }

        let mut inputs = Vec::with_capacity(op.inputs.len());
        for name in &op.inputs {
            match self.slot(name, frame) {
                Some(slot) => inputs.push(slot.clone()),
                None => return Ok(None),
            }
        }
        if op.op_type == OpType::ForwardIteration {
            return self.forward_iteration(op, frame, &inputs);
        }
        self.fired.insert((id, frame));

        let live: Option<Vec<NdArray>> = inputs
            .into_iter()
            .map(|s| match s {
                Slot::Value(v) => Some(v),
                Slot::Dead => None,
            })
            .collect();

        match op.op_type {
            OpType::Enter => self.enter(op, frame, live),
            OpType::Exit => self.exit(op, frame, live),
            OpType::NextIteration => self.next_iteration(op, frame, live),
            OpType::Switch => self.switch(op, frame, live),
            _ => match live {
                None => {
                    for out in &op.outputs {
                        self.commit(out, frame, Slot::Dead);
                    }
                    Ok(None)
                }
                Some(inputs) => {
                    let seed = match graph.config.execution.rng_seed {
                        Some(base) => base
                            .wrapping_add((id.index() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
                            .wrapping_add(frame as u64),
                        None => rand::thread_rng().gen(),
                    };
                    Ok(Some(Work {
                        op: id,
                        frame,
                        inputs,
                        seed,
                    }))
                }
            },
        }
    }

    fn loop_frame<'o>(op: &'o OpRecord) -> GraphResult<&'o str> {
        op.frame()
            .ok_or_else(|| GraphError::Internal(format!("'{}' has no frame", op.name)))
    }

    fn output(op: &OpRecord, index: usize) -> GraphResult<&str> {
        op.output(index)
            .ok_or_else(|| GraphError::Internal(format!("'{}' has no output {}", op.name, index)))
    }

    fn enter(&mut self, op: &OpRecord, frame: FrameId, live: Option<Vec<NdArray>>) -> GraphResult<Option<Work>> {
        let name = Self::loop_frame(op)?;
        let out = Self::output(op, 0)?;
        let (child, _) = self.frames.intern(frame, name, 0);
        let slot = match live.and_then(|mut v| v.pop()) {
            Some(v) => Slot::Value(v),
            None => Slot::Dead,
        };
        self.commit(out, child, slot);
        // Iterations may already be running when a loop invariant arrives
        for iteration in self.frames.iterations(frame, name) {
            if iteration != child {
                self.trigger(out, iteration);
            }
        }
        Ok(None)
    }

    fn exit(&mut self, op: &OpRecord, frame: FrameId, live: Option<Vec<NdArray>>) -> GraphResult<Option<Work>> {
        let out = Self::output(op, 0)?;
        let parent = self
            .frames
            .parent(frame)
            .ok_or_else(|| GraphError::Internal(format!("'{}' exits the root frame", op.name)))?;
        match live.and_then(|mut v| v.pop()) {
            Some(value) => {
                trace!(op = %op.name, "Loop exit");
                self.commit(out, parent, Slot::Value(value));
            }
            None if self.loop_died(op, frame) => {
                trace!(op = %op.name, "Dead loop exit");
                self.commit(out, parent, Slot::Dead);
            }
            None => {}
        }
        Ok(None)
    }

    /// Whether a dead exit input comes from a loop that stopped dead, as
    /// opposed to a switch that sent the value into another iteration
    fn loop_died(&self, op: &OpRecord, frame: FrameId) -> bool {
        match op.input(0).and_then(|i| self.graph.producer_of(i)) {
            Some(switch) if switch.op_type == OpType::Switch => switch
                .inputs
                .iter()
                .any(|i| matches!(self.slot(i, frame), Some(Slot::Dead))),
            _ => true,
        }
    }

    fn forward_iteration(&mut self, op: &OpRecord, frame: FrameId, inputs: &[Slot]) -> GraphResult<Option<Work>> {
        let out = Self::output(op, 0)?;
        if inputs.iter().any(|s| matches!(s, Slot::Dead)) {
            self.fired.insert((op.id, frame));
            self.commit(out, frame, Slot::Dead);
            return Ok(None);
        }
        let key = self.frames.key(frame).cloned();
        let forward = key.as_ref().and_then(|k| self.replays.get(&k.name)).cloned();
        let (key, forward) = match (key, forward) {
            (Some(key), Some(forward)) => (key, forward),
            _ => {
                return Err(GraphError::Internal(format!(
                    "'{}' runs outside a backward loop",
                    op.name
                )))
            }
        };
        let index = match self.replayed_index(key.parent, &forward, key.iteration) {
            Some(index) => index,
            None => {
                self.waiting.push((op.id, frame));
                return Ok(None);
            }
        };
        self.fired.insert((op.id, frame));
        trace!(frame = %key.name, iteration = key.iteration, replays = index, "Backward loop iteration");
        self.commit(out, frame, Slot::Value(NdArray::scalar(index as f64, DType::I64)));
        Ok(None)
    }

    fn next_iteration(&mut self, op: &OpRecord, frame: FrameId, live: Option<Vec<NdArray>>) -> GraphResult<Option<Work>> {
        let value = match live.and_then(|mut v| v.pop()) {
            Some(v) => v,
            None => return Ok(None),
        };
        let out = Self::output(op, 0)?;
        let key = self
            .frames
            .key(frame)
            .cloned()
            .ok_or_else(|| GraphError::Internal(format!("'{}' runs outside a loop frame", op.name)))?;
        let limit = self.graph.config.execution.max_loop_iterations;
        if key.iteration + 1 > limit {
            warn!(frame = %key.name, limit, "Loop iteration limit reached");
            return Err(GraphError::LoopLimitExceeded {
                frame: key.name,
                limit,
            });
        }
        let (next, created) = self.frames.intern(key.parent, &key.name, key.iteration + 1);
        self.commit(out, next, Slot::Value(value));
        if created {
            trace!(frame = %key.name, iteration = key.iteration + 1, "Started loop iteration");
            let invariants = self.invariants.get(&key.name).cloned().unwrap_or_default();
            for name in invariants {
                if self.slot(&name, next).is_some() {
                    self.trigger(&name, next);
                }
            }
        }
        Ok(None)
    }

    fn switch(&mut self, op: &OpRecord, frame: FrameId, live: Option<Vec<NdArray>>) -> GraphResult<Option<Work>> {
        let (f, t) = (Self::output(op, 0)?.to_string(), Self::output(op, 1)?.to_string());
        let (value, predicate) = match live {
            Some(mut v) if v.len() == 2 => {
                let p = v.pop();
                (v.pop(), p)
            }
            _ => (None, None),
        };
        let (value, predicate) = match (value, predicate) {
            (Some(v), Some(p)) => (v, p),
            _ => {
                self.commit(&f, frame, Slot::Dead);
                self.commit(&t, frame, Slot::Dead);
                self.finish_loop(op, frame);
                return Ok(None);
            }
        };
        let taken = predicate.as_bool().ok_or_else(|| {
            GraphError::InvalidArgument(format!(
                "switch '{}' needs a scalar predicate, got shape {:?}",
                op.name,
                predicate.shape()
            ))
        })?;
        let (live_out, dead_out) = if taken { (t, f) } else { (f, t) };
        self.commit(&dead_out, frame, Slot::Dead);
        self.commit(&live_out, frame, Slot::Value(value));
        if !taken {
            self.finish_loop(op, frame);
        }
        Ok(None)
    }

    /// Record that the loop driven by switch `op` stopped iterating
    fn finish_loop(&mut self, op: &OpRecord, frame: FrameId) {
        if !self.loop_switches.contains(&op.id) {
            return;
        }
        let key = match self.frames.key(frame) {
            Some(key) => key.clone(),
            None => return,
        };
        if self.finished.insert((key.parent, key.name.clone())) {
            trace!(frame = %key.name, iterations = key.iteration + 1, "Loop finished");
            let waiting = std::mem::take(&mut self.waiting);
            self.pending.extend(waiting);
        }
    }

    /// Forward the first live input; dead only once every input is dead.
    ///
    /// Enter and next-iteration inputs are only looked up in this exact
    /// frame so a loop merge picks up the value of its own iteration. The
    /// first iteration only waits for its enter, later ones only for their
    /// next-iteration input.
    fn merge(&mut self, op: &OpRecord, frame: FrameId) -> GraphResult<()> {
        let graph = self.graph;
        let out = Self::output(op, 0)?.to_string();
        let in_loop = op.inputs.iter().any(|name| {
            matches!(
                graph.producer_of(name).map(|p| p.op_type),
                Some(OpType::Enter) | Some(OpType::NextIteration)
            )
        });

        // A conditional merge carries its predicate as control dependency
        if !in_loop && op.inputs.len() == 2 {
            let predicate = op.control_deps.first().and_then(|p| self.slot(p, frame));
            let taken = match predicate {
                Some(Slot::Value(p)) => p.as_bool().map(|t| Some(usize::from(t))),
                Some(Slot::Dead) => Some(None),
                None => None,
            };
            if let Some(taken) = taken {
                let slot = match taken {
                    Some(index) => match self.slot(&op.inputs[index], frame) {
                        Some(slot) => slot.clone(),
                        None => return Ok(()),
                    },
                    None => Slot::Dead,
                };
                self.fired.insert((op.id, frame));
                self.commit(&out, frame, slot);
                return Ok(());
            }
        }

        let arriving = match self.frames.key(frame) {
            Some(key) if in_loop && key.iteration == 0 => Some(OpType::Enter),
            Some(_) if in_loop => Some(OpType::NextIteration),
            _ => None,
        };
        let mut live: Option<NdArray> = None;
        let mut all_dead = true;
        for name in &op.inputs {
            let producer = graph.producer_of(name).map(|p| p.op_type);
            let loop_input = matches!(producer, Some(OpType::Enter) | Some(OpType::NextIteration));
            if loop_input && arriving.is_some() && producer != arriving {
                continue;
            }
            let slot = match producer {
                Some(OpType::Enter) | Some(OpType::NextIteration) => self.exact(name, frame),
                _ => self.slot(name, frame),
            };
            match slot {
                Some(Slot::Value(v)) => {
                    let from_next = producer == Some(OpType::NextIteration);
                    if live.is_none() || from_next {
                        live = Some(v.clone());
                    }
                    all_dead = false;
                }
                Some(Slot::Dead) => {}
                None => all_dead = false,
            }
        }
        match live {
            Some(value) => {
                self.fired.insert((op.id, frame));
                self.commit(&out, frame, Slot::Value(value));
            }
            None if all_dead => {
                self.fired.insert((op.id, frame));
                self.commit(&out, frame, Slot::Dead);
            }
            None => {}
        }
        Ok(())
    }

    fn dispatch(&mut self, work: Vec<Work>) -> Vec<Dispatched> {
        self.dispatched += work.len();
        let graph = self.graph;
        #[cfg(feature = "parallel")]
        {
            if graph.config.execution.parallel && work.len() > 1 {
                return work
                    .into_par_iter()
                    .map(|w| (w.op, w.frame, invoke(graph, &w)))
                    .collect();
            }
        }
        work.into_iter().map(|w| (w.op, w.frame, invoke(graph, &w))).collect()
    }
}

/// Run one op on the graph's executor and check what came back
fn invoke(graph: &SameDiff, work: &Work) -> GraphResult<Vec<NdArray>> {
    let op = graph
        .op_by_id(work.op)
        .ok_or_else(|| GraphError::Internal(format!("operation {} vanished", work.op)))?;
    let mut dtypes = Vec::with_capacity(op.outputs.len());
    for out in &op.outputs {
        dtypes.push(graph.variable(out)?.dtype);
    }
    let mut ctx = OpContext::for_op(op, dtypes, work.seed);
    if graph.config.development.verbose_logging {
        debug!(op = %op.name, op_type = %op.op_type, frame = work.frame, "Dispatching");
    } else {
        trace!(op = %op.name, op_type = %op.op_type, frame = work.frame, "Dispatching");
    }
    let values = graph
        .executor
        .invoke(&mut ctx, &work.inputs)
        .map_err(|e| GraphError::NativeExecution {
            op: op.name.clone(),
            code: e.code,
            message: e.message,
        })?;

    if values.len() != op.outputs.len() {
        return Err(GraphError::Internal(format!(
            "executor returned {} outputs for '{}', expected {}",
            values.len(),
            op.name,
            op.outputs.len()
        )));
    }
    if graph.config.execution.validate_output_shapes {
        for (name, value) in op.outputs.iter().zip(&values) {
            let var = graph.variable(name)?;
            if value.dtype() != var.dtype || !var.shape.is_compatible_with(value.shape()) {
                return Err(GraphError::Internal(format!(
                    "'{}' produced {:?} {}, inferred {} {}",
                    name,
                    value.shape(),
                    value.dtype(),
                    var.shape,
                    var.dtype
                )));
            }
        }
    }
    Ok(values)
}

/// Size the global rayon pool once, on first use
fn configure_thread_pool(threads: usize) {
    static INIT: Once = Once::new();
    if threads == 0 {
        return;
    }
    INIT.call_once(|| {
        #[cfg(feature = "parallel")]
        {
            if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
                warn!(error = %e, "Global thread pool already initialized");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::exec::{CpuExecutor, NativeError, OpExecutor};
    use crate::ops::OpBuilder;
    use crate::tensor::{DType, Shape};

    fn bind(name: &str, value: NdArray) -> HashMap<String, NdArray> {
        let mut bindings = HashMap::new();
        bindings.insert(name.to_string(), value);
        bindings
    }

    /// x * w + c with w and c fixed
    fn affine() -> (SameDiff, String, String) {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F32, Shape::known(&[2])).unwrap();
        sd.constant("w", NdArray::from_f32(vec![2.0, 3.0], &[2]).unwrap()).unwrap();
        sd.constant("c", NdArray::from_f32(vec![1.0, 1.0], &[2]).unwrap()).unwrap();
        let wc = sd.mul("w", "c").unwrap();
        let xw = sd.mul("x", "w").unwrap();
        let y = sd.add(&xw, &wc).unwrap();
        (sd, wc, y)
    }

    #[test]
    fn test_cache_tracks_placeholder_bindings() {
        let (sd, wc, y) = affine();
        let first = sd
            .execute(&[&y, &wc], &bind("x", NdArray::from_f32(vec![1.0, 1.0], &[2]).unwrap()))
            .unwrap();
        let second = sd
            .execute(&[&y, &wc], &bind("x", NdArray::from_f32(vec![2.0, 0.0], &[2]).unwrap()))
            .unwrap();
        assert_eq!(first[&y].to_vec(), vec![4.0, 6.0]);
        assert_eq!(second[&y].to_vec(), vec![6.0, 3.0]);
        assert!(first[&wc].shares_buffer(&second[&wc]));
    }

    #[test]
    fn test_cache_invalidated_by_value_update() {
        let mut sd = SameDiff::new();
        sd.var("w", NdArray::scalar(2.0, DType::F32)).unwrap();
        let y = sd.mul_scalar("w", 3.0).unwrap();
        assert_eq!(sd.execute_one(&y, &HashMap::new()).unwrap().scalar_value(), Some(6.0));
        sd.set_variable_value("w", NdArray::scalar(5.0, DType::F32)).unwrap();
        assert_eq!(sd.execute_one(&y, &HashMap::new()).unwrap().scalar_value(), Some(15.0));
    }

    #[test]
    fn test_missing_placeholder() {
        let (sd, _, y) = affine();
        let err = sd.execute_one(&y, &HashMap::new()).unwrap_err();
        assert!(matches!(err, GraphError::MissingPlaceholder(ref name) if name == "x"));
    }

    #[test]
    fn test_placeholder_default_used_when_unbound() {
        let (mut sd, _, y) = affine();
        sd.set_placeholder_default("x", Some(NdArray::from_f32(vec![0.0, 1.0], &[2]).unwrap()))
            .unwrap();
        let out = sd.execute_one(&y, &HashMap::new()).unwrap();
        assert_eq!(out.to_vec(), vec![2.0, 6.0]);
    }

    #[test]
    fn test_bound_shape_checked() {
        let (sd, _, y) = affine();
        let err = sd
            .execute_one(&y, &bind("x", NdArray::from_f32(vec![1.0, 2.0, 3.0], &[3]).unwrap()))
            .unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatchAtRuntime { .. }));
    }

    #[test]
    fn test_bound_dtype_checked() {
        let (sd, _, y) = affine();
        let err = sd
            .execute_one(&y, &bind("x", NdArray::zeros(&[2], DType::F64)))
            .unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
    }

    #[test]
    fn test_only_placeholders_can_be_bound() {
        let (sd, _, y) = affine();
        let err = sd
            .execute_one(&y, &bind("w", NdArray::zeros(&[2], DType::F32)))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
        let err = sd
            .execute_one(&y, &bind("nope", NdArray::zeros(&[2], DType::F32)))
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownVariable(_)));
    }

    #[test]
    fn test_requesting_a_global_returns_its_value() {
        let (sd, _, _) = affine();
        let w = sd.execute_one("w", &HashMap::new()).unwrap();
        assert_eq!(w.to_vec(), vec![2.0, 3.0]);
    }

    struct FailingExecutor {
        calls: AtomicUsize,
    }

    impl OpExecutor for FailingExecutor {
        fn name(&self) -> &str {
            "failing"
        }

        fn invoke(&self, ctx: &mut OpContext, inputs: &[NdArray]) -> Result<Vec<NdArray>, NativeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.op_type == OpType::Sqrt {
                return Err(NativeError::new(42, "sqrt unavailable"));
            }
            CpuExecutor::new().invoke(ctx, inputs)
        }
    }

    #[test]
    fn test_native_error_propagates() {
        let executor = Arc::new(FailingExecutor {
            calls: AtomicUsize::new(0),
        });
        let mut sd = SameDiff::new().with_executor(executor.clone());
        sd.constant("a", NdArray::scalar(4.0, DType::F32)).unwrap();
        let root = sd.sqrt("a").unwrap();
        let out = sd.add_scalar(&root, 1.0).unwrap();
        let err = sd.execute_one(&out, &HashMap::new()).unwrap_err();
        match err {
            GraphError::NativeExecution { op, code, message } => {
                assert_eq!(op, sd.producer_of(&root).unwrap().name());
                assert_eq!(code, 42);
                assert_eq!(message, "sqrt unavailable");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_random_values_not_cached() {
        let config = EngineConfig {
            execution: crate::config::ExecutionConfig {
                rng_seed: None,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut sd = SameDiff::with_config(config);
        let r = sd.random_uniform(&[16], 0.0, 1.0, DType::F64).unwrap();
        let y = sd.mul_scalar(&r, 1.0).unwrap();
        let a = sd.execute_one(&y, &HashMap::new()).unwrap();
        let b = sd.execute_one(&y, &HashMap::new()).unwrap();
        assert_ne!(a.to_vec(), b.to_vec());
        assert!(sd.session.lock().is_empty());
    }

    #[test]
    fn test_independent_branches_agree_with_sequential_run() {
        let build = |parallel: bool| {
            let mut config = EngineConfig::default();
            config.execution.parallel = parallel;
            let mut sd = SameDiff::with_config(config);
            sd.constant("a", NdArray::from_f32(vec![1.0, 2.0, 3.0], &[3]).unwrap()).unwrap();
            let mut leaves = Vec::new();
            for i in 0..8 {
                let scaled = sd.mul_scalar("a", i as f64).unwrap();
                leaves.push(sd.exp(&scaled).unwrap());
            }
            let mut total = leaves[0].clone();
            for leaf in &leaves[1..] {
                total = sd.add(&total, leaf).unwrap();
            }
            sd.execute_one(&total, &HashMap::new()).unwrap()
        };
        assert!(build(true).all_close(&build(false), 1e-6));
    }

    #[test]
    fn test_loop_in_untaken_branch_exits_dead() {
        let mut sd = SameDiff::new();
        sd.placeholder("flag", DType::Bool, Shape::scalar()).unwrap();
        sd.constant("start", NdArray::scalar(0.0, DType::F32)).unwrap();
        sd.constant("limit", NdArray::scalar(3.0, DType::F32)).unwrap();
        let out = sd
            .if_cond(
                None,
                |g| g.identity("flag"),
                |b| {
                    let counted = b.while_loop(
                        None,
                        &["start"],
                        |c, v| c.lt(&v[0], "limit"),
                        |c, v| Ok(vec![c.add_scalar(&v[0], 1.0)?]),
                    )?;
                    Ok(counted[0].clone())
                },
                |b| b.identity("start"),
            )
            .unwrap();
        let exit = sd
            .operations()
            .find(|op| op.op_type() == OpType::Exit)
            .and_then(|op| op.output(0))
            .unwrap()
            .to_string();
        let after = sd.add_scalar(&exit, 1.0).unwrap();

        let effective = sd
            .effective_placeholders(&bind("flag", NdArray::scalar(0.0, DType::Bool)))
            .unwrap();
        let mut run = Run::new(&sd);
        run.plan(&[&out, &after], &effective).unwrap();
        run.preload(&effective).unwrap();
        run.run_waves().unwrap();
        assert!(matches!(run.slot(&exit, ROOT), Some(Slot::Dead)));
        assert!(matches!(run.slot(&after, ROOT), Some(Slot::Dead)));
        assert!(matches!(run.slot(&out, ROOT), Some(Slot::Value(v)) if v.scalar_value() == Some(0.0)));

        let bindings = bind("flag", NdArray::scalar(1.0, DType::Bool));
        assert_eq!(sd.execute_one(&out, &bindings).unwrap().scalar_value(), Some(3.0));
    }
}
