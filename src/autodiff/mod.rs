//! Reverse-mode differentiation
//!
//! `build_gradient_graph` appends the backward pass to the same graph the
//! forward pass lives in. Gradient rules are ordinary builder calls, so the
//! backward ops can themselves be differentiated.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info};

use crate::error::{GraphError, GraphResult};
use crate::graph::{OpArgs, OpId, OpRecord, SameDiff, VariableKind};
use crate::ops::{gradients, GradRule, OpBuilder, OpType};
use crate::tensor::{DType, NdArray};

/// Forward variable name to the name of the variable holding its gradient
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradientMap {
    grads: HashMap<String, String>,
}

impl GradientMap {
    pub fn get(&self, variable: &str) -> Option<&str> {
        self.grads.get(variable).map(String::as_str)
    }

    pub fn contains(&self, variable: &str) -> bool {
        self.grads.contains_key(variable)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.grads.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The relevant part of one `while` loop, differentiated as a whole
#[derive(Debug)]
struct LoopUnit {
    frame: String,
    members: HashSet<OpId>,
    carried: Vec<Carried>,
    /// Loop-invariant enters of floating-point values
    invariants: Vec<OpRecord>,
    /// Condition and body ops
    body: HashSet<OpId>,
}

/// A floating-point loop variable and the primitives threading it
#[derive(Debug)]
struct Carried {
    enter: OpRecord,
    switch: OpRecord,
    next: OpRecord,
    exit: OpRecord,
}

fn input(op: &OpRecord, index: usize) -> GraphResult<&str> {
    op.input(index)
        .ok_or_else(|| GraphError::Internal(format!("'{}' has no input {}", op.name, index)))
}

fn output(op: &OpRecord, index: usize) -> GraphResult<&str> {
    op.output(index)
        .ok_or_else(|| GraphError::Internal(format!("'{}' has no output {}", op.name, index)))
}

fn single(grads: Vec<Option<String>>) -> GraphResult<String> {
    grads
        .into_iter()
        .next()
        .flatten()
        .ok_or_else(|| GraphError::Internal("gradient rule produced no gradient".to_string()))
}

impl SameDiff {
    /// Add the gradient of the summed `losses` with respect to `wrt`.
    ///
    /// Empty `losses` falls back to the registered loss variables; empty
    /// `wrt` means every floating-point trainable variable. Variables with no
    /// path to a loss get no entry in the returned map. On failure every op
    /// added so far is removed again.
    pub fn build_gradient_graph(&mut self, losses: &[&str], wrt: &[&str]) -> GraphResult<GradientMap> {
        let losses = self.resolve_losses(losses)?;
        let wrt = self.resolve_wrt(wrt)?;

        let checkpoint = self.checkpoint();
        let scope = self.config.naming.gradient_scope.clone();
        self.push_scope(&scope);
        let result = self.backprop(&losses, &wrt);
        self.pop_scope();

        let result = result.and_then(|grads| self.name_gradients(grads, checkpoint.var_seq));
        match result {
            Ok(map) => {
                info!(
                    losses = ?losses,
                    gradients = map.len(),
                    operations = self.num_operations(),
                    "Built gradient graph"
                );
                Ok(map)
            }
            Err(e) => {
                self.rollback(checkpoint);
                Err(e)
            }
        }
    }

    /// Gradients of the registered loss variables, evaluated under `bindings`.
    ///
    /// The gradient graph is built on first use and reused until the graph
    /// changes structurally.
    pub fn calculate_gradients(
        &mut self,
        bindings: &HashMap<String, NdArray>,
        wrt: &[&str],
    ) -> GraphResult<HashMap<String, NdArray>> {
        let map = self.cached_gradient_map(wrt)?;
        let names: Vec<&str> = map.iter().map(|(_, g)| g).collect();
        let mut values = self.execute(&names, bindings)?;
        let mut result = HashMap::with_capacity(map.len());
        for (var, grad) in map.iter() {
            if let Some(value) = values.remove(grad) {
                result.insert(var.to_string(), value);
            }
        }
        Ok(result)
    }

    pub(crate) fn cached_gradient_map(&mut self, wrt: &[&str]) -> GraphResult<GradientMap> {
        let losses = self.resolve_losses(&[])?;
        let wrt = self.resolve_wrt(wrt)?;
        if let Some((version, cached_losses, cached_wrt, map)) = &self.gradient_cache {
            if *version == self.version && *cached_losses == losses && *cached_wrt == wrt {
                return Ok(map.clone());
            }
        }
        let loss_refs: Vec<&str> = losses.iter().map(String::as_str).collect();
        let wrt_refs: Vec<&str> = wrt.iter().map(String::as_str).collect();
        let map = self.build_gradient_graph(&loss_refs, &wrt_refs)?;
        self.gradient_cache = Some((self.version, losses, wrt, map.clone()));
        Ok(map)
    }

    fn resolve_losses(&self, losses: &[&str]) -> GraphResult<Vec<String>> {
        let losses: Vec<String> = if losses.is_empty() {
            self.loss_variables.clone()
        } else {
            losses.iter().map(|l| l.to_string()).collect()
        };
        if losses.is_empty() {
            return Err(GraphError::InvalidArgument(
                "no loss variables given or registered".to_string(),
            ));
        }
        for loss in &losses {
            let var = self.variable(loss)?;
            if !var.dtype.is_float() {
                return Err(GraphError::type_mismatch(
                    loss,
                    format!("loss must be floating point, got {}", var.dtype),
                ));
            }
        }
        Ok(losses)
    }

    fn resolve_wrt(&self, wrt: &[&str]) -> GraphResult<Vec<String>> {
        if wrt.is_empty() {
            return Ok(self
                .variables()
                .filter(|v| v.kind == VariableKind::Variable && v.dtype.is_float())
                .map(|v| v.name.clone())
                .collect());
        }
        let mut names = Vec::with_capacity(wrt.len());
        for w in wrt {
            let var = self.variable(w)?;
            if !var.dtype.is_float() {
                return Err(GraphError::type_mismatch(
                    w,
                    format!("gradients exist only for floating point variables, got {}", var.dtype),
                ));
            }
            names.push(var.name.clone());
        }
        Ok(names)
    }

    /// Walk the relevant ops in reverse order, accumulating input gradients.
    ///
    /// Each loop is scheduled as a single node and differentiated as a whole
    /// once every consumer of its exits has been handled.
    fn backprop(&mut self, losses: &[String], wrt: &[String]) -> GraphResult<HashMap<String, String>> {
        let relevant = self.relevant_ops(losses, wrt)?;
        let loops = self.loop_units(&relevant)?;
        let mut anchors = HashMap::new();
        let mut loop_at = HashMap::new();
        for (i, unit) in loops.iter().enumerate() {
            let anchor = unit
                .members
                .iter()
                .min()
                .copied()
                .ok_or_else(|| GraphError::Internal(format!("loop '{}' has no operations", unit.frame)))?;
            for &id in &unit.members {
                anchors.insert(id, anchor);
            }
            loop_at.insert(anchor, i);
        }
        let order = self.topological_order(&relevant, &anchors)?;
        debug!(operations = relevant.len(), loops = loops.len(), "Differentiating operations");

        let mut pending: HashMap<String, Vec<String>> = HashMap::new();
        for loss in losses {
            let seed = self.op1(OpType::GradientBackwardsMarker, OpArgs::new(), &[loss.as_str()])?;
            pending.entry(loss.clone()).or_default().push(seed);
        }

        let mut totals: HashMap<String, String> = HashMap::new();
        for id in order.iter().rev() {
            match loop_at.get(id) {
                Some(&i) => self.differentiate_loop(&loops[i], &mut pending, &mut totals)?,
                None => self.differentiate_op(*id, &mut pending, &mut totals)?,
            }
        }

        let mut result = HashMap::with_capacity(wrt.len());
        for w in wrt {
            if let Some(g) = self.accumulate(w, &mut pending, &mut totals)? {
                result.insert(w.clone(), g);
            }
        }
        Ok(result)
    }

    fn differentiate_op(
        &mut self,
        id: OpId,
        pending: &mut HashMap<String, Vec<String>>,
        totals: &mut HashMap<String, String>,
    ) -> GraphResult<()> {
        let op = self
            .op_by_id(id)
            .cloned()
            .ok_or_else(|| GraphError::Internal(format!("operation {} vanished", id)))?;

        let mut out_grads = Vec::with_capacity(op.outputs.len());
        for out in &op.outputs {
            out_grads.push(self.accumulate(out, pending, totals)?);
        }
        if out_grads.iter().all(Option::is_none) {
            return Ok(());
        }

        let in_grads = match op.op_type.descriptor().gradient {
            GradRule::Rule(rule) => rule(self, &op, &out_grads)?,
            GradRule::NotDifferentiable => return Ok(()),
            GradRule::Missing => {
                return Err(GraphError::NoGradientRule {
                    op_type: op.op_type.name().to_string(),
                    op: op.name.clone(),
                })
            }
        };
        self.collect_input_grads(&op, in_grads, pending)
    }

    /// Build the backward loop of `unit`.
    ///
    /// It carries the adjoint of every floating-point loop variable, seeded
    /// with the gradients of the exits, plus one accumulator per loop
    /// invariant. Iteration `j` runs the body's gradient rules against the
    /// forward values of forward iteration `n - 1 - j` and stops once
    /// `forward_iteration` drops below zero. The forward switches turn into
    /// the backward merges and the forward merges into the backward switches.
    fn differentiate_loop(
        &mut self,
        unit: &LoopUnit,
        pending: &mut HashMap<String, Vec<String>>,
        totals: &mut HashMap<String, String>,
    ) -> GraphResult<()> {
        let mut seeds = Vec::with_capacity(unit.carried.len());
        for var in &unit.carried {
            seeds.push(self.accumulate(output(&var.exit, 0)?, pending, totals)?);
        }
        if seeds.iter().all(Option::is_none) {
            return Ok(());
        }
        let frame = unit.frame.as_str();

        let mut entered = Vec::with_capacity(unit.carried.len() + unit.invariants.len());
        for (var, seed) in unit.carried.iter().zip(seeds) {
            let seed = match seed {
                Some(g) => g,
                None => self.zeros_like(output(&var.exit, 0)?)?,
            };
            entered.push(single(gradients::exit(self, &var.exit, &[Some(seed)])?)?);
        }
        for invariant in &unit.invariants {
            let zeros = self.zeros_like(input(invariant, 0)?)?;
            entered.push(gradients::enter_backward(self, frame, &zeros)?);
        }

        let mut merge_ops = Vec::with_capacity(entered.len());
        let mut merged = Vec::with_capacity(entered.len());
        for e in &entered {
            // Second input is back-patched with the next adjoint below
            let m = self.op1(OpType::Merge, OpArgs::new(), &[e.as_str(), e.as_str()])?;
            let merge_op = self
                .producer_of(&m)
                .map(|op| op.name.clone())
                .ok_or_else(|| GraphError::Internal(format!("'{}' has no producer", m)))?;
            merge_ops.push(merge_op);
            merged.push(m);
        }
        let index = self.op1(OpType::ForwardIteration, OpArgs::new(), &[merged[0].as_str()])?;
        let zero = self.scalar(0.0, DType::I64)?;
        let replaying = self.gte(&index, &zero)?;

        let mut leaving = Vec::with_capacity(merged.len());
        let mut taken = Vec::with_capacity(merged.len());
        for m in &merged {
            let outputs = self.add_op(None, OpType::Switch, OpArgs::new(), &[m.as_str(), replaying.as_str()])?;
            match outputs.as_slice() {
                [f, t] => {
                    leaving.push(f.clone());
                    taken.push(t.clone());
                }
                _ => return Err(GraphError::Internal("switch must have two outputs".to_string())),
            }
        }

        let mut body_pending: HashMap<String, Vec<String>> = HashMap::new();
        let mut body_totals: HashMap<String, String> = HashMap::new();
        for (var, adjoint) in unit.carried.iter().zip(&taken) {
            body_pending
                .entry(input(&var.next, 0)?.to_string())
                .or_default()
                .push(adjoint.clone());
        }
        let order = self.topological_order(&unit.body, &HashMap::new())?;
        for id in order.iter().rev() {
            self.differentiate_op(*id, &mut body_pending, &mut body_totals)?;
        }

        let carried = unit.carried.len();
        for (i, var) in unit.carried.iter().enumerate() {
            let seen = output(&var.switch, 1)?;
            let adjoint = match self.accumulate(seen, &mut body_pending, &mut body_totals)? {
                Some(g) => g,
                None => self.zeros_like(seen)?,
            };
            let next = single(gradients::next_iteration(self, &var.next, &[Some(adjoint)])?)?;
            self.replace_input(&merge_ops[i], 1, &next)?;
        }
        for (i, invariant) in unit.invariants.iter().enumerate() {
            let total = &taken[carried + i];
            let update = match self.accumulate(output(invariant, 0)?, &mut body_pending, &mut body_totals)? {
                Some(part) => self.add(total, &part)?,
                None => total.clone(),
            };
            let next = gradients::next_backward(self, frame, &update)?;
            self.replace_input(&merge_ops[carried + i], 1, &next)?;
        }

        for (var, f) in unit.carried.iter().zip(&leaving) {
            let grads = gradients::enter(self, &var.enter, &[Some(f.clone())])?;
            self.collect_input_grads(&var.enter, grads, pending)?;
        }
        for (invariant, f) in unit.invariants.iter().zip(&leaving[carried..]) {
            let grads = gradients::enter(self, invariant, &[Some(f.clone())])?;
            self.collect_input_grads(invariant, grads, pending)?;
        }
        debug!(
            frame = %unit.frame,
            carried,
            invariants = unit.invariants.len(),
            body = unit.body.len(),
            "Differentiated loop"
        );
        Ok(())
    }

    fn collect_input_grads(
        &self,
        op: &OpRecord,
        in_grads: Vec<Option<String>>,
        pending: &mut HashMap<String, Vec<String>>,
    ) -> GraphResult<()> {
        for (input, grad) in op.inputs.iter().zip(in_grads) {
            let grad = match grad {
                Some(g) => g,
                None => continue,
            };
            if !self.variable(input)?.dtype.is_float() {
                continue;
            }
            pending.entry(input.clone()).or_default().push(grad);
        }
        Ok(())
    }

    /// Sum every contribution to `var`'s gradient into one variable
    fn accumulate(
        &mut self,
        var: &str,
        pending: &mut HashMap<String, Vec<String>>,
        totals: &mut HashMap<String, String>,
    ) -> GraphResult<Option<String>> {
        if let Some(total) = totals.get(var) {
            return Ok(Some(total.clone()));
        }
        let parts = match pending.remove(var) {
            Some(parts) if !parts.is_empty() => parts,
            _ => return Ok(None),
        };
        let mut iter = parts.into_iter();
        let mut total = match iter.next() {
            Some(first) => first,
            None => return Ok(None),
        };
        for part in iter {
            total = self.add(&total, &part)?;
        }
        totals.insert(var.to_string(), total.clone());
        Ok(Some(total))
    }

    /// Ops on some path from a `wrt` variable to a loss
    fn relevant_ops(&self, losses: &[String], wrt: &[String]) -> GraphResult<HashSet<OpId>> {
        let mut backward: HashSet<OpId> = HashSet::new();
        let mut stack: Vec<String> = losses.to_vec();
        while let Some(var) = stack.pop() {
            if let Some(op) = self.producer_of(&var) {
                if backward.insert(op.id) {
                    stack.extend(op.inputs.iter().cloned());
                }
            }
        }

        let mut forward: HashSet<OpId> = HashSet::new();
        let mut stack: Vec<String> = wrt.to_vec();
        while let Some(var) = stack.pop() {
            for id in self.consumers_of(&var) {
                if forward.insert(id) {
                    if let Some(op) = self.op_by_id(id) {
                        stack.extend(op.outputs.iter().cloned());
                    }
                }
            }
        }

        Ok(backward.intersection(&forward).copied().collect())
    }

    /// Group the relevant ops of every loop into one unit per frame.
    ///
    /// A unit holds the relevant ops reachable from the loop's enters up to
    /// its exits. Loops nested inside a differentiated loop have no gradient.
    fn loop_units(&self, relevant: &HashSet<OpId>) -> GraphResult<Vec<LoopUnit>> {
        let mut frames: Vec<String> = relevant
            .iter()
            .filter_map(|&id| self.op_by_id(id))
            .filter(|op| op.op_type.is_control_flow())
            .filter_map(|op| op.frame().map(str::to_string))
            .collect();
        frames.sort();
        frames.dedup();

        let mut units: Vec<LoopUnit> = Vec::with_capacity(frames.len());
        for frame in frames {
            if units.iter().any(|u| u.members.iter().any(|&id| self.frame_of(id) == Some(frame.as_str()))) {
                continue;
            }
            units.push(self.loop_unit(&frame, relevant)?);
        }
        Ok(units)
    }

    fn frame_of(&self, id: OpId) -> Option<&str> {
        self.op_by_id(id).and_then(|op| op.frame())
    }

    fn loop_unit(&self, frame: &str, relevant: &HashSet<OpId>) -> GraphResult<LoopUnit> {
        let in_frame = |op: &OpRecord, op_type: OpType| op.op_type == op_type && op.frame() == Some(frame);

        let mut members: HashSet<OpId> = HashSet::new();
        let mut stack: Vec<OpId> = relevant
            .iter()
            .copied()
            .filter(|&id| self.op_by_id(id).map_or(false, |op| in_frame(op, OpType::Enter)))
            .collect();
        while let Some(id) = stack.pop() {
            if !members.insert(id) {
                continue;
            }
            let op = match self.op_by_id(id) {
                Some(op) => op,
                None => continue,
            };
            if in_frame(op, OpType::Exit) {
                continue;
            }
            for out in &op.outputs {
                stack.extend(self.consumers_of(out).into_iter().filter(|c| relevant.contains(c)));
            }
        }

        let mut carried = Vec::new();
        let mut boundary: HashSet<OpId> = HashSet::new();
        let mut merges: Vec<OpId> = members.iter().copied().collect();
        merges.sort();
        for id in merges {
            let merge = match self.op_by_id(id) {
                Some(op) if op.op_type == OpType::Merge => op,
                _ => continue,
            };
            let enter = match merge.input(0).and_then(|i| self.producer_of(i)) {
                Some(enter) if in_frame(enter, OpType::Enter) => enter,
                _ => continue,
            };
            let next = merge
                .input(1)
                .and_then(|i| self.producer_of(i))
                .filter(|next| in_frame(next, OpType::NextIteration))
                .ok_or_else(|| GraphError::Internal(format!("loop merge '{}' has no back edge", merge.name)))?;
            let out = output(merge, 0)?;
            let switch = self
                .consumers_of(out)
                .into_iter()
                .filter_map(|c| self.op_by_id(c))
                .find(|c| c.op_type == OpType::Switch && c.input(0) == Some(out))
                .ok_or_else(|| GraphError::Internal(format!("loop merge '{}' feeds no switch", merge.name)))?;
            let leaving = output(switch, 0)?;
            let exit = self
                .consumers_of(leaving)
                .into_iter()
                .filter_map(|c| self.op_by_id(c))
                .find(|c| in_frame(c, OpType::Exit))
                .ok_or_else(|| GraphError::Internal(format!("loop switch '{}' has no exit", switch.name)))?;

            boundary.extend([enter.id, merge.id, switch.id, next.id, exit.id]);
            if self.variable(out)?.dtype.is_float() {
                carried.push(Carried {
                    enter: enter.clone(),
                    switch: switch.clone(),
                    next: next.clone(),
                    exit: exit.clone(),
                });
            }
        }

        let mut invariants = Vec::new();
        let mut body = HashSet::new();
        for &id in &members {
            let op = match self.op_by_id(id) {
                Some(op) => op,
                None => continue,
            };
            if op.frame().map_or(false, |f| f != frame) {
                return Err(GraphError::NoGradientRule {
                    op_type: op.op_type.name().to_string(),
                    op: op.name.clone(),
                });
            }
            if in_frame(op, OpType::Enter) {
                if op.args.flag(0) && self.variable(input(op, 0)?)?.dtype.is_float() {
                    invariants.push(op.clone());
                }
            } else if !boundary.contains(&id) && !in_frame(op, OpType::Exit) {
                body.insert(id);
            }
        }
        invariants.sort_by_key(|op| op.id);

        Ok(LoopUnit {
            frame: frame.to_string(),
            members,
            carried,
            invariants,
            body,
        })
    }

    /// Kahn's algorithm over `ops`, loop back edges ignored.
    ///
    /// Ops sharing an anchor in `anchors` form one node, listed under the
    /// anchor's id.
    fn topological_order(&self, ops: &HashSet<OpId>, anchors: &HashMap<OpId, OpId>) -> GraphResult<Vec<OpId>> {
        let node = |id: OpId| anchors.get(&id).copied().unwrap_or(id);
        let mut in_degree: HashMap<OpId, usize> = ops.iter().map(|&id| (node(id), 0)).collect();
        let mut edges: HashSet<(OpId, OpId)> = HashSet::new();
        for &id in ops {
            let op = match self.op_by_id(id) {
                Some(op) => op,
                None => continue,
            };
            for input in &op.inputs {
                let producer = match self.producer_of(input) {
                    Some(p) if ops.contains(&p.id) => p,
                    _ => continue,
                };
                if op.op_type == OpType::Merge && producer.op_type == OpType::NextIteration {
                    continue;
                }
                let (from, to) = (node(producer.id), node(id));
                if from != to && edges.insert((from, to)) {
                    *in_degree.entry(to).or_default() += 1;
                }
            }
        }
        let mut dependents: HashMap<OpId, Vec<OpId>> = HashMap::new();
        for &(from, to) in &edges {
            dependents.entry(from).or_default().push(to);
        }
        dependents.values_mut().for_each(|list| list.sort());

        let mut ready: Vec<OpId> = in_degree.iter().filter(|(_, &d)| d == 0).map(|(&id, _)| id).collect();
        ready.sort();
        let mut queue: VecDeque<OpId> = ready.into();
        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(next) = dependents.get(&id) {
                for &dep in next {
                    if let Some(d) = in_degree.get_mut(&dep) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(dep);
                        }
                    }
                }
            }
        }
        if order.len() != in_degree.len() {
            return Err(GraphError::Internal(
                "forward graph has a cycle outside a loop frame".to_string(),
            ));
        }
        Ok(order)
    }

    /// Give each gradient its `<var><suffix>` name
    fn name_gradients(&mut self, grads: HashMap<String, String>, first_new_seq: u64) -> GraphResult<GradientMap> {
        let suffix = self.config.naming.gradient_suffix.clone();
        let mut map = GradientMap::default();
        let mut claimed: HashSet<String> = HashSet::new();
        let mut wrt: Vec<&String> = grads.keys().collect();
        wrt.sort();
        for w in wrt {
            let grad = &grads[w];
            let target = format!("{}{}", w, suffix);
            let renamable = !claimed.contains(grad)
                && !self.has_variable(&target)
                && self.variable(grad)?.seq >= first_new_seq;
            let name = if renamable {
                self.rename(grad, &target)?;
                target
            } else if claimed.contains(grad) || grad != &target {
                self.named(&target, OpType::Identity, OpArgs::new(), &[grad.as_str()])?
            } else {
                grad.clone()
            };
            claimed.insert(name.clone());
            claimed.insert(grad.clone());
            map.grads.insert(w.clone(), name);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::error::GraphError;
    use crate::graph::SameDiff;
    use crate::ops::OpBuilder;
    use crate::tensor::{DType, NdArray, Shape};

    fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> NdArray {
        let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        NdArray::new(&[rows, cols], DType::F64, data).unwrap()
    }

    fn one_hot(rng: &mut StdRng, rows: usize, cols: usize) -> NdArray {
        let mut data = vec![0.0; rows * cols];
        for r in 0..rows {
            data[r * cols + rng.gen_range(0..cols)] = 1.0;
        }
        NdArray::new(&[rows, cols], DType::F64, data).unwrap()
    }

    fn cross_entropy_graph() -> (SameDiff, String) {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F64, Shape::from_i64(&[-1, 4])).unwrap();
        sd.placeholder("labels", DType::F64, Shape::from_i64(&[-1, 4])).unwrap();
        let sm = sd.softmax("x", 1).unwrap();
        let logs = sd.log(&sm).unwrap();
        let weighted = sd.mul(&logs, "labels").unwrap();
        let total = sd.sum(&weighted, &[], false).unwrap();
        let loss = sd.mul_scalar(&total, -1.0).unwrap();
        (sd, loss)
    }

    #[test]
    fn test_softmax_cross_entropy_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(42);
        let x = random_matrix(&mut rng, 5, 4);
        let labels = one_hot(&mut rng, 5, 4);

        let (mut sd, loss) = cross_entropy_graph();
        let grads = sd.build_gradient_graph(&[&loss], &["x"]).unwrap();
        let grad_name = grads.get("x").unwrap().to_string();
        assert_eq!(grad_name, "x-grad");

        let mut bindings = HashMap::new();
        bindings.insert("x".to_string(), x.clone());
        bindings.insert("labels".to_string(), labels);
        let analytic = sd.execute_one(&grad_name, &bindings).unwrap();
        assert_eq!(analytic.shape(), &[5, 4]);

        let eps = 1e-5;
        let loss_at = |values: Vec<f64>, bindings: &mut HashMap<String, NdArray>| {
            bindings.insert("x".to_string(), NdArray::new(&[5, 4], DType::F64, values).unwrap());
            sd.execute_one(&loss, bindings).unwrap().scalar_value().unwrap()
        };
        for i in 0..20 {
            let mut plus = x.to_vec();
            plus[i] += eps;
            let mut minus = x.to_vec();
            minus[i] -= eps;
            let numeric = (loss_at(plus, &mut bindings) - loss_at(minus, &mut bindings)) / (2.0 * eps);
            assert!(
                (numeric - analytic.data()[i]).abs() < 1e-2,
                "element {}: numeric {} analytic {}",
                i,
                numeric,
                analytic.data()[i]
            );
        }
    }

    #[test]
    fn test_missing_rule_aborts_and_rolls_back() {
        let mut sd = SameDiff::new();
        sd.var("w", NdArray::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap()).unwrap();
        let p = sd.prod("w", &[0], false).unwrap();
        let loss = sd.sum(&p, &[], false).unwrap();
        let ops = sd.num_operations();
        let vars = sd.num_variables();

        let err = sd.build_gradient_graph(&[&loss], &["w"]).unwrap_err();
        assert_eq!(
            err,
            GraphError::NoGradientRule {
                op_type: "reduce_prod".to_string(),
                op: "reduce_prod".to_string(),
            }
        );
        assert_eq!(sd.num_operations(), ops);
        assert_eq!(sd.num_variables(), vars);
    }

    #[test]
    fn test_disconnected_missing_rule_is_ignored() {
        let mut sd = SameDiff::new();
        sd.var("w", NdArray::from_vec(vec![1.0, 2.0], &[2]).unwrap()).unwrap();
        sd.var("v", NdArray::from_vec(vec![3.0, 4.0], &[2]).unwrap()).unwrap();
        let p = sd.prod("v", &[], false).unwrap();
        let s = sd.sum("w", &[], false).unwrap();
        let loss = sd.add(&s, &p).unwrap();

        let grads = sd.build_gradient_graph(&[&loss], &["w"]).unwrap();
        let g = sd.execute_one(grads.get("w").unwrap(), &HashMap::new()).unwrap();
        assert_eq!(g.to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_shared_input_accumulates() {
        let mut sd = SameDiff::new();
        sd.var("w", NdArray::from_vec(vec![3.0], &[1]).unwrap()).unwrap();
        // y = w * w + w, dy/dw = 2w + 1
        let sq = sd.mul("w", "w").unwrap();
        let y = sd.add(&sq, "w").unwrap();
        let loss = sd.sum(&y, &[], false).unwrap();
        sd.set_loss_variables(&[&loss]).unwrap();

        let grads = sd.calculate_gradients(&HashMap::new(), &[]).unwrap();
        assert_eq!(grads["w"].to_vec(), vec![7.0]);
    }

    #[test]
    fn test_gradient_graph_is_cached_until_graph_changes() {
        let mut sd = SameDiff::new();
        sd.var("w", NdArray::from_vec(vec![2.0], &[1]).unwrap()).unwrap();
        let loss = sd.square("w").unwrap();
        sd.set_loss_variables(&[&loss]).unwrap();

        sd.calculate_gradients(&HashMap::new(), &[]).unwrap();
        let ops = sd.num_operations();
        let grads = sd.calculate_gradients(&HashMap::new(), &[]).unwrap();
        assert_eq!(sd.num_operations(), ops);
        assert_eq!(grads["w"].to_vec(), vec![4.0]);
    }

    #[test]
    fn test_gradient_through_conditional() {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F64, Shape::scalar()).unwrap();
        sd.constant("zero", NdArray::scalar(0.0, DType::F64)).unwrap();
        let out = sd
            .if_cond(
                None,
                |g| g.gt("x", "zero"),
                |b| b.square("x"),
                |b| b.mul_scalar("x", 3.0),
            )
            .unwrap();
        let grads = sd.build_gradient_graph(&[&out], &["x"]).unwrap();
        let g = grads.get("x").unwrap().to_string();

        let mut bindings = HashMap::new();
        bindings.insert("x".to_string(), NdArray::scalar(2.0, DType::F64));
        assert_eq!(sd.execute_one(&g, &bindings).unwrap().scalar_value(), Some(4.0));
        bindings.insert("x".to_string(), NdArray::scalar(-1.0, DType::F64));
        assert_eq!(sd.execute_one(&g, &bindings).unwrap().scalar_value(), Some(3.0));
    }

    #[test]
    fn test_second_order_gradient() {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F64, Shape::scalar()).unwrap();
        let cube = sd.pow_scalar("x", 3.0).unwrap();
        let first = sd.build_gradient_graph(&[&cube], &["x"]).unwrap();
        let dx = first.get("x").unwrap().to_string();
        let mut config = sd.config().clone();
        config.naming.gradient_suffix = "-grad2".to_string();
        sd.set_config(config).unwrap();
        let second = sd.build_gradient_graph(&[&dx], &["x"]).unwrap();

        let mut bindings = HashMap::new();
        bindings.insert("x".to_string(), NdArray::scalar(2.0, DType::F64));
        let out = sd.execute(&[&dx, second.get("x").unwrap()], &bindings).unwrap();
        assert_eq!(out[&dx].scalar_value(), Some(12.0));
        assert_eq!(out[second.get("x").unwrap()].scalar_value(), Some(12.0));
    }

    fn tripled_in_loop(sd: &mut SameDiff) -> String {
        sd.placeholder("x", DType::F64, Shape::scalar()).unwrap();
        sd.placeholder("n", DType::F64, Shape::scalar()).unwrap();
        sd.placeholder("w", DType::F64, Shape::scalar()).unwrap();
        sd.constant("i0", NdArray::scalar(0.0, DType::F64)).unwrap();
        let outs = sd
            .while_loop(
                None,
                &["i0", "x"],
                |b, v| b.lt(&v[0], "n"),
                |b, v| Ok(vec![b.add_scalar(&v[0], 1.0)?, b.mul(&v[1], "w")?]),
            )
            .unwrap();
        outs[1].clone()
    }

    #[test]
    fn test_gradient_through_while_loop() {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F64, Shape::scalar()).unwrap();
        sd.constant("i0", NdArray::scalar(0.0, DType::F64)).unwrap();
        sd.constant("three", NdArray::scalar(3.0, DType::F64)).unwrap();
        let outs = sd
            .while_loop(
                None,
                &["i0", "x"],
                |b, v| b.lt(&v[0], "three"),
                |b, v| Ok(vec![b.add_scalar(&v[0], 1.0)?, b.mul_scalar(&v[1], 3.0)?]),
            )
            .unwrap();
        let grads = sd.build_gradient_graph(&[&outs[1]], &["x"]).unwrap();
        assert_eq!(grads.get("x"), Some("x-grad"));

        let mut bindings = HashMap::new();
        bindings.insert("x".to_string(), NdArray::scalar(2.0, DType::F64));
        assert_eq!(sd.execute_one(&outs[1], &bindings).unwrap().scalar_value(), Some(54.0));
        assert_eq!(sd.execute_one("x-grad", &bindings).unwrap().scalar_value(), Some(27.0));
    }

    #[test]
    fn test_loop_invariant_gradient_accumulates() {
        let mut sd = SameDiff::new();
        let out = tripled_in_loop(&mut sd);
        let grads = sd.build_gradient_graph(&[&out], &["x", "w"]).unwrap();
        let (gx, gw) = (grads.get("x").unwrap().to_string(), grads.get("w").unwrap().to_string());

        // out = x * w^3, d/dx = w^3, d/dw = 3 x w^2
        let mut bindings = HashMap::new();
        bindings.insert("x".to_string(), NdArray::scalar(2.0, DType::F64));
        bindings.insert("w".to_string(), NdArray::scalar(3.0, DType::F64));
        bindings.insert("n".to_string(), NdArray::scalar(3.0, DType::F64));
        let values = sd.execute(&[&out, &gx, &gw], &bindings).unwrap();
        assert_eq!(values[&out].scalar_value(), Some(54.0));
        assert_eq!(values[&gx].scalar_value(), Some(27.0));
        assert_eq!(values[&gw].scalar_value(), Some(54.0));
    }

    #[test]
    fn test_gradient_of_loop_that_never_runs() {
        let mut sd = SameDiff::new();
        let out = tripled_in_loop(&mut sd);
        let grads = sd.build_gradient_graph(&[&out], &["x", "w"]).unwrap();

        let mut bindings = HashMap::new();
        bindings.insert("x".to_string(), NdArray::scalar(2.0, DType::F64));
        bindings.insert("w".to_string(), NdArray::scalar(3.0, DType::F64));
        bindings.insert("n".to_string(), NdArray::scalar(0.0, DType::F64));
        let values = sd.execute(&[grads.get("x").unwrap(), grads.get("w").unwrap()], &bindings).unwrap();
        assert_eq!(values[grads.get("x").unwrap()].scalar_value(), Some(1.0));
        assert_eq!(values[grads.get("w").unwrap()].scalar_value(), Some(0.0));

        // Same gradient graph, different trip count
        bindings.insert("n".to_string(), NdArray::scalar(2.0, DType::F64));
        let values = sd.execute(&[grads.get("x").unwrap(), grads.get("w").unwrap()], &bindings).unwrap();
        assert_eq!(values[grads.get("x").unwrap()].scalar_value(), Some(9.0));
        assert_eq!(values[grads.get("w").unwrap()].scalar_value(), Some(12.0));
    }

    #[test]
    fn test_tanh_loop_matches_finite_differences() {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F64, Shape::known(&[3])).unwrap();
        sd.placeholder("w", DType::F64, Shape::known(&[3])).unwrap();
        sd.constant("i0", NdArray::scalar(0.0, DType::F64)).unwrap();
        sd.constant("steps", NdArray::scalar(3.0, DType::F64)).unwrap();
        let outs = sd
            .while_loop(
                None,
                &["i0", "x"],
                |b, v| b.lt(&v[0], "steps"),
                |b, v| {
                    let scaled = b.mul(&v[1], "w")?;
                    Ok(vec![b.add_scalar(&v[0], 1.0)?, b.tanh(&scaled)?])
                },
            )
            .unwrap();
        let loss = sd.sum(&outs[1], &[], false).unwrap();
        let grads = sd.build_gradient_graph(&[&loss], &["x", "w"]).unwrap();

        let x = vec![0.3, -0.7, 1.1];
        let w = vec![0.9, 1.4, -0.5];
        let bind = |x: &[f64], w: &[f64]| {
            let mut bindings = HashMap::new();
            bindings.insert("x".to_string(), NdArray::new(&[3], DType::F64, x.to_vec()).unwrap());
            bindings.insert("w".to_string(), NdArray::new(&[3], DType::F64, w.to_vec()).unwrap());
            bindings
        };
        let analytic = sd
            .execute(&[grads.get("x").unwrap(), grads.get("w").unwrap()], &bind(&x, &w))
            .unwrap();

        let eps = 1e-6;
        for i in 0..3 {
            let (mut xp, mut xm) = (x.clone(), x.clone());
            xp[i] += eps;
            xm[i] -= eps;
            let numeric = (sd.execute_one(&loss, &bind(&xp, &w)).unwrap().scalar_value().unwrap()
                - sd.execute_one(&loss, &bind(&xm, &w)).unwrap().scalar_value().unwrap())
                / (2.0 * eps);
            assert!((numeric - analytic[grads.get("x").unwrap()].data()[i]).abs() < 1e-5);

            let (mut wp, mut wm) = (w.clone(), w.clone());
            wp[i] += eps;
            wm[i] -= eps;
            let numeric = (sd.execute_one(&loss, &bind(&x, &wp)).unwrap().scalar_value().unwrap()
                - sd.execute_one(&loss, &bind(&x, &wm)).unwrap().scalar_value().unwrap())
                / (2.0 * eps);
            assert!((numeric - analytic[grads.get("w").unwrap()].data()[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_nested_loop_gradient_is_refused() {
        let mut sd = SameDiff::new();
        sd.placeholder("x", DType::F64, Shape::scalar()).unwrap();
        sd.constant("i0", NdArray::scalar(0.0, DType::F64)).unwrap();
        sd.constant("two", NdArray::scalar(2.0, DType::F64)).unwrap();
        let outs = sd
            .while_loop(
                None,
                &["i0", "x"],
                |b, v| b.lt(&v[0], "two"),
                |b, v| {
                    let inner = b.while_loop(
                        None,
                        &["i0", v[1].as_str()],
                        |c, u| c.lt(&u[0], "two"),
                        |c, u| Ok(vec![c.add_scalar(&u[0], 1.0)?, c.mul_scalar(&u[1], 2.0)?]),
                    )?;
                    Ok(vec![b.add_scalar(&v[0], 1.0)?, inner[1].clone()])
                },
            )
            .unwrap();
        let ops = sd.num_operations();
        let vars = sd.num_variables();

        let err = sd.build_gradient_graph(&[&outs[1]], &["x"]).unwrap_err();
        assert!(matches!(err, GraphError::NoGradientRule { .. }));
        assert_eq!(sd.num_operations(), ops);
        assert_eq!(sd.num_variables(), vars);
    }
}
