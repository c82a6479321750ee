//! Variable and operation tables

use std::collections::HashSet;

use tracing::debug;

use crate::error::{GraphError, GraphResult};
use crate::tensor::{DType, NdArray, Shape};
use super::{OpId, OpRecord, SameDiff, Variable, VariableKind};

/// Registry position that a failed construction step can roll back to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub(crate) ops_len: usize,
    pub(crate) var_seq: u64,
}

impl SameDiff {
    /// Declare a placeholder, constant or trainable variable.
    ///
    /// Constants and trainable variables take their shape from `value`; a
    /// placeholder's value, when given, is used as its default binding.
    pub fn declare_variable(
        &mut self,
        name: Option<&str>,
        kind: VariableKind,
        shape: Shape,
        dtype: DType,
        value: Option<NdArray>,
    ) -> GraphResult<String> {
        let name = match name {
            Some(n) => {
                let full = self.scoped_name(n);
                if self.variables.contains_key(&full) {
                    return Err(GraphError::name_collision(&full));
                }
                full
            }
            None => self.generate_var_name(kind.base_name()),
        };

        let shape = match kind {
            VariableKind::Array => {
                return Err(GraphError::InvalidArgument(format!(
                    "'{}': array variables are created by operations",
                    name
                )))
            }
            VariableKind::Constant | VariableKind::Variable => {
                let value = value.as_ref().ok_or_else(|| {
                    GraphError::InvalidArgument(format!("'{}' requires a value", name))
                })?;
                if !shape.is_compatible_with(value.shape()) {
                    return Err(GraphError::ShapeMismatchAtRuntime {
                        name,
                        expected: shape.to_string(),
                        actual: format!("{:?}", value.shape()),
                    });
                }
                Shape::known(value.shape())
            }
            VariableKind::Placeholder => {
                if let Some(default) = &value {
                    if !shape.is_compatible_with(default.shape()) {
                        return Err(GraphError::ShapeMismatchAtRuntime {
                            name,
                            expected: shape.to_string(),
                            actual: format!("{:?}", default.shape()),
                        });
                    }
                }
                shape
            }
        };
        if let Some(v) = &value {
            if v.dtype() != dtype {
                return Err(GraphError::type_mismatch(
                    &name,
                    format!("value has dtype {}, declared {}", v.dtype(), dtype),
                ));
            }
        }

        debug!(variable = %name, kind = ?kind, shape = %shape, "Declared variable");
        self.insert_variable(name.clone(), kind, shape, dtype, value, None);
        self.version += 1;
        Ok(name)
    }

    pub(crate) fn insert_variable(
        &mut self,
        name: String,
        kind: VariableKind,
        shape: Shape,
        dtype: DType,
        value: Option<NdArray>,
        producer: Option<OpId>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let scope = self.current_scope();
        self.var_order.push(name.clone());
        self.variables.insert(
            name.clone(),
            Variable {
                name,
                kind,
                shape,
                dtype,
                value,
                producer,
                scope,
                seq,
            },
        );
    }

    fn remove_variable_entry(&mut self, name: &str) {
        if self.variables.remove(name).is_some() {
            self.var_order.retain(|n| n != name);
            self.loss_variables.retain(|n| n != name);
        }
    }

    /// Rename a variable and every reference to it
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> GraphResult<()> {
        if !self.variables.contains_key(old_name) {
            return Err(GraphError::UnknownVariable(old_name.to_string()));
        }
        if old_name == new_name {
            return Ok(());
        }
        if self.variables.contains_key(new_name) {
            return Err(GraphError::name_collision(new_name));
        }

        if let Some(mut var) = self.variables.remove(old_name) {
            var.name = new_name.to_string();
            self.variables.insert(new_name.to_string(), var);
        }
        let replace = |names: &mut Vec<String>| {
            for n in names.iter_mut().filter(|n| n.as_str() == old_name) {
                *n = new_name.to_string();
            }
        };
        replace(&mut self.var_order);
        replace(&mut self.loss_variables);
        for op in self.ops.iter_mut().flatten() {
            replace(&mut op.inputs);
            replace(&mut op.outputs);
            replace(&mut op.control_deps);
        }

        debug!(from = %old_name, to = %new_name, "Renamed variable");
        self.version += 1;
        Ok(())
    }

    /// Remove an operation and its outputs.
    ///
    /// Outputs still consumed by another operation would be left without a
    /// producer, so that case is refused.
    pub fn remove_operation(&mut self, name: &str) -> GraphResult<()> {
        let id = *self
            .op_index
            .get(name)
            .ok_or_else(|| GraphError::UnknownOperation(name.to_string()))?;
        let outputs = self.op_by_id(id).map(|op| op.outputs.clone()).unwrap_or_default();
        for output in &outputs {
            if let Some(consumer) = self.consumers_of(output).into_iter().find(|&c| c != id) {
                let consumer = self.op_by_id(consumer).map(|op| op.name.clone()).unwrap_or_default();
                return Err(GraphError::InvalidArgument(format!(
                    "cannot remove '{}': output '{}' is consumed by '{}'",
                    name, output, consumer
                )));
            }
        }

        self.ops[id.0] = None;
        self.op_index.remove(name);
        for output in &outputs {
            self.remove_variable_entry(output);
        }
        debug!(op = %name, "Removed operation");
        self.version += 1;
        Ok(())
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            ops_len: self.ops.len(),
            var_seq: self.next_seq,
        }
    }

    /// Drop every operation and variable created after `checkpoint`
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        let removed_ops: Vec<OpRecord> = self
            .ops
            .drain(checkpoint.ops_len.min(self.ops.len())..)
            .flatten()
            .collect();
        for op in &removed_ops {
            self.op_index.remove(&op.name);
        }
        let removed_vars: Vec<String> = self
            .var_order
            .iter()
            .filter(|n| {
                self.variables
                    .get(n.as_str())
                    .map_or(false, |v| v.seq >= checkpoint.var_seq)
            })
            .cloned()
            .collect();
        for name in &removed_vars {
            self.remove_variable_entry(name);
        }
        debug!(
            operations = removed_ops.len(),
            variables = removed_vars.len(),
            "Rolled back graph construction"
        );
        self.version += 1;
    }

    /// Replace one input slot of an existing operation.
    ///
    /// This is the only mutation of an already-created input list; loop
    /// lowering uses it to close a merge's back edge.
    pub fn replace_input(&mut self, op_name: &str, index: usize, new_input: &str) -> GraphResult<()> {
        let id = *self
            .op_index
            .get(op_name)
            .ok_or_else(|| GraphError::UnknownOperation(op_name.to_string()))?;
        let new_dtype = self
            .variables
            .get(new_input)
            .ok_or_else(|| GraphError::missing_input(op_name, new_input))?
            .dtype;
        let op = self.ops[id.0]
            .as_mut()
            .ok_or_else(|| GraphError::UnknownOperation(op_name.to_string()))?;
        let old = op.inputs.get(index).cloned().ok_or_else(|| {
            GraphError::InvalidArgument(format!("'{}' has no input {}", op_name, index))
        })?;
        let old_dtype = self.variables.get(&old).map(|v| v.dtype);
        if old_dtype.map_or(false, |d| d != new_dtype) {
            return Err(GraphError::type_mismatch(
                op_name,
                format!("input {} has dtype {:?}, replacement '{}' has {}", index, old_dtype, new_input, new_dtype),
            ));
        }
        op.inputs[index] = new_input.to_string();
        debug!(op = %op_name, index, input = %new_input, "Replaced operation input");
        self.version += 1;
        Ok(())
    }

    /// Require `variable` to be computed before `op_name` runs
    pub fn add_control_dependency(&mut self, op_name: &str, variable: &str) -> GraphResult<()> {
        if !self.variables.contains_key(variable) {
            return Err(GraphError::UnknownVariable(variable.to_string()));
        }
        let id = *self
            .op_index
            .get(op_name)
            .ok_or_else(|| GraphError::UnknownOperation(op_name.to_string()))?;
        if let Some(op) = self.ops[id.0].as_mut() {
            if !op.control_deps.iter().any(|d| d == variable) {
                op.control_deps.push(variable.to_string());
                self.version += 1;
            }
        }
        Ok(())
    }

    pub fn variable(&self, name: &str) -> GraphResult<&Variable> {
        self.variables
            .get(name)
            .ok_or_else(|| GraphError::UnknownVariable(name.to_string()))
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn operation(&self, name: &str) -> GraphResult<&OpRecord> {
        self.op_index
            .get(name)
            .and_then(|&id| self.op_by_id(id))
            .ok_or_else(|| GraphError::UnknownOperation(name.to_string()))
    }

    pub fn has_operation(&self, name: &str) -> bool {
        self.op_index.contains_key(name)
    }

    pub fn op_by_id(&self, id: OpId) -> Option<&OpRecord> {
        self.ops.get(id.0).and_then(|op| op.as_ref())
    }

    /// Operation producing `variable`, if any
    pub fn producer_of(&self, variable: &str) -> Option<&OpRecord> {
        self.variables
            .get(variable)
            .and_then(|v| v.producer)
            .and_then(|id| self.op_by_id(id))
    }

    /// Variables in insertion order
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.var_order.iter().filter_map(move |n| self.variables.get(n))
    }

    /// Operations in creation order
    pub fn operations(&self) -> impl Iterator<Item = &OpRecord> {
        self.ops.iter().flatten()
    }

    /// Variables whose name lies under `prefix`, insertion order preserved
    pub fn variables_in_scope(&self, prefix: &str) -> Vec<&Variable> {
        let prefix = prefix.trim_end_matches('/');
        self.variables().filter(|v| in_scope(&v.name, prefix)).collect()
    }

    pub fn ops_in_scope(&self, prefix: &str) -> Vec<&OpRecord> {
        let prefix = prefix.trim_end_matches('/');
        self.operations().filter(|op| in_scope(&op.name, prefix)).collect()
    }

    /// Operations reading `variable` as data input or control dependency
    pub fn consumers_of(&self, variable: &str) -> Vec<OpId> {
        self.operations()
            .filter(|op| {
                op.inputs.iter().any(|i| i == variable) || op.control_deps.iter().any(|d| d == variable)
            })
            .map(|op| op.id)
            .collect()
    }

    /// Whether any input chain of `inputs` reaches operation `target`
    pub(crate) fn depends_on(&self, inputs: &[String], target: OpId) -> bool {
        let mut stack: Vec<&str> = inputs.iter().map(|s| s.as_str()).collect();
        let mut visited = HashSet::new();
        while let Some(name) = stack.pop() {
            if !visited.insert(name) {
                continue;
            }
            if let Some(op) = self.producer_of(name) {
                if op.id == target {
                    return true;
                }
                stack.extend(op.inputs.iter().map(|s| s.as_str()));
                stack.extend(op.control_deps.iter().map(|s| s.as_str()));
            }
        }
        false
    }

    /// Reassign the value of a trainable variable or constant
    pub fn set_variable_value(&mut self, name: &str, value: NdArray) -> GraphResult<()> {
        let var = self
            .variables
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownVariable(name.to_string()))?;
        match var.kind {
            VariableKind::Variable | VariableKind::Constant => {}
            kind => {
                return Err(GraphError::InvalidArgument(format!(
                    "'{}' is a {:?} and holds no persistent value",
                    name, kind
                )))
            }
        }
        check_value(var, &value)?;
        var.value = Some(value);
        self.value_version += 1;
        Ok(())
    }

    /// Attach or clear the default binding of a placeholder
    pub fn set_placeholder_default(&mut self, name: &str, value: Option<NdArray>) -> GraphResult<()> {
        let var = self
            .variables
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownVariable(name.to_string()))?;
        if var.kind != VariableKind::Placeholder {
            return Err(GraphError::InvalidArgument(format!("'{}' is not a placeholder", name)));
        }
        if let Some(v) = &value {
            check_value(var, v)?;
        }
        var.value = value;
        self.value_version += 1;
        Ok(())
    }

    pub fn variable_value(&self, name: &str) -> GraphResult<Option<&NdArray>> {
        Ok(self.variable(name)?.value.as_ref())
    }

    /// Variables minimized by `fit` and differentiated by `calculate_gradients`
    pub fn set_loss_variables(&mut self, names: &[&str]) -> GraphResult<()> {
        for name in names {
            self.variable(name)?;
        }
        self.loss_variables = names.iter().map(|n| n.to_string()).collect();
        Ok(())
    }

    pub fn loss_variables(&self) -> &[String] {
        &self.loss_variables
    }
}

fn in_scope(name: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || name == prefix
        || (name.len() > prefix.len() && name.starts_with(prefix) && name.as_bytes()[prefix.len()] == b'/')
}

fn check_value(var: &Variable, value: &NdArray) -> GraphResult<()> {
    if value.dtype() != var.dtype {
        return Err(GraphError::type_mismatch(
            &var.name,
            format!("value has dtype {}, variable is {}", value.dtype(), var.dtype),
        ));
    }
    if !var.shape.is_compatible_with(value.shape()) {
        return Err(GraphError::ShapeMismatchAtRuntime {
            name: var.name.clone(),
            expected: var.shape.to_string(),
            actual: format!("{:?}", value.shape()),
        });
    }
    Ok(())
}
