//! Generic operation creation with update-and-replace

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};
use crate::ops::{infer_outputs, OpType};
use crate::tensor::{DType, Shape};
use super::scope::output_names;
use super::{OpArgs, OpId, OpRecord, SameDiff, Variable, VariableKind};

impl SameDiff {
    /// Register one operation and its output variables.
    ///
    /// Inputs are validated against the op type's constraints and the
    /// outputs' shapes and dtypes are inferred before anything is mutated,
    /// so a failing call leaves the registry untouched. When `name` is given
    /// and already names an operation (or its output variables), that
    /// operation is replaced and its outputs are rebound to the new one,
    /// keeping downstream edges intact. Everything downstream is inferred
    /// again; if some consumer rejects the new outputs the replacement fails
    /// and nothing changes.
    pub fn declare_operation(
        &mut self,
        name: Option<&str>,
        op_type: OpType,
        args: OpArgs,
        inputs: &[String],
    ) -> GraphResult<Vec<String>> {
        let descriptor = op_type.descriptor();
        let display = name.map(|n| self.scoped_name(n)).unwrap_or_else(|| descriptor.name.to_string());

        let mut input_vars = Vec::with_capacity(inputs.len());
        for input in inputs {
            let var = self
                .variables
                .get(input)
                .ok_or_else(|| GraphError::missing_input(&display, input))?;
            input_vars.push(var);
        }
        let outputs = infer_outputs(&display, op_type, &args, &input_vars)?;

        let (op_name, replaced) = match name {
            Some(n) => {
                let full = self.scoped_name(n);
                let names = output_names(&full, outputs.len());
                let replaced = self.find_replacement(&full, &names)?;
                (full, replaced)
            }
            None => (self.generate_op_name(descriptor.name, outputs.len()), None),
        };
        let output_names = output_names(&op_name, outputs.len());

        let id = match replaced {
            Some(id) => {
                if self.depends_on(inputs, id) {
                    return Err(GraphError::InvalidArgument(format!(
                        "replacing '{}' would make it consume its own output",
                        op_name
                    )));
                }
                let refreshed = self.infer_downstream(&output_names, &outputs)?;
                self.detach_replaced(id, &output_names)?;
                for (name, (shape, dtype)) in refreshed {
                    if let Some(var) = self.variables.get_mut(&name) {
                        var.shape = shape;
                        var.dtype = dtype;
                    }
                }
                warn!(op = %op_name, op_type = %descriptor.name, "Replacing existing operation");
                id
            }
            None => {
                self.ops.push(None);
                OpId(self.ops.len() - 1)
            }
        };

        for (out_name, (shape, dtype)) in output_names.iter().zip(outputs) {
            match self.variables.get_mut(out_name) {
                Some(var) => {
                    var.shape = shape;
                    var.dtype = dtype;
                    var.value = None;
                    var.producer = Some(id);
                }
                None => {
                    self.insert_variable(out_name.clone(), VariableKind::Array, shape, dtype, None, Some(id));
                }
            }
        }

        self.ops[id.0] = Some(OpRecord {
            id,
            name: op_name.clone(),
            op_type,
            inputs: inputs.to_vec(),
            outputs: output_names.clone(),
            args,
            control_deps: Vec::new(),
            scope: self.current_scope(),
        });
        self.op_index.insert(op_name.clone(), id);
        self.version += 1;

        debug!(op = %op_name, op_type = %descriptor.name, inputs = ?inputs, "Created operation");
        Ok(output_names)
    }

    /// Operation an explicitly named call would replace, if any
    fn find_replacement(&self, op_name: &str, outputs: &[String]) -> GraphResult<Option<OpId>> {
        let mut candidate = self.op_index.get(op_name).copied();
        for out in outputs {
            let var = match self.variables.get(out) {
                Some(var) => var,
                None => continue,
            };
            match (var.kind, var.producer) {
                (VariableKind::Array, Some(producer)) => match candidate {
                    Some(existing) if existing != producer => {
                        return Err(GraphError::name_collision(out));
                    }
                    _ => candidate = Some(producer),
                },
                _ => return Err(GraphError::name_collision(out)),
            }
        }
        if let Some(id) = candidate {
            if let Some(existing) = self.op_index.get(op_name) {
                if *existing != id {
                    return Err(GraphError::name_collision(op_name));
                }
            }
        }
        Ok(candidate)
    }

    /// Shapes and dtypes of the variables downstream of `outputs` once those
    /// take `inferred`; only variables whose inference changes are returned.
    ///
    /// Consumers are visited in id order, each once, so loop back edges are
    /// not followed around a second time.
    fn infer_downstream(
        &self,
        outputs: &[String],
        inferred: &[(Shape, DType)],
    ) -> GraphResult<HashMap<String, (Shape, DType)>> {
        let mut changed: HashMap<String, (Shape, DType)> =
            outputs.iter().cloned().zip(inferred.iter().cloned()).collect();
        let mut queue: BTreeSet<OpId> = outputs.iter().flat_map(|o| self.consumers_of(o)).collect();
        let mut visited: HashSet<OpId> = HashSet::new();

        while let Some(id) = queue.pop_first() {
            if !visited.insert(id) {
                continue;
            }
            let op = match self.op_by_id(id) {
                Some(op) => op,
                None => continue,
            };
            let mut inputs: Vec<Variable> = Vec::with_capacity(op.inputs.len());
            for name in &op.inputs {
                let mut var = self.variable(name)?.clone();
                if let Some((shape, dtype)) = changed.get(name) {
                    var.shape = shape.clone();
                    var.dtype = *dtype;
                }
                inputs.push(var);
            }
            let refs: Vec<&Variable> = inputs.iter().collect();
            let results = infer_outputs(&op.name, op.op_type, &op.args, &refs)?;
            for (out, (shape, dtype)) in op.outputs.iter().zip(results) {
                let current = self.variable(out)?;
                if current.shape != shape || current.dtype != dtype {
                    changed.insert(out.clone(), (shape, dtype));
                    queue.extend(self.consumers_of(out));
                }
            }
        }

        for out in outputs {
            changed.remove(out);
        }
        if !changed.is_empty() {
            debug!(variables = changed.len(), "Re-inferred downstream of replacement");
        }
        Ok(changed)
    }

    /// Unregister a replaced operation, dropping outputs the new one won't produce
    fn detach_replaced(&mut self, id: OpId, new_outputs: &[String]) -> GraphResult<()> {
        let old = self.ops[id.0]
            .as_ref()
            .ok_or_else(|| GraphError::Internal(format!("operation {} vanished", id)))?;
        let dropped: Vec<String> = old
            .outputs
            .iter()
            .filter(|o| !new_outputs.contains(o))
            .cloned()
            .collect();
        for out in &dropped {
            if self.consumers_of(out).iter().any(|&c| c != id) {
                return Err(GraphError::InvalidArgument(format!(
                    "replacement of '{}' drops output '{}' that is still consumed",
                    old.name, out
                )));
            }
        }
        let old_name = old.name.clone();
        self.op_index.remove(&old_name);
        self.ops[id.0] = None;
        for out in dropped {
            self.variables.remove(&out);
            self.var_order.retain(|n| n != &out);
        }
        Ok(())
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
        sd.placeholder("x", DType::F32, Shape::from_i64(&[-1, 4])).unwrap();
        sd.constant("b", NdArray::ones(&[4], DType::F32)).unwrap();
        sd
    }

    #[test]
    fn test_output_shape_inferred() {
        let mut sd = graph();
        let y = sd.add("x", "b").unwrap();
        let var = sd.variable(&y).unwrap();
        assert_eq!(var.shape(), &Shape::from_i64(&[-1, 4]));
        assert_eq!(var.dtype(), DType::F32);
    }

    #[test]
    fn test_missing_input_leaves_graph_unchanged() {
        let mut sd = graph();
        let version = sd.version();
        let err = sd.add("x", "nope").unwrap_err();
        assert!(matches!(err, GraphError::MissingInput { .. }));
        assert_eq!(sd.version(), version);
        assert_eq!(sd.num_operations(), 0);
    }

    #[test]
    fn test_idempotent_rebuild() {
        let mut sd = graph();
        let first = sd.add_op(Some("y"), OpType::Add, OpArgs::new(), &["x", "b"]).unwrap();
        let downstream = sd.tanh(&first[0]).unwrap();
        let ops_before = sd.num_operations();
        let vars_before = sd.num_variables();

        let second = sd.add_op(Some("y"), OpType::Add, OpArgs::new(), &["x", "b"]).unwrap();
        assert_eq!(first, second);
        assert_eq!(sd.num_operations(), ops_before);
        assert_eq!(sd.num_variables(), vars_before);
        assert_eq!(sd.operations().filter(|op| op.name() == "y").count(), 1);

        let consumer = sd.producer_of(&downstream).unwrap();
        assert_eq!(consumer.inputs(), &["y".to_string()]);
        let producer = sd.producer_of("y").unwrap();
        assert_eq!(producer.name(), "y");
        assert_eq!(sd.variable("y").unwrap().producer(), Some(producer.id()));
    }

    #[test]
    fn test_replace_with_different_op() {
        let mut sd = graph();
        sd.add_op(Some("y"), OpType::Add, OpArgs::new(), &["x", "b"]).unwrap();
        let z = sd.relu("y").unwrap();
        sd.add_op(Some("y"), OpType::Mul, OpArgs::new(), &["x", "b"]).unwrap();
        assert_eq!(sd.operation("y").unwrap().op_type(), OpType::Mul);
        assert_eq!(sd.producer_of(&z).unwrap().inputs(), &["y".to_string()]);
    }

    #[test]
    fn test_replace_refuses_self_cycle() {
        let mut sd = graph();
        sd.add_op(Some("y"), OpType::Add, OpArgs::new(), &["x", "b"]).unwrap();
        let z = sd.relu("y").unwrap();
        let err = sd.add_op(Some("y"), OpType::Add, OpArgs::new(), &[z.as_str(), "b"]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
        assert_eq!(sd.operation("y").unwrap().inputs(), &["x".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_explicit_name_colliding_with_placeholder() {
        let mut sd = graph();
        let err = sd.add_op(Some("x"), OpType::Add, OpArgs::new(), &["x", "b"]).unwrap_err();
        assert_eq!(err, GraphError::name_collision("x"));
    }

    #[test]
    fn test_multi_output_names() {
        let mut sd = graph();
        let pred = sd.constant("p", NdArray::scalar(1.0, DType::Bool)).unwrap();
        let outs = sd.add_op(Some("sw"), OpType::Switch, OpArgs::new(), &["x", pred.as_str()]).unwrap();
        assert_eq!(outs, vec!["sw_0".to_string(), "sw_1".to_string()]);
    }

    #[test]
    fn test_replace_reinfers_downstream() {
        let mut sd = graph();
        sd.add_op(Some("y"), OpType::Identity, OpArgs::new(), &["x"]).unwrap();
        let z = sd.tanh("y").unwrap();
        let total = sd.sum(&z, &[], false).unwrap();
        assert_eq!(sd.variable(&z).unwrap().dtype(), DType::F32);

        sd.add_op(Some("y"), OpType::Cast, OpArgs::new().with_dtype(DType::F64), &["x"]).unwrap();
        assert_eq!(sd.variable("y").unwrap().dtype(), DType::F64);
        assert_eq!(sd.variable(&z).unwrap().dtype(), DType::F64);
        assert_eq!(sd.variable(&total).unwrap().dtype(), DType::F64);

        let mut bindings = std::collections::HashMap::new();
        bindings.insert("x".to_string(), NdArray::ones(&[2, 4], DType::F32));
        assert_eq!(sd.execute_one(&z, &bindings).unwrap().dtype(), DType::F64);
    }

    #[test]
    fn test_replace_rejected_by_consumer_leaves_graph_unchanged() {
        let mut sd = graph();
        sd.placeholder("mask", DType::Bool, Shape::known(&[4])).unwrap();
        sd.add_op(Some("y"), OpType::Identity, OpArgs::new(), &["mask"]).unwrap();
        let both = sd.and("y", "mask").unwrap();
        let consumer = sd.producer_of(&both).unwrap().name().to_string();
        let version = sd.version();

        let err = sd
            .add_op(Some("y"), OpType::Cast, OpArgs::new().with_dtype(DType::F32), &["mask"])
            .unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { ref op, .. } if *op == consumer));
        assert_eq!(sd.version(), version);
        assert_eq!(sd.operation("y").unwrap().op_type(), OpType::Identity);
        assert_eq!(sd.variable("y").unwrap().dtype(), DType::Bool);
        assert_eq!(sd.variable(&both).unwrap().dtype(), DType::Bool);
    }
}
