//! The graph registry and builder façade
//!
//! `SameDiff` owns every variable and operation of one computation graph.
//! Operations live in an index-addressed arena so loop lowering can
//! back-patch an input slot without touching any other record. Names are
//! the public handles: clients refer to variables by name, and `rename`
//! keeps every reference consistent.

pub mod variable;
pub mod op;
mod registry;
mod scope;
mod builder;

pub use variable::{Variable, VariableKind};
pub use op::{OpArgs, OpId, OpRecord};
pub use registry::Checkpoint;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::autodiff::GradientMap;
use crate::config::{self, EngineConfig};
use crate::error::GraphResult;
use crate::exec::{CpuExecutor, InferenceSession, OpExecutor};

/// An automatic-differentiation computation graph
pub struct SameDiff {
    pub(crate) variables: HashMap<String, Variable>,
    pub(crate) var_order: Vec<String>,
    pub(crate) ops: Vec<Option<OpRecord>>,
    pub(crate) op_index: HashMap<String, OpId>,
    pub(crate) name_counters: HashMap<String, usize>,
    pub(crate) scopes: Vec<String>,
    pub(crate) loss_variables: Vec<String>,
    pub(crate) next_seq: u64,
    /// Bumped by every structural mutation
    pub(crate) version: u64,
    /// Bumped whenever a persistent value is reassigned
    pub(crate) value_version: u64,
    pub(crate) config: EngineConfig,
    pub(crate) executor: Arc<dyn OpExecutor>,
    pub(crate) session: Mutex<InferenceSession>,
    pub(crate) gradient_cache: Option<(u64, Vec<String>, Vec<String>, GradientMap)>,
}

impl SameDiff {
    /// Empty graph using the process-wide configuration
    pub fn new() -> Self {
        Self::with_config(config::get_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            variables: HashMap::new(),
            var_order: Vec::new(),
            ops: Vec::new(),
            op_index: HashMap::new(),
            name_counters: HashMap::new(),
            scopes: Vec::new(),
            loss_variables: Vec::new(),
            next_seq: 0,
            version: 0,
            value_version: 0,
            config,
            executor: Arc::new(CpuExecutor::new()),
            session: Mutex::new(InferenceSession::new()),
            gradient_cache: None,
        }
    }

    /// Replace the op executor used by `execute`
    pub fn with_executor(mut self, executor: Arc<dyn OpExecutor>) -> Self {
        self.executor = executor;
        self.session.lock().clear();
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: EngineConfig) -> GraphResult<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn executor(&self) -> &Arc<dyn OpExecutor> {
        &self.executor
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn num_operations(&self) -> usize {
        self.op_index.len()
    }

    /// Human-readable listing of variables and operations
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "SameDiff: {} variables, {} operations\n",
            self.num_variables(),
            self.num_operations()
        ));
        out.push_str("--- Variables ---\n");
        for var in self.variables() {
            let producer = var
                .producer
                .and_then(|id| self.op_by_id(id))
                .map(|op| op.name.as_str())
                .unwrap_or("-");
            out.push_str(&format!(
                "{:<32} {:<12} {:<8} {:<16} {}\n",
                var.name,
                format!("{:?}", var.kind),
                var.dtype,
                var.shape,
                producer
            ));
        }
        out.push_str("--- Operations ---\n");
        for op in self.operations() {
            out.push_str(&format!(
                "{:<32} {:<24} [{}] -> [{}]\n",
                op.name,
                op.op_type.name(),
                op.inputs.join(", "),
                op.outputs.join(", ")
            ));
        }
        out
    }
}

impl Default for SameDiff {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SameDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SameDiff")
            .field("variables", &self.num_variables())
            .field("operations", &self.num_operations())
            .field("version", &self.version)
            .field("executor", &self.executor.name())
            .finish()
    }
}
