//! Process-wide interpreter state
//!
//! One object table and a set of named contexts, all behind a single global
//! lock. Each context is its own namespace of global names; switching
//! context swaps the namespace that `set_global`/`get_global` see.

use std::collections::HashMap;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{GraphError, GraphResult};
use super::{ForeignHandle, ForeignValue};

/// Context that always exists and can never be deleted
pub const MAIN_CONTEXT: &str = "main";

#[derive(Debug)]
struct Object {
    value: ForeignValue,
    refs: usize,
}

#[derive(Debug, Default)]
struct InterpreterState {
    initialized: bool,
    objects: HashMap<u64, Object>,
    next_id: u64,
    contexts: HashMap<String, HashMap<String, ForeignHandle>>,
    current: String,
}

impl InterpreterState {
    fn check_initialized(&self) -> GraphResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(GraphError::InvalidArgument("interpreter is not initialized".to_string()))
        }
    }

    fn alloc(&mut self, value: ForeignValue) -> ForeignHandle {
        self.next_id += 1;
        self.objects.insert(self.next_id, Object { value, refs: 1 });
        ForeignHandle(self.next_id)
    }

    fn object(&self, handle: ForeignHandle) -> GraphResult<&Object> {
        self.objects
            .get(&handle.0)
            .ok_or_else(|| GraphError::Conversion(format!("{} was already released", handle)))
    }

    fn retain(&mut self, handle: ForeignHandle) -> GraphResult<()> {
        match self.objects.get_mut(&handle.0) {
            Some(obj) => {
                obj.refs += 1;
                Ok(())
            }
            None => Err(GraphError::Conversion(format!("{} was already released", handle))),
        }
    }

    fn release(&mut self, handle: ForeignHandle) {
        if let Some(obj) = self.objects.get_mut(&handle.0) {
            obj.refs -= 1;
            if obj.refs == 0 {
                self.objects.remove(&handle.0);
            }
        }
    }

    fn namespace(&mut self) -> GraphResult<&mut HashMap<String, ForeignHandle>> {
        let current = self.current.clone();
        self.contexts
            .get_mut(&current)
            .ok_or_else(|| GraphError::Internal(format!("current context '{}' is missing", current)))
    }

    fn drop_namespace(&mut self, namespace: HashMap<String, ForeignHandle>) {
        for handle in namespace.into_values() {
            self.release(handle);
        }
    }
}

lazy_static! {
    static ref INTERPRETER: Mutex<InterpreterState> = Mutex::new(InterpreterState::default());
}

/// Start the interpreter; calling it again is a no-op
pub fn initialize() {
    let mut state = INTERPRETER.lock();
    if state.initialized {
        return;
    }
    state.initialized = true;
    state.contexts.insert(MAIN_CONTEXT.to_string(), HashMap::new());
    state.current = MAIN_CONTEXT.to_string();
    info!("Interpreter initialized");
}

pub fn is_initialized() -> bool {
    INTERPRETER.lock().initialized
}

pub fn current_context() -> GraphResult<String> {
    let state = INTERPRETER.lock();
    state.check_initialized()?;
    Ok(state.current.clone())
}

pub fn has_context(name: &str) -> bool {
    INTERPRETER.lock().contexts.contains_key(name)
}

pub fn list_contexts() -> Vec<String> {
    let mut names: Vec<String> = INTERPRETER.lock().contexts.keys().cloned().collect();
    names.sort();
    names
}

/// Create an empty context without switching to it
pub fn add_context(name: &str) -> GraphResult<()> {
    let mut state = INTERPRETER.lock();
    state.check_initialized()?;
    if name.is_empty() {
        return Err(GraphError::InvalidArgument("context name must not be empty".to_string()));
    }
    if state.contexts.contains_key(name) {
        return Err(GraphError::name_collision(name));
    }
    state.contexts.insert(name.to_string(), HashMap::new());
    debug!(context = name, "Added interpreter context");
    Ok(())
}

/// Make `name` the current context, creating it when absent
pub fn set_context(name: &str) -> GraphResult<()> {
    let mut state = INTERPRETER.lock();
    state.check_initialized()?;
    if name.is_empty() {
        return Err(GraphError::InvalidArgument("context name must not be empty".to_string()));
    }
    state.contexts.entry(name.to_string()).or_default();
    state.current = name.to_string();
    debug!(context = name, "Switched interpreter context");
    Ok(())
}

/// Delete a context and release everything its namespace holds
pub fn delete_context(name: &str) -> GraphResult<()> {
    let mut state = INTERPRETER.lock();
    state.check_initialized()?;
    if name == MAIN_CONTEXT {
        return Err(GraphError::InvalidArgument("the main context cannot be deleted".to_string()));
    }
    if name == state.current {
        return Err(GraphError::InvalidArgument(format!(
            "'{}' is the current context; switch away before deleting it",
            name
        )));
    }
    let namespace = state
        .contexts
        .remove(name)
        .ok_or_else(|| GraphError::InvalidArgument(format!("no context named '{}'", name)))?;
    state.drop_namespace(namespace);
    debug!(context = name, "Deleted interpreter context");
    Ok(())
}

/// Clear every global of the current context
pub fn reset_context() -> GraphResult<()> {
    let mut state = INTERPRETER.lock();
    state.check_initialized()?;
    let namespace = std::mem::take(state.namespace()?);
    state.drop_namespace(namespace);
    Ok(())
}

/// Assign a global in the current context
pub fn set_global(name: &str, value: ForeignValue) -> GraphResult<()> {
    let mut state = INTERPRETER.lock();
    state.check_initialized()?;
    let handle = state.alloc(value);
    if let Some(old) = state.namespace()?.insert(name.to_string(), handle) {
        state.release(old);
    }
    Ok(())
}

/// Value of a global in the current context
pub fn get_global(name: &str) -> GraphResult<ForeignValue> {
    let mut state = INTERPRETER.lock();
    state.check_initialized()?;
    let handle = state
        .namespace()?
        .get(name)
        .copied()
        .ok_or_else(|| GraphError::UnknownVariable(name.to_string()))?;
    Ok(state.object(handle)?.value.clone())
}

pub(crate) fn alloc(value: ForeignValue) -> GraphResult<ForeignHandle> {
    let mut state = INTERPRETER.lock();
    state.check_initialized()?;
    Ok(state.alloc(value))
}

pub(crate) fn value_of(handle: ForeignHandle) -> GraphResult<ForeignValue> {
    Ok(INTERPRETER.lock().object(handle)?.value.clone())
}

pub(crate) fn release(handle: ForeignHandle) {
    INTERPRETER.lock().release(handle);
}

/// Bind an existing object to a global name in the current context
pub(crate) fn bind_global(name: &str, handle: ForeignHandle) -> GraphResult<()> {
    let mut state = INTERPRETER.lock();
    state.check_initialized()?;
    state.retain(handle)?;
    if let Some(old) = state.namespace()?.insert(name.to_string(), handle) {
        state.release(old);
    }
    Ok(())
}

/// New reference to the object behind a global of the current context
pub(crate) fn lookup_global(name: &str) -> GraphResult<ForeignHandle> {
    let mut state = INTERPRETER.lock();
    state.check_initialized()?;
    let handle = state
        .namespace()?
        .get(name)
        .copied()
        .ok_or_else(|| GraphError::UnknownVariable(name.to_string()))?;
    state.retain(handle)?;
    Ok(handle)
}

#[cfg(test)]
pub(crate) fn is_live(handle: ForeignHandle) -> bool {
    INTERPRETER.lock().objects.contains_key(&handle.0)
}

/// Serializes tests that switch the process-wide current context
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = parking_lot::const_mutex(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_are_separate_namespaces() {
        let _guard = TEST_LOCK.lock();
        initialize();
        set_context(MAIN_CONTEXT).unwrap();
        set_global("x", ForeignValue::Int(1)).unwrap();

        set_context("ns-separate").unwrap();
        assert!(matches!(get_global("x"), Err(GraphError::UnknownVariable(_))));
        set_global("x", ForeignValue::Int(2)).unwrap();

        set_context(MAIN_CONTEXT).unwrap();
        assert_eq!(get_global("x").unwrap(), ForeignValue::Int(1));
        delete_context("ns-separate").unwrap();
        assert!(!has_context("ns-separate"));
        reset_context().unwrap();
    }

    #[test]
    fn test_main_and_current_context_cannot_be_deleted() {
        let _guard = TEST_LOCK.lock();
        initialize();
        assert!(delete_context(MAIN_CONTEXT).is_err());

        set_context("ns-current").unwrap();
        assert_eq!(current_context().unwrap(), "ns-current");
        assert!(delete_context("ns-current").is_err());
        set_context(MAIN_CONTEXT).unwrap();
        delete_context("ns-current").unwrap();
    }

    #[test]
    fn test_add_context_rejects_duplicates() {
        let _guard = TEST_LOCK.lock();
        initialize();
        add_context("ns-dup").unwrap();
        assert!(matches!(add_context("ns-dup"), Err(GraphError::NameCollision { .. })));
        assert!(list_contexts().contains(&"ns-dup".to_string()));
        delete_context("ns-dup").unwrap();
    }

    #[test]
    fn test_deleting_context_releases_objects() {
        let _guard = TEST_LOCK.lock();
        initialize();
        let handle = alloc(ForeignValue::Str("held".into())).unwrap();
        set_context("ns-release").unwrap();
        bind_global("s", handle).unwrap();
        release(handle);
        assert!(is_live(handle));

        set_context(MAIN_CONTEXT).unwrap();
        delete_context("ns-release").unwrap();
        assert!(!is_live(handle));
    }
}
