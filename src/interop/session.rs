//! Scoped ownership of interpreter objects

use tracing::trace;

use crate::error::GraphResult;
use super::interpreter;
use super::{convert, Exchange, ExpectedType, ForeignHandle, ForeignValue};

/// Owns every handle it hands out and releases them all when dropped
#[derive(Debug)]
pub struct InterpreterSession {
    handles: Vec<ForeignHandle>,
}

impl InterpreterSession {
    /// Open a session, starting the interpreter if needed
    pub fn new() -> Self {
        interpreter::initialize();
        Self { handles: Vec::new() }
    }

    /// Number of handles this session still owns
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Copy a Rust value into the interpreter
    pub fn to_foreign<T: Exchange>(&mut self, value: &T) -> GraphResult<ForeignHandle> {
        self.adopt(interpreter::alloc(value.to_foreign())?)
    }

    /// Read an interpreter object back as `T`
    pub fn from_foreign<T: Exchange>(&self, handle: ForeignHandle, expected: ExpectedType) -> GraphResult<T> {
        convert(&interpreter::value_of(handle)?, expected)
    }

    pub fn value(&self, handle: ForeignHandle) -> GraphResult<ForeignValue> {
        interpreter::value_of(handle)
    }

    /// Expose `handle` as global `name` of the current context
    pub fn bind(&self, name: &str, handle: ForeignHandle) -> GraphResult<()> {
        interpreter::bind_global(name, handle)
    }

    /// Handle to global `name` of the current context
    pub fn lookup(&mut self, name: &str) -> GraphResult<ForeignHandle> {
        self.adopt(interpreter::lookup_global(name)?)
    }

    /// Give up one handle before the session ends
    pub fn release(&mut self, handle: ForeignHandle) {
        if let Some(pos) = self.handles.iter().position(|h| *h == handle) {
            self.handles.swap_remove(pos);
            interpreter::release(handle);
        }
    }

    fn adopt(&mut self, handle: ForeignHandle) -> GraphResult<ForeignHandle> {
        self.handles.push(handle);
        Ok(handle)
    }
}

impl Default for InterpreterSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterpreterSession {
    fn drop(&mut self) {
        trace!(handles = self.handles.len(), "Releasing interpreter session");
        for handle in self.handles.drain(..) {
            interpreter::release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::interpreter::{is_live, TEST_LOCK};
    use crate::interop::{get_global, set_context, MAIN_CONTEXT};
    use crate::tensor::{DType, NdArray};

    #[test]
    fn test_handles_released_on_drop() {
        let handle = {
            let mut session = InterpreterSession::new();
            let handle = session.to_foreign(&vec![1.0f64, 2.0]).unwrap();
            let back: Vec<f64> = session.from_foreign(handle, ExpectedType::List).unwrap();
            assert_eq!(back, vec![1.0, 2.0]);
            handle
        };
        assert!(!is_live(handle));
    }

    #[test]
    fn test_bound_global_outlives_session() {
        let _guard = TEST_LOCK.lock();
        let array = NdArray::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap();
        let handle = {
            let mut session = InterpreterSession::new();
            set_context(MAIN_CONTEXT).unwrap();
            let handle = session.to_foreign(&array).unwrap();
            session.bind("session_array", handle).unwrap();
            handle
        };
        assert!(is_live(handle));
        assert_eq!(get_global("session_array").unwrap(), ForeignValue::NdArray(array.clone()));

        let mut session = InterpreterSession::new();
        let again = session.lookup("session_array").unwrap();
        let out: NdArray = session.from_foreign(again, ExpectedType::NdArray).unwrap();
        assert_eq!(out.dtype(), DType::F64);
        assert_eq!(out, array);
    }

    #[test]
    fn test_expected_type_checked() {
        let mut session = InterpreterSession::new();
        let handle = session.to_foreign(&"text".to_string()).unwrap();
        assert!(session.from_foreign::<i64>(handle, ExpectedType::Int).is_err());
        session.release(handle);
        assert!(session.is_empty());
        assert!(session.value(handle).is_err());
    }
}
