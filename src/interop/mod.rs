//! Value exchange with an embedded interpreter
//!
//! The interpreter owns its objects; Rust code refers to them through
//! [`ForeignHandle`]s obtained from an [`InterpreterSession`]. Typed
//! conversion in both directions goes through the [`Exchange`] trait.

mod interpreter;
#[cfg(feature = "python")]
pub mod python;
mod session;

pub use interpreter::{
    add_context, current_context, delete_context, get_global, has_context, initialize, is_initialized,
    list_contexts, reset_context, set_context, set_global, MAIN_CONTEXT,
};
pub use session::InterpreterSession;

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{GraphError, GraphResult};
use crate::tensor::{DType, NdArray};

/// An object living in the interpreter
#[derive(Debug, Clone, PartialEq)]
pub enum ForeignValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ForeignValue>),
    Dict(BTreeMap<String, ForeignValue>),
    NdArray(NdArray),
}

impl ForeignValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ForeignValue::None => "none",
            ForeignValue::Bool(_) => "bool",
            ForeignValue::Int(_) => "int",
            ForeignValue::Float(_) => "float",
            ForeignValue::Str(_) => "str",
            ForeignValue::List(_) => "list",
            ForeignValue::Dict(_) => "dict",
            ForeignValue::NdArray(_) => "ndarray",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ForeignValue::None)
    }
}

/// Opaque reference to an object in the interpreter's object table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignHandle(pub(crate) u64);

impl fmt::Display for ForeignHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<foreign #{}>", self.0)
    }
}

/// Type a conversion out of the interpreter expects to find
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedType {
    Bool,
    Int,
    Float,
    Str,
    List,
    Dict,
    NdArray,
    Any,
}

impl ExpectedType {
    pub fn accepts(&self, value: &ForeignValue) -> bool {
        matches!(
            (self, value),
            (ExpectedType::Any, _)
                | (ExpectedType::Bool, ForeignValue::Bool(_))
                | (ExpectedType::Int, ForeignValue::Int(_) | ForeignValue::Bool(_))
                | (ExpectedType::Float, ForeignValue::Float(_) | ForeignValue::Int(_))
                | (ExpectedType::Str, ForeignValue::Str(_))
                | (ExpectedType::List, ForeignValue::List(_))
                | (ExpectedType::Dict, ForeignValue::Dict(_))
                | (ExpectedType::NdArray, ForeignValue::NdArray(_))
        )
    }
}

fn mismatch(expected: ExpectedType, value: &ForeignValue) -> GraphError {
    GraphError::Conversion(format!("expected {:?}, found {}", expected, value.type_name()))
}

/// A Rust type with a counterpart in the interpreter
pub trait Exchange: Sized {
    const EXPECTED: ExpectedType;

    fn to_foreign(&self) -> ForeignValue;

    fn from_foreign(value: &ForeignValue) -> GraphResult<Self>;
}

impl Exchange for bool {
    const EXPECTED: ExpectedType = ExpectedType::Bool;

    fn to_foreign(&self) -> ForeignValue {
        ForeignValue::Bool(*self)
    }

    fn from_foreign(value: &ForeignValue) -> GraphResult<Self> {
        match value {
            ForeignValue::Bool(b) => Ok(*b),
            other => Err(mismatch(Self::EXPECTED, other)),
        }
    }
}

impl Exchange for i64 {
    const EXPECTED: ExpectedType = ExpectedType::Int;

    fn to_foreign(&self) -> ForeignValue {
        ForeignValue::Int(*self)
    }

    fn from_foreign(value: &ForeignValue) -> GraphResult<Self> {
        match value {
            ForeignValue::Int(i) => Ok(*i),
            ForeignValue::Bool(b) => Ok(i64::from(*b)),
            other => Err(mismatch(Self::EXPECTED, other)),
        }
    }
}

impl Exchange for f64 {
    const EXPECTED: ExpectedType = ExpectedType::Float;

    fn to_foreign(&self) -> ForeignValue {
        ForeignValue::Float(*self)
    }

    fn from_foreign(value: &ForeignValue) -> GraphResult<Self> {
        match value {
            ForeignValue::Float(f) => Ok(*f),
            ForeignValue::Int(i) => Ok(*i as f64),
            other => Err(mismatch(Self::EXPECTED, other)),
        }
    }
}

impl Exchange for String {
    const EXPECTED: ExpectedType = ExpectedType::Str;

    fn to_foreign(&self) -> ForeignValue {
        ForeignValue::Str(self.clone())
    }

    fn from_foreign(value: &ForeignValue) -> GraphResult<Self> {
        match value {
            ForeignValue::Str(s) => Ok(s.clone()),
            other => Err(mismatch(Self::EXPECTED, other)),
        }
    }
}

impl<T: Exchange> Exchange for Vec<T> {
    const EXPECTED: ExpectedType = ExpectedType::List;

    fn to_foreign(&self) -> ForeignValue {
        ForeignValue::List(self.iter().map(Exchange::to_foreign).collect())
    }

    fn from_foreign(value: &ForeignValue) -> GraphResult<Self> {
        match value {
            ForeignValue::List(items) => items.iter().map(T::from_foreign).collect(),
            other => Err(mismatch(Self::EXPECTED, other)),
        }
    }
}

impl<T: Exchange> Exchange for BTreeMap<String, T> {
    const EXPECTED: ExpectedType = ExpectedType::Dict;

    fn to_foreign(&self) -> ForeignValue {
        ForeignValue::Dict(self.iter().map(|(k, v)| (k.clone(), v.to_foreign())).collect())
    }

    fn from_foreign(value: &ForeignValue) -> GraphResult<Self> {
        match value {
            ForeignValue::Dict(entries) => entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), T::from_foreign(v)?)))
                .collect(),
            other => Err(mismatch(Self::EXPECTED, other)),
        }
    }
}

/// Arrays cross as ndarrays; scalars of the interpreter become 0-d arrays
impl Exchange for NdArray {
    const EXPECTED: ExpectedType = ExpectedType::NdArray;

    fn to_foreign(&self) -> ForeignValue {
        ForeignValue::NdArray(self.clone())
    }

    fn from_foreign(value: &ForeignValue) -> GraphResult<Self> {
        match value {
            ForeignValue::NdArray(a) => Ok(a.clone()),
            ForeignValue::Float(f) => Ok(NdArray::scalar(*f, DType::F64)),
            ForeignValue::Int(i) => Ok(NdArray::scalar(*i as f64, DType::I64)),
            ForeignValue::Bool(b) => Ok(NdArray::scalar(f64::from(u8::from(*b)), DType::Bool)),
            other => Err(mismatch(Self::EXPECTED, other)),
        }
    }
}

/// Convert a foreign value, checking it against `expected` first
pub fn convert<T: Exchange>(value: &ForeignValue, expected: ExpectedType) -> GraphResult<T> {
    if !expected.accepts(value) {
        return Err(mismatch(expected, value));
    }
    T::from_foreign(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trips() {
        assert_eq!(i64::from_foreign(&3i64.to_foreign()).unwrap(), 3);
        assert_eq!(String::from_foreign(&"abcd".to_string().to_foreign()).unwrap(), "abcd");
        assert!((f64::from_foreign(&7.0f64.to_foreign()).unwrap() - 7.0).abs() < 1e-5);
        assert!(bool::from_foreign(&true.to_foreign()).unwrap());
    }

    #[test]
    fn test_numeric_widening() {
        assert_eq!(f64::from_foreign(&ForeignValue::Int(2)).unwrap(), 2.0);
        assert_eq!(i64::from_foreign(&ForeignValue::Bool(true)).unwrap(), 1);
        let err = i64::from_foreign(&ForeignValue::Float(2.5)).unwrap_err();
        assert!(matches!(err, GraphError::Conversion(_)));
    }

    #[test]
    fn test_nested_collections() {
        let mut dict = BTreeMap::new();
        dict.insert("a".to_string(), vec![1i64, 2]);
        dict.insert("b".to_string(), vec![]);
        let foreign = dict.to_foreign();
        let back: BTreeMap<String, Vec<i64>> = convert(&foreign, ExpectedType::Dict).unwrap();
        assert_eq!(back, dict);
        assert!(convert::<Vec<i64>>(&foreign, ExpectedType::List).is_err());
    }

    #[test]
    fn test_scalar_to_array() {
        let array = NdArray::from_foreign(&ForeignValue::Float(1.5)).unwrap();
        assert_eq!(array.shape(), &[] as &[usize]);
        assert_eq!(array.scalar_value(), Some(1.5));
        assert!(NdArray::from_foreign(&ForeignValue::Str("x".into())).is_err());
    }
}
