//! Element data types and numeric promotion

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Data types a graph variable can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F16,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
    Utf8,
}

impl DType {
    /// Get the size in bytes of this data type (0 for variable-length strings)
    pub const fn size(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I8 => 1,
            DType::I16 => 2,
            DType::I32 => 4,
            DType::I64 => 8,
            DType::U8 => 1,
            DType::U16 => 2,
            DType::U32 => 4,
            DType::U64 => 8,
            DType::Bool => 1,
            DType::Utf8 => 0,
        }
    }

    /// Check if this is a floating point type
    pub const fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Check if this is an integer type
    pub const fn is_int(&self) -> bool {
        matches!(
            self,
            DType::I8 | DType::I16 | DType::I32 | DType::I64 | DType::U8 | DType::U16 | DType::U32 | DType::U64
        )
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, DType::I8 | DType::I16 | DType::I32 | DType::I64) || self.is_float()
    }

    /// Numeric means usable in arithmetic: floats and integers, never bool or strings
    pub const fn is_numeric(&self) -> bool {
        self.is_float() || self.is_int()
    }

    pub const fn is_bool(&self) -> bool {
        matches!(self, DType::Bool)
    }

    /// Promoted type of two operands, or `None` when no arithmetic type covers both
    pub fn promote(a: DType, b: DType) -> Option<DType> {
        if a == b {
            return Some(a);
        }
        if a == DType::Utf8 || b == DType::Utf8 {
            return None;
        }
        match (a.is_float(), b.is_float()) {
            (true, true) => Some(if a.size() >= b.size() { a } else { b }),
            (true, false) => Some(a),
            (false, true) => Some(b),
            (false, false) => {
                if a == DType::Bool {
                    return Some(b);
                }
                if b == DType::Bool {
                    return Some(a);
                }
                if a.is_signed() == b.is_signed() {
                    return Some(if a.size() >= b.size() { a } else { b });
                }
                // Mixed signedness widens to a signed type that holds both
                let (signed, unsigned) = if a.is_signed() { (a, b) } else { (b, a) };
                if signed.size() > unsigned.size() {
                    Some(signed)
                } else {
                    Some(match unsigned.size() {
                        1 => DType::I16,
                        2 => DType::I32,
                        _ => DType::I64,
                    })
                }
            }
        }
    }

    /// Convert to the numpy-style dtype string used by the interpreter bridge
    pub fn to_numpy_dtype(&self) -> &'static str {
        match self {
            DType::F16 => "float16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::U64 => "uint64",
            DType::Bool => "bool",
            DType::Utf8 => "str",
        }
    }

    pub fn from_numpy_dtype(name: &str) -> Option<DType> {
        let dtype = match name {
            "float16" => DType::F16,
            "float32" => DType::F32,
            "float64" => DType::F64,
            "int8" => DType::I8,
            "int16" => DType::I16,
            "int32" => DType::I32,
            "int64" => DType::I64,
            "uint8" => DType::U8,
            "uint16" => DType::U16,
            "uint32" => DType::U32,
            "uint64" => DType::U64,
            "bool" => DType::Bool,
            "str" => DType::Utf8,
            _ => return None,
        };
        Some(dtype)
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_numpy_dtype())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_families() {
        assert!(DType::F16.is_float());
        assert!(DType::U32.is_int());
        assert!(!DType::Bool.is_numeric());
        assert!(!DType::Utf8.is_numeric());
        assert_eq!(DType::F32.to_numpy_dtype(), "float32");
        assert_eq!(DType::from_numpy_dtype("uint8"), Some(DType::U8));
    }

    #[test]
    fn test_promotion() {
        assert_eq!(DType::promote(DType::F32, DType::F64), Some(DType::F64));
        assert_eq!(DType::promote(DType::I64, DType::F16), Some(DType::F16));
        assert_eq!(DType::promote(DType::I8, DType::I32), Some(DType::I32));
        assert_eq!(DType::promote(DType::U8, DType::I8), Some(DType::I16));
        assert_eq!(DType::promote(DType::U16, DType::I64), Some(DType::I64));
        assert_eq!(DType::promote(DType::Bool, DType::I32), Some(DType::I32));
        assert_eq!(DType::promote(DType::Utf8, DType::F32), None);
    }
}
