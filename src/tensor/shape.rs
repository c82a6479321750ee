//! Partially known static shapes and broadcasting

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Static shape of a graph variable.
///
/// Any dimension may be unknown (`None`), and the rank itself may be unknown,
/// which is common for placeholders and for outputs whose shape depends on
/// runtime values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Option<Vec<Option<usize>>>,
}

impl Shape {
    /// Fully known shape
    pub fn known(dims: &[usize]) -> Self {
        Self {
            dims: Some(dims.iter().map(|&d| Some(d)).collect()),
        }
    }

    pub fn scalar() -> Self {
        Self { dims: Some(Vec::new()) }
    }

    /// Shape whose rank is not known
    pub fn unknown() -> Self {
        Self { dims: None }
    }

    /// Known rank, every dimension unknown
    pub fn with_rank(rank: usize) -> Self {
        Self {
            dims: Some(vec![None; rank]),
        }
    }

    pub fn from_dims(dims: Vec<Option<usize>>) -> Self {
        Self { dims: Some(dims) }
    }

    /// Build from the `-1 means unknown` convention
    pub fn from_i64(dims: &[i64]) -> Self {
        Self {
            dims: Some(
                dims.iter()
                    .map(|&d| if d < 0 { None } else { Some(d as usize) })
                    .collect(),
            ),
        }
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(|d| d.len())
    }

    pub fn dims(&self) -> Option<&[Option<usize>]> {
        self.dims.as_deref()
    }

    pub fn dim(&self, index: usize) -> Option<usize> {
        self.dims.as_ref().and_then(|d| d.get(index).copied().flatten())
    }

    pub fn is_fully_known(&self) -> bool {
        matches!(&self.dims, Some(d) if d.iter().all(|x| x.is_some()))
    }

    /// Concrete dimensions when every dimension is known
    pub fn to_known(&self) -> Option<Vec<usize>> {
        self.dims.as_ref()?.iter().copied().collect()
    }

    pub fn num_elements(&self) -> Option<usize> {
        self.to_known().map(|d| d.iter().product())
    }

    /// Whether a concrete runtime shape satisfies this static shape
    pub fn is_compatible_with(&self, actual: &[usize]) -> bool {
        match &self.dims {
            None => true,
            Some(dims) => {
                dims.len() == actual.len()
                    && dims
                        .iter()
                        .zip(actual)
                        .all(|(expected, &got)| expected.map_or(true, |e| e == got))
            }
        }
    }

    /// Keep only the information two candidate shapes agree on
    pub fn merge(&self, other: &Shape) -> Shape {
        match (&self.dims, &other.dims) {
            (Some(a), Some(b)) if a.len() == b.len() => Shape::from_dims(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| if x == y { *x } else { None })
                    .collect(),
            ),
            _ => Shape::unknown(),
        }
    }

    /// Right-aligned broadcast of two static shapes; `None` when incompatible
    pub fn broadcast(a: &Shape, b: &Shape) -> Option<Shape> {
        let (a, b) = match (&a.dims, &b.dims) {
            (Some(a), Some(b)) => (a, b),
            _ => return Some(Shape::unknown()),
        };
        let rank = a.len().max(b.len());
        let mut out = vec![None; rank];
        for i in 0..rank {
            let x = if i < rank - a.len() { Some(1) } else { a[i - (rank - a.len())] };
            let y = if i < rank - b.len() { Some(1) } else { b[i - (rank - b.len())] };
            out[i] = match (x, y) {
                (Some(x), Some(y)) if x == y => Some(x),
                (Some(1), other) | (other, Some(1)) => other,
                (Some(_), Some(_)) => return None,
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            };
        }
        Some(Shape::from_dims(out))
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::known(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::known(&dims)
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dims {
            None => write!(f, "[?..]"),
            Some(dims) => write!(
                f,
                "[{}]",
                dims.iter()
                    .map(|d| d.map_or_else(|| "?".to_string(), |d| d.to_string()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// Broadcast of two concrete shapes
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let x = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let y = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        if x == y || y == 1 {
            out.push(x);
        } else if x == 1 {
            out.push(y);
        } else {
            return None;
        }
    }
    Some(out)
}

/// Normalize a possibly negative axis against a rank
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    if axis < 0 || axis >= rank {
        None
    } else {
        Some(axis as usize)
    }
}

/// Row-major strides for a concrete shape
pub fn strides_for(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::ops::OpBuilder;

    fn dims() -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(1usize..=4, 0..=4)
    }

    /// A shape together with one that broadcasts against it: a suffix of
    /// its dims with some of them replaced by 1
    fn broadcastable_pair() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
        dims().prop_flat_map(|a| {
            let len = a.len();
            (Just(a), 0..=len, prop::collection::vec(any::<bool>(), len))
        })
        .prop_map(|(a, keep, ones)| {
            let b = a[a.len() - keep..]
                .iter()
                .zip(&ones[a.len() - keep..])
                .map(|(&d, &one)| if one { 1 } else { d })
                .collect();
            (a, b)
        })
    }

    fn assert_expandable(input: &[usize], out: &[usize]) {
        let offset = out.len() - input.len();
        for (i, &d) in input.iter().enumerate() {
            assert!(d == 1 || d == out[offset + i], "{:?} does not expand to {:?}", input, out);
        }
    }

    proptest! {
        #[test]
        fn test_broadcast_is_symmetric(a in dims(), b in dims()) {
            let ab = broadcast_shapes(&a, &b);
            prop_assert_eq!(&ab, &broadcast_shapes(&b, &a));
            let static_ab = Shape::broadcast(&Shape::known(&a), &Shape::known(&b));
            prop_assert_eq!(static_ab, ab.as_deref().map(Shape::known));
            if let Some(out) = ab {
                prop_assert_eq!(out.len(), a.len().max(b.len()));
                assert_expandable(&a, &out);
                assert_expandable(&b, &out);
            }
        }

        #[test]
        fn test_broadcastable_pairs_expand_to_larger((a, b) in broadcastable_pair()) {
            prop_assert_eq!(broadcast_shapes(&a, &b), Some(a.clone()));
            prop_assert_eq!(broadcast_shapes(&b, &a), Some(a));
        }

        #[test]
        fn test_incompatible_operands_rejected_by_ops(a in dims(), b in dims()) {
            let mut sd = crate::graph::SameDiff::new();
            sd.placeholder("a", crate::tensor::DType::F32, Shape::known(&a)).unwrap();
            sd.placeholder("b", crate::tensor::DType::F32, Shape::known(&b)).unwrap();
            let result = sd.add("a", "b");
            match broadcast_shapes(&a, &b) {
                Some(out) => {
                    let y = result.unwrap();
                    prop_assert_eq!(sd.variable(&y).unwrap().shape(), &Shape::known(&out));
                }
                None => prop_assert!(
                    matches!(result, Err(crate::error::GraphError::BroadcastShape { .. })),
                    "{:?} and {:?} should not broadcast", a, b
                ),
            }
        }
    }

    #[test]
    fn test_broadcast_incompatible() {
        assert!(broadcast_shapes(&[5, 4], &[3]).is_none());
        assert!(Shape::broadcast(&Shape::known(&[2, 3]), &Shape::known(&[3, 2])).is_none());
    }

    #[test]
    fn test_broadcast_with_unknown_dims() {
        let a = Shape::from_i64(&[-1, 4]);
        let b = Shape::known(&[4]);
        assert_eq!(Shape::broadcast(&a, &b), Some(Shape::from_i64(&[-1, 4])));
        assert_eq!(Shape::broadcast(&a, &Shape::unknown()), Some(Shape::unknown()));
    }

    #[test]
    fn test_compatibility_and_merge() {
        let s = Shape::from_i64(&[-1, 3]);
        assert!(s.is_compatible_with(&[10, 3]));
        assert!(!s.is_compatible_with(&[10, 4]));
        assert!(!s.is_compatible_with(&[3]));
        assert!(Shape::unknown().is_compatible_with(&[1, 2, 3]));
        assert_eq!(Shape::known(&[2, 3]).merge(&Shape::known(&[2, 4])), Shape::from_i64(&[2, -1]));
        assert_eq!(s.to_string(), "[?, 3]");
    }

    #[test]
    fn test_normalize_axis() {
        assert_eq!(normalize_axis(-1, 2), Some(1));
        assert_eq!(normalize_axis(1, 2), Some(1));
        assert_eq!(normalize_axis(2, 2), None);
        assert_eq!(normalize_axis(-3, 2), None);
        assert_eq!(normalize_axis(0, 0), None);
        assert_eq!(strides_for(&[2, 3, 4]), vec![12, 4, 1]);
    }
}
