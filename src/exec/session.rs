//! Cross-call cache of computed array values

use std::collections::HashMap;

use tracing::trace;

use crate::tensor::NdArray;

#[derive(Debug, Clone)]
struct CachedValue {
    value: NdArray,
    version: u64,
    value_version: u64,
    /// Placeholder bindings the value was computed from
    placeholders: Vec<(String, NdArray)>,
}

/// Array values computed by earlier `execute` calls.
///
/// An entry stays valid while the graph structure, every persistent value
/// and every placeholder it depends on are unchanged.
#[derive(Debug, Default)]
pub struct InferenceSession {
    entries: HashMap<String, CachedValue>,
    hits: u64,
    misses: u64,
}

impl InferenceSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookups served from the cache and lookups that missed
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Cached value of `name`, if still valid under the given state
    pub(crate) fn lookup(
        &mut self,
        name: &str,
        version: u64,
        value_version: u64,
        bindings: &HashMap<String, NdArray>,
    ) -> Option<NdArray> {
        let valid = match self.entries.get(name) {
            Some(entry) => {
                entry.version == version
                    && entry.value_version == value_version
                    && entry.placeholders.iter().all(|(p, used)| {
                        bindings
                            .get(p)
                            .map_or(false, |bound| bound.shares_buffer(used) || bound == used)
                    })
            }
            None => {
                self.misses += 1;
                return None;
            }
        };
        if valid {
            self.hits += 1;
            trace!(variable = %name, "Inference cache hit");
            self.entries.get(name).map(|e| e.value.clone())
        } else {
            self.misses += 1;
            self.entries.remove(name);
            None
        }
    }

    pub(crate) fn store(
        &mut self,
        name: &str,
        value: NdArray,
        version: u64,
        value_version: u64,
        placeholders: Vec<(String, NdArray)>,
    ) {
        self.entries.insert(
            name.to_string(),
            CachedValue {
                value,
                version,
                value_version,
                placeholders,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    #[test]
    fn test_entry_invalidated_by_rebinding() {
        let mut session = InferenceSession::new();
        let x = NdArray::scalar(1.0, DType::F32);
        let mut bindings = HashMap::new();
        bindings.insert("x".to_string(), x.clone());
        session.store("y", NdArray::scalar(2.0, DType::F32), 3, 0, vec![("x".to_string(), x)]);

        assert!(session.lookup("y", 3, 0, &bindings).is_some());
        assert!(session.lookup("y", 4, 0, &bindings).is_none());
        assert!(session.is_empty());

        session.store(
            "y",
            NdArray::scalar(2.0, DType::F32),
            3,
            0,
            vec![("x".to_string(), NdArray::scalar(1.0, DType::F32))],
        );
        bindings.insert("x".to_string(), NdArray::scalar(5.0, DType::F32));
        assert!(session.lookup("y", 3, 0, &bindings).is_none());
        assert_eq!(session.stats(), (1, 2));
    }
}
