//! Name scopes and deterministic name generation

use super::SameDiff;

impl SameDiff {
    /// Open a nested name scope; every name created until the matching
    /// `pop_scope` is prefixed by it
    pub fn push_scope(&mut self, name: &str) {
        self.scopes.push(name.trim_matches('/').to_string());
    }

    pub fn pop_scope(&mut self) -> Option<String> {
        self.scopes.pop()
    }

    /// Run `f` inside a scope that is closed afterwards, even on error
    pub fn with_scope<R>(&mut self, name: &str, f: impl FnOnce(&mut SameDiff) -> R) -> R {
        self.push_scope(name);
        let result = f(self);
        self.pop_scope();
        result
    }

    pub fn current_scope(&self) -> Option<String> {
        if self.scopes.is_empty() {
            None
        } else {
            Some(self.scopes.join("/"))
        }
    }

    /// `name` qualified by the active scope
    pub fn scoped_name(&self, name: &str) -> String {
        match self.current_scope() {
            Some(scope) => format!("{}/{}", scope, name),
            None => name.to_string(),
        }
    }

    /// Unqualified block name unique among existing names and scopes,
    /// such as `if`, `if_1`, `if_2`
    pub fn new_block_name(&mut self, base: &str) -> String {
        let key = format!("{}#block", self.scoped_name(base));
        let mut counter = self.name_counters.get(&key).copied().unwrap_or(0);
        loop {
            let candidate = numbered(base, counter);
            counter += 1;
            let full = self.scoped_name(&candidate);
            if !self.name_in_use(&full) {
                self.name_counters.insert(key, counter);
                return candidate;
            }
        }
    }

    /// Generated operation name whose output names are also free
    pub(crate) fn generate_op_name(&mut self, base: &str, num_outputs: usize) -> String {
        let key = self.scoped_name(base);
        let mut counter = self.name_counters.get(&key).copied().unwrap_or(0);
        loop {
            let full = self.scoped_name(&numbered(base, counter));
            counter += 1;
            let taken = self.op_index.contains_key(&full)
                || output_names(&full, num_outputs)
                    .iter()
                    .any(|n| self.variables.contains_key(n));
            if !taken {
                self.name_counters.insert(key, counter);
                return full;
            }
        }
    }

    pub(crate) fn generate_var_name(&mut self, base: &str) -> String {
        let key = self.scoped_name(base);
        let mut counter = self.name_counters.get(&key).copied().unwrap_or(0);
        loop {
            let full = self.scoped_name(&numbered(base, counter));
            counter += 1;
            if !self.variables.contains_key(&full) {
                self.name_counters.insert(key, counter);
                return full;
            }
        }
    }

    fn name_in_use(&self, full: &str) -> bool {
        let nested = format!("{}/", full);
        self.variables.contains_key(full)
            || self.op_index.contains_key(full)
            || self.var_order.iter().any(|n| n.starts_with(&nested))
            || self.op_index.keys().any(|n| n.starts_with(&nested))
    }
}

fn numbered(base: &str, counter: usize) -> String {
    if counter == 0 {
        base.to_string()
    } else {
        format!("{}_{}", base, counter)
    }
}

/// Output variable names of an operation: the op name itself for a single
/// output, `name_i` otherwise
pub(crate) fn output_names(name: &str, num_outputs: usize) -> Vec<String> {
    if num_outputs == 1 {
        vec![name.to_string()]
    } else {
        (0..num_outputs).map(|i| format!("{}_{}", name, i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_names() {
        let mut sd = SameDiff::new();
        assert_eq!(sd.scoped_name("x"), "x");
        sd.push_scope("outer");
        sd.push_scope("inner/");
        assert_eq!(sd.current_scope().as_deref(), Some("outer/inner"));
        assert_eq!(sd.scoped_name("x"), "outer/inner/x");
        sd.pop_scope();
        let inside = sd.with_scope("block", |g| g.scoped_name("y"));
        assert_eq!(inside, "outer/block/y");
        assert_eq!(sd.current_scope().as_deref(), Some("outer"));
    }

    #[test]
    fn test_block_names_are_unique() {
        let mut sd = SameDiff::new();
        assert_eq!(sd.new_block_name("if"), "if");
        assert_eq!(sd.new_block_name("if"), "if_1");
        sd.push_scope("while");
        assert_eq!(sd.new_block_name("if"), "if");
    }

    #[test]
    fn test_output_names() {
        assert_eq!(output_names("add", 1), vec!["add".to_string()]);
        assert_eq!(output_names("switch", 2), vec!["switch_0".to_string(), "switch_1".to_string()]);
    }
}
