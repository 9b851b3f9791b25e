//! The rolling data context threaded through a workflow execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An unordered mapping from variable name to a JSON-representable value.
///
/// Keys starting with `__` are reserved for internal bookkeeping and are
/// stripped by [`Context::publish`] before the context becomes visible to
/// downstream tasks.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Context(BTreeMap<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` into `self` with overwrite semantics, then strip
    /// reserved `__`-prefixed keys. Mirrors `finalize_context`'s
    /// `dx.merge_dicts(in_ctx, new_ctx, overwrite=True)` followed by the
    /// `__`-prefix scrub.
    pub fn merged_and_stripped(&self, additions: &BTreeMap<String, Value>) -> Context {
        let mut out = self.0.clone();
        for (k, v) in additions {
            out.insert(k.clone(), v.clone());
        }
        out.retain(|k, _| !k.starts_with("__"));
        Context(out)
    }

    /// Union of variable *names* visible in `self` and `other` — used by
    /// `inspect_context`'s rolling-context accumulation, which tracks only
    /// names, not values.
    pub fn union_names(a: &[String], b: &[String]) -> Vec<String> {
        let mut names: Vec<String> = a.iter().chain(b.iter()).cloned().collect();
        names.sort();
        names.dedup();
        names
    }
}

impl From<BTreeMap<String, Value>> for Context {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overwrites_and_strips_reserved_keys() {
        let mut base = Context::new();
        base.set("x", json!(1));
        base.set("__hidden", json!("secret"));

        let mut additions = BTreeMap::new();
        additions.insert("x".to_string(), json!(2));
        additions.insert("y".to_string(), json!(3));

        let merged = base.merged_and_stripped(&additions);

        assert_eq!(merged.get("x"), Some(&json!(2)));
        assert_eq!(merged.get("y"), Some(&json!(3)));
        assert_eq!(merged.get("__hidden"), None);
    }

    #[test]
    fn union_names_dedupes_and_sorts() {
        let a = vec!["b".to_string(), "a".to_string()];
        let b = vec!["a".to_string(), "c".to_string()];
        assert_eq!(Context::union_names(&a, &b), vec!["a", "b", "c"]);
    }
}
