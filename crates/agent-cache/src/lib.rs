//! Caches resolved action fetches so the same `owner/name@version` with the
//! same inputs is not re-cloned and re-resolved on every step.
//!
//! The cache key has a fixed, deliberate format
//! (`git_url@version+sorted-json-inputs`) so that a cache warmed by one
//! process generation and persisted to disk by a future `agent-config`
//! extension stays valid across that boundary.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Builds the cache key for an action fetch.
///
/// Only the keys in `declared_inputs` participate in the key; any other
/// key present in `inputs` (there shouldn't be any, since
/// `ActionManifest::resolve_inputs` already rejects undeclared inputs) is
/// ignored so that unrelated step-local variables never cause a spurious
/// cache miss.
pub fn cache_key(
    git_url: &str,
    version: &str,
    inputs: &BTreeMap<String, serde_json::Value>,
    declared_inputs: &[String],
) -> String {
    let filtered: BTreeMap<&String, &serde_json::Value> = inputs
        .iter()
        .filter(|(k, _)| declared_inputs.iter().any(|d| d == *k))
        .collect();
    let inputs_json = serde_json::to_string(&filtered).unwrap_or_default();
    format!("{git_url}@{version}+{inputs_json}")
}

/// A resolved action fetch: the local path the action was checked out to
/// plus its parsed manifest, already validated. Stored as an opaque blob
/// here since `agent-cache` must not depend on `agent-catalog` (that
/// dependency would run the other way).
#[derive(Debug, Clone)]
pub struct CachedAction {
    pub local_path: std::path::PathBuf,
}

/// Thread-safe cache of resolved action fetches, owned by the running
/// agent rather than a process-global static.
#[derive(Debug, Default)]
pub struct ActionCache {
    entries: Mutex<HashMap<String, CachedAction>>,
}

impl ActionCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up `key`. A version of `"latest"` should never be passed to
    /// `insert`/`get` by callers: `agent-catalog` is responsible for
    /// skipping the cache entirely for the `latest` sentinel so it always
    /// re-resolves.
    pub fn get(&self, key: &str) -> Option<CachedAction> {
        self.entries.lock().expect("cache mutex poisoned").get(key).cloned()
    }

    pub fn insert(&self, key: String, action: CachedAction) {
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .insert(key, action);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_only_includes_declared_inputs() {
        let mut inputs = BTreeMap::new();
        inputs.insert("path".to_string(), serde_json::json!("."));
        inputs.insert("local_scratch_var".to_string(), serde_json::json!("ignored"));

        let key = cache_key(
            "git://github.com/acme/build.git",
            "v1",
            &inputs,
            &["path".to_string()],
        );
        assert!(key.contains("\"path\":\".\""));
        assert!(!key.contains("local_scratch_var"));
    }

    #[test]
    fn cache_key_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), serde_json::json!(2));
        a.insert("a".to_string(), serde_json::json!(1));

        let mut b = BTreeMap::new();
        b.insert("a".to_string(), serde_json::json!(1));
        b.insert("b".to_string(), serde_json::json!(2));

        let key_a = cache_key("u", "v", &a, &["a".to_string(), "b".to_string()]);
        let key_b = cache_key("u", "v", &b, &["a".to_string(), "b".to_string()]);
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn insert_and_get_round_trip() {
        let cache = ActionCache::new();
        cache.insert(
            "k".to_string(),
            CachedAction {
                local_path: "/tmp/a".into(),
            },
        );
        assert_eq!(cache.get("k").unwrap().local_path, std::path::PathBuf::from("/tmp/a"));
        assert!(cache.get("missing").is_none());
    }
}
