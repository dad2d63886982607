use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A layered key/value store used to resolve template expressions.
///
/// Layers are merged in the order they are pushed: a later layer's keys
/// shadow an earlier layer's. The typical push order for a step is, from
/// lowest to highest priority: job-level environment, secrets, previous
/// steps' outputs, then the step's own `env` block. This mirrors the
/// original agent's variable precedence, where a step could always
/// override anything inherited from its job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Variables {
    layers: Vec<BTreeMap<String, serde_json::Value>>,
}

impl Variables {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Pushes a new, highest-priority layer onto the stack.
    pub fn push_layer(&mut self, layer: BTreeMap<String, serde_json::Value>) {
        self.layers.push(layer);
    }

    /// Looks up `key`, searching from the most recently pushed layer down
    /// to the first.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.layers.iter().rev().find_map(|layer| layer.get(key))
    }

    /// Flattens all layers into a single map, applying precedence. Used
    /// when handing a resolved variable set to a child process as
    /// environment variables.
    pub fn flatten(&self) -> BTreeMap<String, serde_json::Value> {
        let mut merged = BTreeMap::new();
        for layer in &self.layers {
            for (k, v) in layer {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    /// Flattens all layers into string values suitable for a child
    /// process's environment. Non-string JSON values are rendered with
    /// their plain `Display` form for numbers and booleans, and with
    /// `serde_json::to_string` for arrays and objects.
    pub fn flatten_to_env(&self) -> BTreeMap<String, String> {
        self.flatten()
            .into_iter()
            .map(|(k, v)| (k, value_to_env_string(&v)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.is_empty())
    }
}

fn value_to_env_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layer_shadows_earlier() {
        let mut vars = Variables::new();
        let mut base = BTreeMap::new();
        base.insert("NAME".to_string(), serde_json::json!("base"));
        vars.push_layer(base);

        let mut override_layer = BTreeMap::new();
        override_layer.insert("NAME".to_string(), serde_json::json!("override"));
        vars.push_layer(override_layer);

        assert_eq!(vars.get("NAME").unwrap(), &serde_json::json!("override"));
    }

    #[test]
    fn lookup_falls_through_to_earlier_layer() {
        let mut vars = Variables::new();
        let mut base = BTreeMap::new();
        base.insert("HOME".to_string(), serde_json::json!("/root"));
        vars.push_layer(base);
        vars.push_layer(BTreeMap::new());

        assert_eq!(vars.get("HOME").unwrap(), &serde_json::json!("/root"));
        assert!(vars.get("MISSING").is_none());
    }

    #[test]
    fn flatten_to_env_renders_scalars() {
        let mut vars = Variables::new();
        let mut layer = BTreeMap::new();
        layer.insert("COUNT".to_string(), serde_json::json!(3));
        layer.insert("ENABLED".to_string(), serde_json::json!(true));
        layer.insert("NAME".to_string(), serde_json::json!("demo"));
        vars.push_layer(layer);

        let env = vars.flatten_to_env();
        assert_eq!(env.get("COUNT").unwrap(), "3");
        assert_eq!(env.get("ENABLED").unwrap(), "true");
        assert_eq!(env.get("NAME").unwrap(), "demo");
    }
}
