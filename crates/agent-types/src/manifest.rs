use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared type of a single action input, used to coerce and validate
/// caller-supplied values before a step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Boolean,
    Number,
    /// A JSON array or object passed through as-is, with no further
    /// coercion. Used for inputs like file lists or nested config blocks.
    Json,
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputType::String => "string",
            InputType::Boolean => "boolean",
            InputType::Number => "number",
            InputType::Json => "json",
        };
        f.write_str(s)
    }
}

impl InputType {
    /// Whether `value` matches this declared type without any coercion.
    pub fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Boolean => value.is_boolean(),
            InputType::Number => value.is_number(),
            InputType::Json => true,
        }
    }
}

/// One entry in an action manifest's `inputs` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDef {
    #[serde(rename = "type", default = "default_input_type")]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_input_type() -> InputType {
    InputType::String
}

/// How the action's process should be started. Corresponds to the `uses`
/// prefix style (`docker://`, `node12`, a bare interpreter name, or
/// nothing meaning "run the script directly").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunsConfig {
    /// Spawn a shell and run `command` through it.
    Shell { command: String },
    /// Run `entrypoint` under the named interpreter (e.g. `python3`,
    /// `node`), with `args` appended after the entrypoint path.
    Interpreter {
        interpreter: String,
        entrypoint: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Run a prebuilt executable directly, no shell or interpreter in
    /// between.
    Subprocess {
        executable: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Build and run a container image.
    Docker {
        image: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Parsed `action.yml` / `action.yaml` describing what an action does and
/// how to run it. `agent-catalog` is responsible for locating and parsing
/// the file on disk; this type only models its shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionManifest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDef>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub runs: RunsConfig,
}

impl ActionManifest {
    /// Applies declared defaults and checks required/type constraints for a
    /// caller-supplied input map, returning the fully resolved input set.
    ///
    /// Any key in `supplied` not present in `self.inputs` is rejected: the
    /// original agent is strict about this so that a typo in a pipeline
    /// file surfaces immediately rather than silently being ignored.
    pub fn resolve_inputs(
        &self,
        supplied: &BTreeMap<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, serde_json::Value>, crate::InputValidationError> {
        for key in supplied.keys() {
            if !self.inputs.contains_key(key) {
                return Err(crate::InputValidationError::Undeclared(key.clone()));
            }
        }

        let mut resolved = BTreeMap::new();
        for (name, def) in &self.inputs {
            match supplied.get(name) {
                Some(value) => {
                    if !def.input_type.matches(value) {
                        return Err(crate::InputValidationError::TypeMismatch {
                            name: name.clone(),
                            expected: def.input_type,
                            actual: value.to_string(),
                        });
                    }
                    resolved.insert(name.clone(), value.clone());
                }
                None => {
                    if let Some(default) = &def.default {
                        resolved.insert(name.clone(), default.clone());
                    } else if def.required {
                        return Err(crate::InputValidationError::MissingRequired(name.clone()));
                    }
                }
            }
        }
        Ok(resolved)
    }
}
