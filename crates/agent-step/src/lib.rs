//! Executes a single step: resolve its condition, fetch its action,
//! template its inputs, run its process, and report the outcome.
//!
//! Log lines produced by the step's process are batched for upload rather
//! than sent one at a time. A batch is flushed whenever either
//! [`LOG_FLUSH_INTERVAL`] elapses or [`LogBatcher::LINE_THRESHOLD`] lines
//! have accumulated, whichever comes first; the interval keeps a slow,
//! chatty step's log visible promptly, and the size threshold keeps a
//! fast, very chatty step from building an unbounded buffer between
//! interval ticks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agent_cache::{cache_key, ActionCache, CachedAction};
use agent_catalog::FetchCache;
use agent_process::{run_streaming, OutputLine, SpawnSpec};
use agent_runner::build_spawn_spec;
use agent_types::{StepSpec, StepState, Variables};

pub const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("failed to evaluate step condition: {0}")]
    Condition(#[from] agent_template::TemplateError),
    #[error("failed to resolve action: {0}")]
    Fetch(#[from] agent_catalog::CatalogFetchError),
    #[error("failed to validate step inputs: {0}")]
    InputValidation(#[from] agent_types::InputValidationError),
    #[error("failed to build process spawn spec: {0}")]
    Runner(#[from] agent_runner::RunnerError),
    #[error("failed to run step process: {0}")]
    Process(#[from] agent_process::ProcessError),
}

/// Accumulates log lines for a step, signaling when the caller should
/// flush them to the coordinator.
#[derive(Debug, Default)]
pub struct LogBatcher {
    buffer: Vec<String>,
}

impl LogBatcher {
    /// Flush after this many lines even if the flush interval hasn't
    /// elapsed yet.
    pub const LINE_THRESHOLD: usize = 2;

    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a line, returning `true` if the buffer has reached the size
    /// threshold and should be flushed immediately.
    pub fn push(&mut self, line: String) -> bool {
        self.buffer.push(line);
        self.buffer.len() >= Self::LINE_THRESHOLD
    }

    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.buffer)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Outcome of running one step to completion.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub state: StepState,
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub duration: Duration,
}

/// Everything [`execute`] needs beyond the step definition itself.
pub struct StepEnvironment<'a> {
    pub action_dir_root: &'a Path,
    pub job_workdir: &'a Path,
    pub fetch_cache: &'a FetchCache,
    pub action_cache: &'a ActionCache,
}

/// Runs `step` to completion against `vars`, streaming log lines through
/// `on_line`.
///
/// `on_line` receives every line, including sentinel output lines; callers
/// that only want human-readable log text should filter on
/// [`OutputLine::Log`] themselves, same as `agent_process::run_streaming`.
pub async fn execute<F>(
    step: &StepSpec,
    vars: &Variables,
    env: &StepEnvironment<'_>,
    mut on_line: F,
) -> Result<StepOutcome, StepError>
where
    F: FnMut(&OutputLine),
{
    if let Some(condition) = &step.condition {
        let rendered = agent_template::render(condition, vars)?;
        if !is_truthy_string(&rendered) {
            return Ok(StepOutcome {
                state: StepState::Skipped,
                outputs: BTreeMap::new(),
                duration: Duration::ZERO,
            });
        }
    }

    let rendered_with = render_with_block(&step.with, vars)?;

    let (action_dir, manifest) = resolve_action(step, env, &rendered_with)?;

    let resolved_inputs = manifest.resolve_inputs(&rendered_with)?;

    let mut process_env: BTreeMap<String, String> = vars.flatten_to_env();
    process_env.extend(step.env.clone());
    for (key, value) in &resolved_inputs {
        process_env.insert(format!("INPUT_{}", key.to_uppercase()), value_to_env(value));
    }

    let working_dir = env.job_workdir.join(&step.id);
    std::fs::create_dir_all(&working_dir).ok();

    let spawn_spec: SpawnSpec = build_spawn_spec(&manifest.runs, &action_dir, &working_dir, process_env)?;

    let outcome = run_streaming(&spawn_spec, |line| on_line(line)).await?;

    let state = if outcome.success {
        StepState::Passed
    } else if step.continue_on_error {
        StepState::Passed
    } else {
        StepState::Failed
    };

    Ok(StepOutcome {
        state,
        outputs: outcome.outputs,
        duration: outcome.duration,
    })
}

fn resolve_action(
    step: &StepSpec,
    env: &StepEnvironment<'_>,
    rendered_with: &BTreeMap<String, serde_json::Value>,
) -> Result<(PathBuf, agent_types::ActionManifest), StepError> {
    let git_url = step.uses.git_url();
    let declared: Vec<String> = rendered_with.keys().cloned().collect();
    let key = cache_key(&git_url, step.uses.version(), rendered_with, &declared);

    if !step.uses.is_latest() {
        if let Some(cached) = env.action_cache.get(&key) {
            if let Ok(manifest) = agent_catalog::load_manifest(&cached.local_path) {
                return Ok((cached.local_path, manifest));
            }
        }
    }

    let (action_dir, manifest) =
        agent_catalog::resolve(&step.uses, env.action_dir_root, env.fetch_cache)?;

    if !step.uses.is_latest() {
        env.action_cache.insert(
            key,
            CachedAction {
                local_path: action_dir.clone(),
            },
        );
    }

    Ok((action_dir, manifest))
}

fn render_with_block(
    with: &BTreeMap<String, serde_json::Value>,
    vars: &Variables,
) -> Result<BTreeMap<String, serde_json::Value>, StepError> {
    let mut rendered = BTreeMap::new();
    for (key, value) in with {
        let new_value = match value {
            serde_json::Value::String(s) => {
                serde_json::Value::String(agent_template::render(s, vars)?)
            }
            other => other.clone(),
        };
        rendered.insert(key.clone(), new_value);
    }
    Ok(rendered)
}

fn value_to_env(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_truthy_string(s: &str) -> bool {
    !matches!(s.trim(), "" | "false" | "0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_batcher_signals_at_threshold() {
        let mut batcher = LogBatcher::new();
        assert!(!batcher.push("one".to_string()));
        assert!(batcher.push("two".to_string()));
        let lines = batcher.take();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn is_truthy_string_rules() {
        assert!(!is_truthy_string(""));
        assert!(!is_truthy_string("false"));
        assert!(!is_truthy_string("0"));
        assert!(is_truthy_string("true"));
        assert!(is_truthy_string("1"));
        assert!(is_truthy_string("anything"));
    }

    #[tokio::test]
    async fn skipped_when_condition_is_falsy() {
        let step = StepSpec {
            id: "s1".to_string(),
            name: "maybe".to_string(),
            uses: "acme/noop@v1".parse().unwrap(),
            with: BTreeMap::new(),
            env: BTreeMap::new(),
            continue_on_error: false,
            condition: Some("false".to_string()),
        };
        let vars = Variables::new();
        let dir = tempfile::tempdir().unwrap();
        let fetch_cache = FetchCache::new();
        let action_cache = ActionCache::new();
        let env = StepEnvironment {
            action_dir_root: dir.path(),
            job_workdir: dir.path(),
            fetch_cache: &fetch_cache,
            action_cache: &action_cache,
        };
        let outcome = execute(&step, &vars, &env, |_| {}).await.unwrap();
        assert_eq!(outcome.state, StepState::Skipped);
    }
}
