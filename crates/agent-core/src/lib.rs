//! Binds configuration, the websocket transport, the dispatch supervisor,
//! and the telemetry sampler into one runnable agent.
//!
//! This crate owns no domain logic of its own; it is the composition root
//! `agent-cli` drives, the way `shipper`'s top-level crate binds its
//! modules together for `shipper-cli` without re-implementing any of
//! them.

use agent_cache::ActionCache;
use agent_catalog::FetchCache;
use agent_config::{AgentConfig, AgentDirectory};
use agent_dispatch::{DispatchConfig, DispatchContext, DispatchError};
use agent_transport::WebSocketTransport;
use agent_types::StepState;
use tokio_util::sync::CancellationToken;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to prepare agent data directory at `{path}`: {source}")]
    PrepareDataDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Host identity reported to the coordinator on connect.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub hostname: String,
    pub facts: agent_telemetry::HostFacts,
}

pub struct Agent {
    config: AgentConfig,
    directory: AgentDirectory,
}

impl Agent {
    /// Prepares the agent's on-disk layout and returns a handle ready to
    /// [`run`](Agent::run).
    pub fn bootstrap(config: AgentConfig) -> Result<Self, AgentError> {
        let directory = config.directory();
        for dir in [
            directory.actions_dir(),
            directory.events_dir(),
            directory.root().join("jobs"),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| AgentError::PrepareDataDir {
                path: dir,
                source,
            })?;
        }
        Ok(Self { config, directory })
    }

    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            facts: agent_telemetry::host_facts(AGENT_VERSION),
        }
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    /// Runs the agent until `cancellation` fires or the transport reports
    /// a fatal, non-retryable error. The telemetry sampling loop runs
    /// alongside dispatch and is aborted once dispatch returns, since it
    /// has no useful work left to report once the agent is shutting down.
    pub async fn run(&self, cancellation: CancellationToken) -> Result<(), AgentError> {
        let mut transport = WebSocketTransport::new(self.config.host.clone(), self.config.token.clone());
        let context = DispatchContext {
            directory: std::sync::Arc::new(self.directory.clone()),
            fetch_cache: std::sync::Arc::new(FetchCache::new()),
            action_cache: std::sync::Arc::new(ActionCache::new()),
        };

        let telemetry_cancel = cancellation.clone();
        let telemetry_handle = tokio::spawn(async move {
            tokio::select! {
                _ = agent_telemetry::run_sampling_loop(|sample| {
                    tracing::info!(
                        cpu_usage = sample.cpu_usage,
                        memory_usage = sample.memory_usage,
                        "resource sample"
                    );
                }) => {}
                _ = telemetry_cancel.cancelled() => {}
            }
        });

        let result = agent_dispatch::run(
            &mut transport,
            &DispatchConfig::default(),
            &context,
            cancellation,
        )
        .await;

        telemetry_handle.abort();
        result.map_err(AgentError::from)
    }
}

/// Summarizes a job outcome's step results as exit-code-worthy counts, for
/// `agent-cli` to report without re-deriving the same match arms itself.
pub fn summarize_steps(steps: &[agent_job::StepResult]) -> (usize, usize, usize) {
    let mut passed = 0;
    let mut failed = 0;
    let mut skipped = 0;
    for step in steps {
        match step.state {
            StepState::Passed => passed += 1,
            StepState::Failed => failed += 1,
            StepState::Skipped | StepState::Cancelled => skipped += 1,
            StepState::Pending | StepState::Running => {}
        }
    }
    (passed, failed, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            host: "wss://example.invalid/agent".to_string(),
            token: "test-token".to_string(),
            data_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn bootstrap_creates_expected_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let agent = Agent::bootstrap(config).unwrap();
        assert!(agent.directory().actions_dir().is_dir());
        assert!(agent.directory().events_dir().is_dir());
    }

    #[test]
    fn identity_reports_nonempty_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::bootstrap(test_config(dir.path())).unwrap();
        let identity = agent.identity();
        assert!(!identity.hostname.is_empty());
        assert_eq!(identity.facts.agent_version, AGENT_VERSION);
    }

    #[test]
    fn summarize_steps_counts_each_state() {
        let steps = vec![
            agent_job::StepResult {
                step_id: "a".to_string(),
                state: StepState::Passed,
                outputs: Default::default(),
                duration: std::time::Duration::ZERO,
            },
            agent_job::StepResult {
                step_id: "b".to_string(),
                state: StepState::Failed,
                outputs: Default::default(),
                duration: std::time::Duration::ZERO,
            },
            agent_job::StepResult {
                step_id: "c".to_string(),
                state: StepState::Skipped,
                outputs: Default::default(),
                duration: std::time::Duration::ZERO,
            },
        ];
        assert_eq!(summarize_steps(&steps), (1, 1, 1));
    }
}
