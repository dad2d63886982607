//! Shared domain types for the agent runtime.
//!
//! This crate has no behavior of its own beyond small, total functions on
//! plain data: action identifiers and their alias rewriting, action
//! manifests, the layered variable store steps read their inputs from, and
//! the state machines for jobs and steps. Every other crate in the
//! workspace depends on this one; it must not depend on any of them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

mod identifier;
mod manifest;
mod variables;

pub use identifier::{ActionIdentifier, ParseIdentifierError};
pub use manifest::{ActionManifest, InputDef, InputType, RunsConfig};
pub use variables::Variables;

/// Lifecycle states a job can be in.
///
/// Mirrors the states the dispatch side needs to report back to the
/// coordinator; there is no `Paused` state, jobs run to completion or are
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Passed => "passed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle states a single step within a job can be in.
///
/// `Skipped` covers both an explicit `if:` condition that evaluated false
/// and a step that was never reached because an earlier required step
/// failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Passed => "passed",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
            StepState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl StepState {
    /// Whether this state is terminal (the step will not transition again).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Passed | StepState::Failed | StepState::Skipped | StepState::Cancelled
        )
    }

    /// Whether this state counts as a successful outcome for `continue-on`
    /// evaluation in a parent job.
    pub fn is_success(self) -> bool {
        matches!(self, StepState::Passed | StepState::Skipped)
    }
}

/// A single step within a job, as declared in pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Stable identifier for the step, unique within its job. Used as the
    /// cache namespace and in log correlation; defaults to a slugified
    /// `name` if omitted in source configuration, but by the time a
    /// `StepSpec` is constructed it is always present.
    pub id: String,
    pub name: String,
    pub uses: ActionIdentifier,
    /// Raw, unresolved input values. Template expressions inside these are
    /// resolved against `Variables` by `agent-template` at run time, not
    /// here.
    #[serde(default)]
    pub with: BTreeMap<String, serde_json::Value>,
    /// Environment variables merged in above the job's own environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// When false, a failure of this step fails the whole job. When true,
    /// the job continues regardless of this step's outcome.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Optional condition expression; the job runner evaluates this against
    /// `Variables` before running the step and marks it `Skipped` if false.
    #[serde(default)]
    pub condition: Option<String>,
}

/// A job: an ordered sequence of steps sharing one working directory and
/// one set of base variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub name: String,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Errors surfaced while validating configuration before a job or step can
/// run. These are never retried; they indicate the pipeline definition
/// itself is wrong.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("pipeline defines no steps")]
    EmptyPipeline,
    #[error("duplicate step id `{0}` within job `{1}`")]
    DuplicateStepId(String, String),
    #[error("failed to parse pipeline configuration: {0}")]
    Parse(String),
}

/// Errors surfaced while coercing a caller-supplied input value against an
/// action's declared input schema.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InputValidationError {
    #[error("required input `{0}` was not provided")]
    MissingRequired(String),
    #[error("input `{name}` expected type {expected}, got `{actual}`")]
    TypeMismatch {
        name: String,
        expected: InputType,
        actual: String,
    },
    #[error("input `{0}` is not declared by the action manifest")]
    Undeclared(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_state_terminal() {
        assert!(StepState::Passed.is_terminal());
        assert!(StepState::Failed.is_terminal());
        assert!(StepState::Skipped.is_terminal());
        assert!(!StepState::Running.is_terminal());
        assert!(!StepState::Pending.is_terminal());
    }

    #[test]
    fn step_state_success() {
        assert!(StepState::Passed.is_success());
        assert!(StepState::Skipped.is_success());
        assert!(!StepState::Failed.is_success());
        assert!(!StepState::Cancelled.is_success());
    }

    #[test]
    fn job_state_display() {
        assert_eq!(JobState::Running.to_string(), "running");
        assert_eq!(JobState::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn job_spec_round_trips_through_json() {
        let job = JobSpec {
            id: "job-1".into(),
            name: "build".into(),
            env: BTreeMap::new(),
            steps: vec![StepSpec {
                id: "checkout".into(),
                name: "Checkout".into(),
                uses: "datatorch/checkout@v1".parse().unwrap(),
                with: BTreeMap::new(),
                env: BTreeMap::new(),
                continue_on_error: false,
                condition: None,
            }],
        };
        let json = serde_json::to_string(&job).unwrap();
        let back: JobSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.steps[0].id, "checkout");
    }
}
