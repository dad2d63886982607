//! Runs a job: its steps in declared order, each step's outputs folded
//! into the variable set the next step templates against.
//!
//! A job stops advancing through its steps as soon as one fails without
//! `continue_on_error`; every step after that point is marked
//! [`StepState::Skipped`] rather than left `Pending`, so a caller
//! inspecting the final `JobOutcome` never has to treat "missing" and
//! "skipped" as different things.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use agent_catalog::FetchCache;
use agent_cache::ActionCache;
use agent_events::{Event, EventKind, EventLog};
use agent_process::OutputLine;
use agent_step::StepEnvironment;
use agent_types::{ConfigError, JobSpec, JobState, StepState, Variables};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    pub state: StepState,
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub state: JobState,
    pub steps: Vec<StepResult>,
    pub duration: Duration,
}

fn validate(job: &JobSpec) -> Result<(), ConfigError> {
    if job.steps.is_empty() {
        return Err(ConfigError::EmptyPipeline);
    }
    let mut seen = std::collections::HashSet::new();
    for step in &job.steps {
        if !seen.insert(&step.id) {
            return Err(ConfigError::DuplicateStepId(step.id.clone(), job.id.clone()));
        }
    }
    Ok(())
}

/// Resources a job run needs beyond the job definition itself.
pub struct JobEnvironment<'a> {
    pub action_dir_root: &'a std::path::Path,
    pub job_workdir: &'a std::path::Path,
    pub fetch_cache: &'a FetchCache,
    pub action_cache: &'a ActionCache,
}

/// Runs every step of `job` in order. `on_line` is called with the owning
/// step's id alongside each output line, so a caller can route log upload
/// per step.
pub async fn run<F>(
    job: &JobSpec,
    mut vars: Variables,
    env: &JobEnvironment<'_>,
    events: &mut EventLog,
    cancellation: CancellationToken,
    mut on_line: F,
) -> Result<JobOutcome, JobError>
where
    F: FnMut(&str, &OutputLine),
{
    validate(job)?;

    let start = Instant::now();
    events.record(Event {
        timestamp: Utc::now(),
        job_id: job.id.clone(),
        kind: EventKind::JobStarted,
    });

    let mut job_env_layer = BTreeMap::new();
    for (k, v) in &job.env {
        job_env_layer.insert(k.clone(), serde_json::Value::String(v.clone()));
    }
    vars.push_layer(job_env_layer);

    let mut results = Vec::with_capacity(job.steps.len());
    let mut steps_so_far = serde_json::Map::new();
    let mut job_failed = false;

    for step in &job.steps {
        if job_failed || cancellation.is_cancelled() {
            let state = if cancellation.is_cancelled() {
                StepState::Cancelled
            } else {
                StepState::Skipped
            };
            results.push(StepResult {
                step_id: step.id.clone(),
                state,
                outputs: BTreeMap::new(),
                duration: Duration::ZERO,
            });
            continue;
        }

        events.record(Event {
            timestamp: Utc::now(),
            job_id: job.id.clone(),
            kind: EventKind::StepStarted {
                step_id: step.id.clone(),
            },
        });

        let step_env = StepEnvironment {
            action_dir_root: env.action_dir_root,
            job_workdir: env.job_workdir,
            fetch_cache: env.fetch_cache,
            action_cache: env.action_cache,
        };

        let outcome = match agent_step::execute(step, &vars, &step_env, |line| {
            on_line(&step.id, line)
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(step_id = %step.id, error = %err, "step execution failed");
                agent_step::StepOutcome {
                    state: StepState::Failed,
                    outputs: BTreeMap::new(),
                    duration: Duration::ZERO,
                }
            }
        };

        steps_so_far.insert(
            step.id.clone(),
            serde_json::json!({
                "outputs": outcome.outputs,
                "state": outcome.state.to_string(),
            }),
        );
        let mut step_layer = BTreeMap::new();
        step_layer.insert(
            "steps".to_string(),
            serde_json::Value::Object(steps_so_far.clone()),
        );
        vars.push_layer(step_layer);

        if outcome.state == StepState::Failed && !step.continue_on_error {
            job_failed = true;
        }

        events.record(Event {
            timestamp: Utc::now(),
            job_id: job.id.clone(),
            kind: EventKind::StepFinished {
                step_id: step.id.clone(),
                state: outcome.state.to_string(),
            },
        });

        results.push(StepResult {
            step_id: step.id.clone(),
            state: outcome.state,
            outputs: outcome.outputs,
            duration: outcome.duration,
        });
    }

    let final_state = if cancellation.is_cancelled() {
        JobState::Cancelled
    } else if job_failed {
        JobState::Failed
    } else {
        JobState::Passed
    };

    events.record(Event {
        timestamp: Utc::now(),
        job_id: job.id.clone(),
        kind: EventKind::JobFinished {
            state: final_state.to_string(),
        },
    });

    Ok(JobOutcome {
        state: final_state,
        steps: results,
        duration: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_types::StepSpec;

    fn step(id: &str) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            name: id.to_string(),
            uses: "acme/noop@v1".parse().unwrap(),
            with: BTreeMap::new(),
            env: BTreeMap::new(),
            continue_on_error: false,
            condition: Some("false".to_string()),
        }
    }

    #[test]
    fn validate_rejects_empty_pipeline() {
        let job = JobSpec {
            id: "j1".to_string(),
            name: "job".to_string(),
            steps: vec![],
            env: BTreeMap::new(),
        };
        assert!(matches!(validate(&job), Err(ConfigError::EmptyPipeline)));
    }

    #[test]
    fn validate_rejects_duplicate_step_ids() {
        let job = JobSpec {
            id: "j1".to_string(),
            name: "job".to_string(),
            steps: vec![step("dup"), step("dup")],
            env: BTreeMap::new(),
        };
        assert!(matches!(
            validate(&job),
            Err(ConfigError::DuplicateStepId(_, _))
        ));
    }

    #[tokio::test]
    async fn all_steps_skipped_by_condition_still_passes_job() {
        let job = JobSpec {
            id: "j1".to_string(),
            name: "job".to_string(),
            steps: vec![step("a"), step("b")],
            env: BTreeMap::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let fetch_cache = FetchCache::new();
        let action_cache = ActionCache::new();
        let env = JobEnvironment {
            action_dir_root: dir.path(),
            job_workdir: dir.path(),
            fetch_cache: &fetch_cache,
            action_cache: &action_cache,
        };
        let mut events = EventLog::new();
        let outcome = run(
            &job,
            Variables::new(),
            &env,
            &mut events,
            CancellationToken::new(),
            |_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(outcome.state, JobState::Passed);
        assert!(outcome.steps.iter().all(|s| s.state == StepState::Skipped));
    }
}
