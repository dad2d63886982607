//! Reconnect-with-backoff supervisor sitting between a [`Transport`] and
//! [`agent_job::run`].
//!
//! The loop has two nested levels: the outer level reconnects the
//! transport itself after a transient failure; the inner level receives
//! jobs off an established connection and spawns each one as an
//! independent concurrent task, until the connection drops, at which
//! point it falls back out to reconnect. A fatal transport error (bad
//! credentials, protocol mismatch) ends the loop entirely rather than
//! retrying forever against a connection that will never succeed.
//!
//! Dispatch never blocks on a job's completion: receiving the next job and
//! running the previous one happen concurrently. Every job spawned against
//! a connection is tracked in that connection's active-job set so that a
//! disconnect — or agent shutdown — can cancel whatever is still in
//! flight instead of leaving it to run against a transport that is no
//! longer there to hear about it.

use std::sync::Arc;

use agent_cache::ActionCache;
use agent_catalog::FetchCache;
use agent_config::AgentDirectory;
use agent_events::{Event, EventKind, EventLog};
use agent_job::JobEnvironment;
use agent_retry::{next_delay, BackoffConfig};
use agent_transport::{JobEnvelope, StatusUpdate, Transport, TransportError};
use agent_types::{JobState, Variables};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("transport rejected the agent permanently: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub backoff: BackoffConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::dispatch_reconnect(),
        }
    }
}

/// Resources the dispatch loop needs to hand each job down to `agent-job`.
/// Held behind `Arc` rather than borrowed, since each received job is
/// spawned as its own task and needs its own `'static` handle onto them.
#[derive(Clone)]
pub struct DispatchContext {
    pub directory: Arc<AgentDirectory>,
    pub fetch_cache: Arc<FetchCache>,
    pub action_cache: Arc<ActionCache>,
}

/// How a connection's job-receive loop ended.
enum DrainOutcome {
    /// The transport dropped the connection, cleanly or transiently; the
    /// caller should reconnect with backoff.
    Disconnected,
    /// `cancellation` fired; the caller should stop entirely.
    Cancelled,
    /// The transport reported a fatal, non-retryable error.
    Fatal(String),
}

/// Runs the reconnect/dispatch loop until `cancellation` fires or the
/// transport reports a fatal error. Returns `Ok(())` on a clean,
/// cancellation-triggered shutdown.
pub async fn run<T: Transport>(
    transport: &mut T,
    config: &DispatchConfig,
    context: &DispatchContext,
    cancellation: CancellationToken,
) -> Result<(), DispatchError> {
    let mut attempt: u32 = 0;

    while !cancellation.is_cancelled() {
        match transport.connect().await {
            Ok(()) => attempt = 0,
            Err(TransportError::Fatal(msg)) => return Err(DispatchError::Fatal(msg)),
            Err(TransportError::Transient(msg)) => {
                attempt += 1;
                tracing::warn!(attempt, error = %msg, "failed to connect, backing off");
                tokio::time::sleep(next_delay(&config.backoff, attempt)).await;
                continue;
            }
        }

        match drain_connection(transport, context, &cancellation).await {
            DrainOutcome::Cancelled => return Ok(()),
            DrainOutcome::Fatal(msg) => return Err(DispatchError::Fatal(msg)),
            DrainOutcome::Disconnected => {}
        }

        if cancellation.is_cancelled() {
            return Ok(());
        }
        attempt += 1;
        let delay = next_delay(&config.backoff, attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
    }

    Ok(())
}

/// Receives jobs from an already-connected transport, spawning each into
/// this connection's active-job set rather than awaiting it inline, so
/// receiving the next job never waits on a previous one finishing.
///
/// Status updates from those concurrently-running jobs can't be sent
/// straight to `transport`, since only one task may hold it at a time;
/// instead job tasks forward updates over a channel, and this loop is the
/// sole place that actually calls `transport.send_status`.
///
/// Whatever ends the loop — disconnect, cancellation, or a fatal error —
/// every job still in the active set is cancelled and drained before this
/// function returns, so the caller never has to reconcile jobs still
/// running against a connection that's already gone.
async fn drain_connection<T: Transport>(
    transport: &mut T,
    context: &DispatchContext,
    cancellation: &CancellationToken,
) -> DrainOutcome {
    let connection_cancellation = cancellation.child_token();
    let mut active: JoinSet<()> = JoinSet::new();
    let (status_tx, mut status_rx) = mpsc::channel::<StatusUpdate>(64);

    let outcome = loop {
        tokio::select! {
            biased;

            _ = cancellation.cancelled() => {
                break DrainOutcome::Cancelled;
            }

            job = transport.next_job() => {
                match job {
                    Ok(Some(envelope)) => {
                        active.spawn(run_job_task(
                            envelope,
                            context.clone(),
                            status_tx.clone(),
                            connection_cancellation.child_token(),
                        ));
                    }
                    Ok(None) => break DrainOutcome::Disconnected,
                    Err(TransportError::Fatal(msg)) => break DrainOutcome::Fatal(msg),
                    Err(TransportError::Transient(msg)) => {
                        tracing::warn!(error = %msg, "transport dropped, will reconnect");
                        break DrainOutcome::Disconnected;
                    }
                }
            }

            Some(joined) = active.join_next(), if !active.is_empty() => {
                if let Err(err) = joined {
                    tracing::warn!(error = %err, "job task panicked");
                }
            }

            Some(update) = status_rx.recv() => {
                if let Err(err) = transport.send_status(update).await {
                    tracing::warn!(error = %err, "failed to report status, continuing");
                }
            }
        }
    };

    // Whatever caused the loop to end, nothing still in the active set
    // should keep running against this connection.
    connection_cancellation.cancel();
    drop(status_tx);
    loop {
        if active.is_empty() {
            match status_rx.recv().await {
                Some(update) => {
                    let _ = transport.send_status(update).await;
                }
                None => break,
            }
            continue;
        }
        tokio::select! {
            joined = active.join_next() => {
                if let Some(Err(err)) = joined {
                    tracing::warn!(error = %err, "job task panicked during drain");
                }
            }
            Some(update) = status_rx.recv() => {
                let _ = transport.send_status(update).await;
            }
        }
    }

    outcome
}

/// Runs one job to completion, reporting status over `status_tx` rather
/// than touching the transport directly. Errors from the job runner are
/// logged and otherwise swallowed: one job failing is not a dispatch-level
/// failure, and the job's own terminal status update already carries the
/// failure to the coordinator.
async fn run_job_task(
    envelope: JobEnvelope,
    context: DispatchContext,
    status_tx: mpsc::Sender<StatusUpdate>,
    cancellation: CancellationToken,
) {
    let job_id = envelope.job.id.clone();
    let workdir = context.directory.job_workdir(&job_id);
    let actions_dir = context.directory.actions_dir();
    std::fs::create_dir_all(&workdir).ok();

    let mut vars = Variables::new();
    vars.push_layer(envelope.variables.clone().into_iter().collect());

    let env = JobEnvironment {
        action_dir_root: &actions_dir,
        job_workdir: &workdir,
        fetch_cache: context.fetch_cache.as_ref(),
        action_cache: context.action_cache.as_ref(),
    };

    let mut events = EventLog::new();
    events.record(Event {
        timestamp: Utc::now(),
        job_id: job_id.clone(),
        kind: EventKind::JobStarted,
    });

    send_status(
        &status_tx,
        StatusUpdate::JobState {
            job_id: job_id.clone(),
            state: JobState::Running,
        },
    )
    .await;

    let outcome = match agent_job::run(
        &envelope.job,
        vars,
        &env,
        &mut events,
        cancellation,
        |step_id, _line| {
            tracing::debug!(job_id = %job_id, step_id, "job output line");
        },
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::warn!(job_id = %job_id, error = %err, "job run failed");
            return;
        }
    };

    for step in &outcome.steps {
        send_status(
            &status_tx,
            StatusUpdate::StepState {
                job_id: job_id.clone(),
                step_id: step.step_id.clone(),
                state: step.state,
            },
        )
        .await;
    }

    send_status(
        &status_tx,
        StatusUpdate::JobState {
            job_id: job_id.clone(),
            state: outcome.state,
        },
    )
    .await;

    if let Err(err) = events.flush(&agent_events::events_path(&context.directory.events_dir())) {
        tracing::warn!(job_id = %job_id, error = %err, "failed to flush job events");
    }
}

async fn send_status(tx: &mpsc::Sender<StatusUpdate>, update: StatusUpdate) {
    if tx.send(update).await.is_err() {
        tracing::warn!("status channel closed, dropping update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_types::JobSpec;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct ScriptedTransport {
        connects: VecDeque<Result<(), TransportError>>,
        jobs: VecDeque<Result<Option<JobEnvelope>, TransportError>>,
        statuses: Vec<StatusUpdate>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            self.connects
                .pop_front()
                .unwrap_or(Err(TransportError::Fatal("exhausted script".to_string())))
        }

        async fn next_job(&mut self) -> Result<Option<JobEnvelope>, TransportError> {
            // Yields to the executor on every poll so job tasks spawned
            // off a previous iteration get a chance to run before the
            // next scripted response is delivered.
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.jobs
                .pop_front()
                .unwrap_or(Err(TransportError::Fatal("exhausted script".to_string())))
        }

        async fn send_status(&mut self, update: StatusUpdate) -> Result<(), TransportError> {
            self.statuses.push(update);
            Ok(())
        }
    }

    fn test_context(dir: &std::path::Path) -> DispatchContext {
        DispatchContext {
            directory: Arc::new(AgentDirectory::new(dir)),
            fetch_cache: Arc::new(FetchCache::new()),
            action_cache: Arc::new(ActionCache::new()),
        }
    }

    fn empty_job(id: &str) -> JobSpec {
        JobSpec {
            id: id.to_string(),
            name: id.to_string(),
            steps: vec![agent_types::StepSpec {
                id: "only".to_string(),
                name: "only".to_string(),
                uses: "acme/noop@v1".parse().unwrap(),
                with: Default::default(),
                env: Default::default(),
                continue_on_error: false,
                condition: Some("false".to_string()),
            }],
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn fatal_transport_error_ends_the_loop_after_draining_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());

        let mut transport = ScriptedTransport {
            connects: VecDeque::from([Ok(())]),
            jobs: VecDeque::from([
                Ok(Some(JobEnvelope {
                    job: empty_job("j1"),
                    variables: Default::default(),
                })),
                Err(TransportError::Fatal("auth revoked".to_string())),
            ]),
            statuses: Vec::new(),
        };

        let err = run(
            &mut transport,
            &DispatchConfig::default(),
            &context,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DispatchError::Fatal(_)));
        assert!(transport
            .statuses
            .iter()
            .any(|s| matches!(s, StatusUpdate::JobState { state: JobState::Passed, .. })));
    }

    #[tokio::test]
    async fn transient_disconnect_reconnects_instead_of_ending_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());

        let mut transport = ScriptedTransport {
            connects: VecDeque::from([Ok(()), Ok(())]),
            jobs: VecDeque::from([
                Ok(None),
                Err(TransportError::Fatal("auth revoked".to_string())),
            ]),
            statuses: Vec::new(),
        };

        let err = run(
            &mut transport,
            &DispatchConfig::default(),
            &context,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DispatchError::Fatal(_)));
        // Both scripted connect attempts were consumed: the clean close
        // triggered a reconnect rather than ending the loop on the spot.
        assert!(transport.connects.is_empty());
    }

    #[tokio::test]
    async fn jobs_are_received_concurrently_with_a_previous_job_running() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());

        let mut transport = ScriptedTransport {
            connects: VecDeque::from([Ok(())]),
            jobs: VecDeque::from([
                Ok(Some(JobEnvelope {
                    job: empty_job("j1"),
                    variables: Default::default(),
                })),
                Ok(Some(JobEnvelope {
                    job: empty_job("j2"),
                    variables: Default::default(),
                })),
                Err(TransportError::Fatal("auth revoked".to_string())),
            ]),
            statuses: Vec::new(),
        };

        let err = run(
            &mut transport,
            &DispatchConfig::default(),
            &context,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DispatchError::Fatal(_)));
        for id in ["j1", "j2"] {
            assert!(transport.statuses.iter().any(|s| matches!(
                s,
                StatusUpdate::JobState { job_id, state: JobState::Passed } if job_id == id
            )));
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());

        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let mut transport = ScriptedTransport {
            connects: VecDeque::new(),
            jobs: VecDeque::new(),
            statuses: Vec::new(),
        };

        let result = run(
            &mut transport,
            &DispatchConfig::default(),
            &context,
            cancellation,
        )
        .await;
        assert!(result.is_ok());
    }
}
