//! Runs a step's process, streams its output line by line, and extracts
//! the sentinel lines a step uses to set outputs for later steps.
//!
//! Output lines of the form `::<key>::<json-value>` are sentinel lines;
//! everything else is ordinary log output that gets forwarded as-is. This
//! is the wire convention actions use to report outputs back to the
//! runner, so a script only needs to print, never call back into the
//! agent.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// How long [`terminate`] waits after SIGTERM before escalating to
/// SIGKILL.
pub const TERMINATE_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait on child process: {0}")]
    Wait(#[source] std::io::Error),
}

/// One line of output read from a child, already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// A plain log line, forwarded to the log uploader unchanged.
    Log(String),
    /// A sentinel line setting output `key` to `value`.
    Sentinel { key: String, value: serde_json::Value },
}

/// Parses one line of raw process output. A sentinel line has exactly
/// three `::`-separated parts: an empty head, the output key, and a JSON
/// value. Anything else, including a malformed sentinel-looking line, is
/// treated as plain log output.
pub fn parse_output_line(line: &str) -> OutputLine {
    let parts: Vec<&str> = line.splitn(3, "::").collect();
    if parts.len() == 3 && parts[0].is_empty() && !parts[1].is_empty() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(parts[2]) {
            return OutputLine::Sentinel {
                key: parts[1].to_string(),
                value,
            };
        }
    }
    OutputLine::Log(line.to_string())
}

/// Parameters for spawning a step's process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// The fully collected outcome of running a process to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub duration: Duration,
}

/// Spawns `spec`, streams its combined stdout in line-delimited chunks
/// through `on_line`, and collects any sentinel lines as step outputs.
///
/// `on_line` is called for every line including sentinels; callers that
/// only want log text should match on [`OutputLine::Log`] themselves. This
/// keeps the line-upload cadence decision (batching, interval) entirely in
/// the caller, since that policy lives in `agent-step`.
pub async fn run_streaming<F>(
    spec: &SpawnSpec,
    mut on_line: F,
) -> Result<ProcessOutcome, ProcessError>
where
    F: FnMut(&OutputLine),
{
    let start = Instant::now();
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.working_dir)
        .envs(&spec.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut outputs = BTreeMap::new();

    loop {
        tokio::select! {
            line = stdout_lines.next_line() => {
                match line.map_err(ProcessError::Wait)? {
                    Some(text) => {
                        let parsed = parse_output_line(&text);
                        if let OutputLine::Sentinel { key, value } = &parsed {
                            outputs.insert(key.clone(), value.clone());
                        }
                        on_line(&parsed);
                    }
                    None => break,
                }
            }
            line = stderr_lines.next_line() => {
                match line.map_err(ProcessError::Wait)? {
                    Some(text) => on_line(&OutputLine::Log(text)),
                    None => continue,
                }
            }
        }
    }

    // Drain whichever stream still has buffered lines after the other closed.
    while let Some(text) = stdout_lines.next_line().await.map_err(ProcessError::Wait)? {
        let parsed = parse_output_line(&text);
        if let OutputLine::Sentinel { key, value } = &parsed {
            outputs.insert(key.clone(), value.clone());
        }
        on_line(&parsed);
    }
    while let Some(text) = stderr_lines.next_line().await.map_err(ProcessError::Wait)? {
        on_line(&OutputLine::Log(text));
    }

    let status = child.wait().await.map_err(ProcessError::Wait)?;

    Ok(ProcessOutcome {
        exit_code: status.code(),
        success: status.success(),
        outputs,
        duration: start.elapsed(),
    })
}

/// Terminates `child` gracefully: a SIGTERM on unix, followed by a bounded
/// wait, then a SIGKILL if it hasn't exited. Windows has no graceful
/// signal equivalent the process can ignore, so `Child::kill` is used
/// directly there.
pub async fn terminate(child: &mut Child) -> Result<(), ProcessError> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        let waited = tokio::time::timeout(TERMINATE_GRACE_PERIOD, child.wait()).await;
        if waited.is_err() {
            child.start_kill().map_err(ProcessError::Wait)?;
            child.wait().await.map_err(ProcessError::Wait)?;
        }
    }
    #[cfg(not(unix))]
    {
        child.start_kill().map_err(ProcessError::Wait)?;
        child.wait().await.map_err(ProcessError::Wait)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sentinel_line() {
        let parsed = parse_output_line("::build_path::\"/tmp/out\"");
        assert_eq!(
            parsed,
            OutputLine::Sentinel {
                key: "build_path".to_string(),
                value: serde_json::json!("/tmp/out"),
            }
        );
    }

    #[test]
    fn plain_log_line_is_not_a_sentinel() {
        let parsed = parse_output_line("building project...");
        assert_eq!(parsed, OutputLine::Log("building project...".to_string()));
    }

    #[test]
    fn malformed_sentinel_falls_back_to_log() {
        let parsed = parse_output_line("::not_json::{oops");
        assert_eq!(parsed, OutputLine::Log("::not_json::{oops".to_string()));
    }

    #[tokio::test]
    async fn run_streaming_captures_sentinel_outputs() {
        let spec = SpawnSpec {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo hello; echo '::greeting::\"hi\"'".to_string(),
            ],
            working_dir: std::env::temp_dir(),
            env: BTreeMap::new(),
        };
        let mut lines = Vec::new();
        let outcome = run_streaming(&spec, |line| lines.push(line.clone()))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(
            outcome.outputs.get("greeting"),
            Some(&serde_json::json!("hi"))
        );
        assert!(lines
            .iter()
            .any(|l| matches!(l, OutputLine::Log(s) if s == "hello")));
    }
}
