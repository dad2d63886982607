//! Turns an action's declared `runs:` configuration into a concrete
//! [`SpawnSpec`] agent-process can execute.
//!
//! This is a translation layer only: it owns no process lifecycle itself.
//! Each `RunsConfig` variant maps to exactly one spawn shape, dispatching
//! on the action's `using` field to pick the right process shape.

use std::path::{Path, PathBuf};

use agent_process::SpawnSpec;
use agent_types::RunsConfig;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("interpreter `{0}` was not found on PATH")]
    InterpreterNotFound(String),
    #[error("docker was not found on PATH, but an action declared a docker runner")]
    DockerNotFound,
    #[error("entrypoint `{0}` does not exist in the action's directory")]
    EntrypointMissing(PathBuf),
}

/// The shell used for `RunsConfig::Shell`. Unix actions run under `sh -c`;
/// on Windows there is no universal POSIX shell, so `cmd /C` is used
/// instead.
#[cfg(unix)]
const SHELL_PROGRAM: &str = "sh";
#[cfg(not(unix))]
const SHELL_PROGRAM: &str = "cmd";

#[cfg(unix)]
fn shell_args(command: &str) -> Vec<String> {
    vec!["-c".to_string(), command.to_string()]
}
#[cfg(not(unix))]
fn shell_args(command: &str) -> Vec<String> {
    vec!["/C".to_string(), command.to_string()]
}

/// Builds the process spawn spec for `runs`, resolving any relative paths
/// (an interpreter entrypoint, a subprocess executable) against
/// `action_dir`. The process itself runs with `working_dir` as its current
/// directory, which is ordinarily the job's scratch directory, not the
/// action's own directory.
pub fn build_spawn_spec(
    runs: &RunsConfig,
    action_dir: &Path,
    working_dir: &Path,
    env: std::collections::BTreeMap<String, String>,
) -> Result<SpawnSpec, RunnerError> {
    match runs {
        RunsConfig::Shell { command } => Ok(SpawnSpec {
            program: SHELL_PROGRAM.to_string(),
            args: shell_args(command),
            working_dir: working_dir.to_path_buf(),
            env,
        }),
        RunsConfig::Interpreter {
            interpreter,
            entrypoint,
            args,
        } => {
            which::which(interpreter)
                .map_err(|_| RunnerError::InterpreterNotFound(interpreter.clone()))?;
            let entrypoint_path = resolve_in_action_dir(action_dir, entrypoint);
            if !entrypoint_path.is_file() {
                return Err(RunnerError::EntrypointMissing(entrypoint_path));
            }
            let mut full_args = vec![entrypoint_path.to_string_lossy().into_owned()];
            full_args.extend(args.iter().cloned());
            Ok(SpawnSpec {
                program: interpreter.clone(),
                args: full_args,
                working_dir: working_dir.to_path_buf(),
                env,
            })
        }
        RunsConfig::Subprocess { executable, args } => {
            let executable_path = resolve_in_action_dir(action_dir, executable);
            let program = if executable_path.is_file() {
                executable_path.to_string_lossy().into_owned()
            } else {
                executable.clone()
            };
            Ok(SpawnSpec {
                program,
                args: args.clone(),
                working_dir: working_dir.to_path_buf(),
                env,
            })
        }
        RunsConfig::Docker { image, args } => {
            which::which("docker").map_err(|_| RunnerError::DockerNotFound)?;
            let mut docker_args = vec![
                "run".to_string(),
                "--rm".to_string(),
                "-v".to_string(),
                format!("{}:/workspace", working_dir.display()),
                "-w".to_string(),
                "/workspace".to_string(),
            ];
            for (key, value) in &env {
                docker_args.push("-e".to_string());
                docker_args.push(format!("{key}={value}"));
            }
            docker_args.push(image.clone());
            docker_args.extend(args.iter().cloned());
            Ok(SpawnSpec {
                program: "docker".to_string(),
                args: docker_args,
                working_dir: working_dir.to_path_buf(),
                env: std::collections::BTreeMap::new(),
            })
        }
    }
}

fn resolve_in_action_dir(action_dir: &Path, relative: &str) -> PathBuf {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        action_dir.join(candidate)
    }
}
