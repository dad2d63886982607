//! Loads agent configuration from, in increasing priority: a config file
//! on disk, environment variables, then explicit CLI overrides applied by
//! the caller.
//!
//! The agent needs very little configuration to start: where to connect,
//! how to authenticate, and where to keep its working data. Everything
//! else (retry tuning, cache paths) has a sensible default derived from
//! the data directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "agent.yml";
pub const DATA_DIR_ENV: &str = "AGENT_DATA_DIR";
pub const HOST_ENV: &str = "AGENT_HOST";
pub const TOKEN_ENV: &str = "AGENT_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no coordinator host configured; set `host` in {CONFIG_FILE_NAME} or ${HOST_ENV}")]
    MissingHost,
    #[error("no agent token configured; set `token` in {CONFIG_FILE_NAME} or ${TOKEN_ENV}")]
    MissingToken,
    #[error("failed to read config file at `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file at `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// The on-disk shape of `agent.yml`. Every field is optional here since an
/// environment variable or CLI flag can supply it instead; [`resolve`]
/// is what enforces the fields are actually present by the time the agent
/// starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub host: Option<String>,
    pub token: Option<String>,
    pub data_dir: Option<PathBuf>,
}

/// Fully resolved configuration the agent runs with.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host: String,
    pub token: String,
    pub data_dir: PathBuf,
}

impl AgentConfig {
    pub fn directory(&self) -> AgentDirectory {
        AgentDirectory::new(&self.data_dir)
    }
}

/// Layout of the agent's on-disk working data, rooted at `data_dir`.
#[derive(Debug, Clone)]
pub struct AgentDirectory {
    root: PathBuf,
}

impl AgentDirectory {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where fetched actions are cloned to.
    pub fn actions_dir(&self) -> PathBuf {
        self.root.join("actions")
    }

    /// Per-job scratch directory, created fresh for each job run.
    pub fn job_workdir(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join(job_id)
    }

    /// Append-only JSONL audit log directory.
    pub fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("datatorch-agent")
}

/// Reads `agent.yml` from `config_dir` if present; returns an empty
/// [`ConfigFile`] (not an error) when the file does not exist, since every
/// field it would supply can also come from the environment.
pub fn load_config_file(config_dir: &Path) -> Result<ConfigFile, ConfigError> {
    let path = config_dir.join(CONFIG_FILE_NAME);
    if !path.is_file() {
        return Ok(ConfigFile::default());
    }
    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
}

/// Overrides applied on top of a loaded [`ConfigFile`] and the process
/// environment, typically parsed from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub token: Option<String>,
    pub data_dir: Option<PathBuf>,
}

/// Merges a config file, the process environment, and explicit overrides
/// into a final [`AgentConfig`], in that increasing order of priority.
pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> Result<AgentConfig, ConfigError> {
    let host = overrides
        .host
        .or_else(|| std::env::var(HOST_ENV).ok())
        .or(file.host)
        .ok_or(ConfigError::MissingHost)?;

    let token = overrides
        .token
        .or_else(|| std::env::var(TOKEN_ENV).ok())
        .or(file.token)
        .ok_or(ConfigError::MissingToken)?;

    let data_dir = overrides
        .data_dir
        .or_else(|| std::env::var(DATA_DIR_ENV).ok().map(PathBuf::from))
        .or(file.data_dir)
        .unwrap_or_else(default_data_dir);

    Ok(AgentConfig {
        host,
        token,
        data_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn overrides_win_over_everything() {
        let file = ConfigFile {
            host: Some("file-host".to_string()),
            token: Some("file-token".to_string()),
            data_dir: None,
        };
        let overrides = ConfigOverrides {
            host: Some("cli-host".to_string()),
            token: None,
            data_dir: None,
        };
        temp_env::with_var(HOST_ENV, Some("env-host"), || {
            let config = resolve(file.clone(), overrides.clone()).unwrap();
            assert_eq!(config.host, "cli-host");
        });
    }

    #[test]
    #[serial]
    fn env_wins_over_file() {
        let file = ConfigFile {
            host: Some("file-host".to_string()),
            token: Some("file-token".to_string()),
            data_dir: None,
        };
        temp_env::with_var(HOST_ENV, Some("env-host"), || {
            let config = resolve(file.clone(), ConfigOverrides::default()).unwrap();
            assert_eq!(config.host, "env-host");
        });
    }

    #[test]
    #[serial]
    fn missing_host_is_an_error() {
        temp_env::with_var_unset(HOST_ENV, || {
            let err = resolve(ConfigFile::default(), ConfigOverrides::default()).unwrap_err();
            assert!(matches!(err, ConfigError::MissingHost));
        });
    }

    #[test]
    fn load_config_file_missing_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_file(dir.path()).unwrap();
        assert!(config.host.is_none());
    }

    #[test]
    fn job_workdir_is_scoped_by_job_id() {
        let dir = AgentDirectory::new(Path::new("/data"));
        assert_eq!(dir.job_workdir("job-1"), PathBuf::from("/data/jobs/job-1"));
    }
}
