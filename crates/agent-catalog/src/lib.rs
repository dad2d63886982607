//! Resolves an [`ActionIdentifier`] to a cloned working copy and a parsed
//! [`ActionManifest`].
//!
//! Fetching is a thin wrapper around the `git` executable rather than an
//! embedded git implementation: no action needs anything git itself
//! doesn't already do well (shallow clone, ref checkout).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use agent_types::{ActionIdentifier, ActionManifest};

#[derive(Debug, thiserror::Error)]
pub enum CatalogFetchError {
    #[error("git clone of `{url}` failed: {stderr}")]
    CloneFailed { url: String, stderr: String },
    #[error("failed to check out `{reference}` in `{url}`: {stderr}")]
    CheckoutFailed {
        url: String,
        reference: String,
        stderr: String,
    },
    #[error("failed to run git: {0}")]
    GitUnavailable(#[source] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("no action.yml or action.yaml found in `{0}`")]
    NotFound(PathBuf),
    #[error("failed to parse action manifest at `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Remembers which `(owner/name, version)` pairs have already been cloned
/// under a given destination root, so a pipeline with many steps using the
/// same action only clones it once. This is a fetch-level cache only; the
/// input-aware result cache that decides whether a step's *execution* can
/// be skipped entirely lives in `agent-cache` and is a separate concern.
#[derive(Debug, Default)]
pub struct FetchCache {
    cloned: Mutex<HashMap<String, PathBuf>>,
}

impl FetchCache {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Fetches (cloning under `dest_root` if not already cloned this run) and
/// parses the action `id` refers to. A version of `"latest"` always
/// bypasses the fetch cache and re-clones, since the sentinel promises a
/// moving target.
pub fn resolve(
    id: &ActionIdentifier,
    dest_root: &Path,
    cache: &FetchCache,
) -> Result<(PathBuf, ActionManifest), CatalogFetchError> {
    let git_url = id.git_url();
    let key = format!("{git_url}@{}", id.version());

    if !id.is_latest() {
        if let Some(local_path) = cache.cloned.lock().expect("fetch cache poisoned").get(&key).cloned() {
            if let Ok(manifest) = load_manifest(&local_path) {
                return Ok((local_path, manifest));
            }
        }
    }

    let local_path = dest_root.join(id.slug().replace('/', "__")).join(id.version());
    clone(&git_url, id.version(), &local_path)?;

    let manifest = load_manifest(&local_path).map_err(|_| CatalogFetchError::CloneFailed {
        url: git_url.clone(),
        stderr: "checkout is missing its manifest".to_string(),
    })?;

    if !id.is_latest() {
        cache
            .cloned
            .lock()
            .expect("fetch cache poisoned")
            .insert(key, local_path.clone());
    }

    Ok((local_path, manifest))
}

fn clone(git_url: &str, reference: &str, dest: &Path) -> Result<(), CatalogFetchError> {
    if dest.exists() {
        std::fs::remove_dir_all(dest).map_err(CatalogFetchError::GitUnavailable)?;
    }
    std::fs::create_dir_all(dest.parent().unwrap_or(dest))
        .map_err(CatalogFetchError::GitUnavailable)?;

    let clone_output = Command::new("git")
        .args(["clone", "--quiet", git_url, dest.to_string_lossy().as_ref()])
        .output()
        .map_err(CatalogFetchError::GitUnavailable)?;

    if !clone_output.status.success() {
        return Err(CatalogFetchError::CloneFailed {
            url: git_url.to_string(),
            stderr: String::from_utf8_lossy(&clone_output.stderr).to_string(),
        });
    }

    if reference != "latest" {
        let checkout_output = Command::new("git")
            .args(["checkout", "--quiet", reference])
            .current_dir(dest)
            .output()
            .map_err(CatalogFetchError::GitUnavailable)?;
        if !checkout_output.status.success() {
            return Err(CatalogFetchError::CheckoutFailed {
                url: git_url.to_string(),
                reference: reference.to_string(),
                stderr: String::from_utf8_lossy(&checkout_output.stderr).to_string(),
            });
        }
    }

    Ok(())
}

/// Loads and parses `action.yml` (preferred) or `action.yaml` from an
/// action's root directory.
pub fn load_manifest(action_dir: &Path) -> Result<ActionManifest, ManifestError> {
    for candidate in ["action.yml", "action.yaml"] {
        let path = action_dir.join(candidate);
        if path.is_file() {
            let text = std::fs::read_to_string(&path)?;
            return serde_yaml::from_str(&text).map_err(|source| ManifestError::Parse {
                path,
                source,
            });
        }
    }
    Err(ManifestError::NotFound(action_dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_action_yml() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("action.yml")).unwrap();
        writeln!(
            f,
            "name: checkout\nruns:\n  type: shell\n  command: echo hi"
        )
        .unwrap();
        let manifest = load_manifest(dir.path()).unwrap();
        assert_eq!(manifest.name, "checkout");
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_manifest(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::NotFound(_)));
    }
}
