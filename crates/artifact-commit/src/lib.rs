//! Commit records over artifact manifests.
//!
//! A [`Commit`] pairs a manifest snapshot with an optional parent commit
//! id; [`migrations`] diffs a commit's manifest against its parent's to
//! produce the ordered list of changes a consumer needs to apply to go
//! from the parent's state to this commit's.

use artifact_manifest::Manifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("commit `{0}` is locked by an in-progress write")]
    Locked(Uuid),
}

/// How a single path changed between a parent commit and its child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Migration {
    Created { path: String, md5_hex: String },
    Modified {
        path: String,
        previous_md5_hex: String,
        md5_hex: String,
    },
    Deleted { path: String },
}

/// A finalized commit: an immutable manifest plus commit metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub manifest: Manifest,
}

impl Commit {
    pub fn new(parent_id: Option<Uuid>, manifest: Manifest, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            created_at,
            manifest,
        }
    }
}

/// A commit in progress: a manifest being built up by repeated `add_file`
/// calls before it is sealed into an immutable [`Commit`]. Mirrors the
/// original agent's split between an actively-written commit and the
/// finalized, read-only commits that make up history.
#[derive(Debug)]
pub struct ActiveCommit {
    parent_id: Option<Uuid>,
    manifest: Manifest,
}

impl ActiveCommit {
    pub fn new(parent_id: Option<Uuid>) -> Self {
        Self {
            parent_id,
            manifest: Manifest::new(),
        }
    }

    pub fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.manifest
    }

    /// Seals this active commit, producing an immutable [`Commit`] stamped
    /// with `created_at`.
    pub fn seal(self, created_at: DateTime<Utc>) -> Commit {
        Commit::new(self.parent_id, self.manifest, created_at)
    }
}

/// Computes the ordered list of migrations needed to go from `parent`'s
/// manifest state to `commit`'s. `parent` of `None` means every file in
/// `commit` is reported as `Created`.
pub fn migrations(commit: &Commit, parent: Option<&Commit>) -> Vec<Migration> {
    let mut result = Vec::new();

    for path in commit.manifest.paths() {
        let entry = commit.manifest.get(path).expect("path came from paths()");
        match parent.and_then(|p| p.manifest.get(path)) {
            None => result.push(Migration::Created {
                path: path.to_string(),
                md5_hex: entry.md5_hex.clone(),
            }),
            Some(previous) if previous.md5_hex != entry.md5_hex => {
                result.push(Migration::Modified {
                    path: path.to_string(),
                    previous_md5_hex: previous.md5_hex.clone(),
                    md5_hex: entry.md5_hex.clone(),
                })
            }
            Some(_) => {}
        }
    }

    if let Some(parent) = parent {
        for path in parent.manifest.paths() {
            if commit.manifest.get(path).is_none() {
                result.push(Migration::Deleted {
                    path: path.to_string(),
                });
            }
        }
    }

    result.sort_by(|a, b| migration_path(a).cmp(migration_path(b)));
    result
}

fn migration_path(migration: &Migration) -> &str {
    match migration {
        Migration::Created { path, .. } => path,
        Migration::Modified { path, .. } => path,
        Migration::Deleted { path } => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn manifest_with(files: &[(&str, &[u8])], dir: &Path) -> Manifest {
        let mut manifest = Manifest::new();
        for (name, content) in files {
            let path = dir.join(name);
            std::fs::write(&path, content).unwrap();
            manifest.add_file(name, &path).unwrap();
        }
        manifest
    }

    #[test]
    fn first_commit_has_no_parent_reports_all_created() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_with(&[("a.txt", b"a"), ("b.txt", b"b")], dir.path());
        let commit = Commit::new(None, manifest, Utc::now());

        let migs = migrations(&commit, None);
        assert_eq!(migs.len(), 2);
        assert!(migs.iter().all(|m| matches!(m, Migration::Created { .. })));
    }

    #[test]
    fn detects_modified_and_deleted_paths() {
        let dir = tempfile::tempdir().unwrap();
        let parent_manifest = manifest_with(&[("a.txt", b"a"), ("b.txt", b"b")], dir.path());
        let parent = Commit::new(None, parent_manifest, Utc::now());

        std::fs::write(dir.path().join("a.txt"), b"a-changed").unwrap();
        let mut child_manifest = Manifest::new();
        child_manifest
            .add_file("a.txt", &dir.path().join("a.txt"))
            .unwrap();
        let child = Commit::new(Some(parent.id), child_manifest, Utc::now());

        let migs = migrations(&child, Some(&parent));
        assert_eq!(migs.len(), 2);
        assert!(migs
            .iter()
            .any(|m| matches!(m, Migration::Modified { path, .. } if path == "a.txt")));
        assert!(migs
            .iter()
            .any(|m| matches!(m, Migration::Deleted { path } if path == "b.txt")));
    }

    #[test]
    fn unchanged_file_produces_no_migration() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_with(&[("a.txt", b"a")], dir.path());
        let parent = Commit::new(None, manifest.clone(), Utc::now());
        let child = Commit::new(Some(parent.id), manifest, Utc::now());

        assert!(migrations(&child, Some(&parent)).is_empty());
    }
}
