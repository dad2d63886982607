use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Version sentinel meaning "re-resolve on every run, never trust the
/// cache".
pub const LATEST: &str = "latest";

/// Identifies an action to run, in `owner/name@version` form, e.g.
/// `datatorch/checkout@v2`. Also accepts a bare git URL in place of
/// `owner/name`, e.g. `https://github.com/acme/my-action@main`.
///
/// `owner/name` pairs under the `datatorch` owner are rewritten to
/// `datatorch-actions` on construction; this alias exists because the
/// action catalog moved organizations and older pipeline definitions still
/// reference the old owner. The rewrite is one-directional and the
/// original, unrewritten owner is not recoverable from an `ActionIdentifier`
/// once parsed — callers that need to show the user what they typed should
/// keep the source string around themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActionIdentifier {
    owner: String,
    name: String,
    version: String,
    /// `Some` when the identifier was given as an explicit git URL rather
    /// than an `owner/name` pair resolved against the default host.
    explicit_git_url: Option<String>,
}

impl ActionIdentifier {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_latest(&self) -> bool {
        self.version == LATEST
    }

    /// The git URL to clone in order to fetch this action's source.
    ///
    /// When the identifier did not specify one explicitly, this defaults to
    /// `git://github.com/<owner>/<name>.git` for bare `owner/name`
    /// references.
    pub fn git_url(&self) -> String {
        match &self.explicit_git_url {
            Some(url) => url.clone(),
            None => format!("git://github.com/{}/{}.git", self.owner, self.name),
        }
    }

    /// The `owner/name` pair this identifier resolves to, after alias
    /// rewriting. Used as the catalog cache namespace.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for ActionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.explicit_git_url {
            Some(url) => write!(f, "{url}@{}", self.version),
            None => write!(f, "{}/{}@{}", self.owner, self.name, self.version),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseIdentifierError {
    #[error("action identifier `{0}` has no @version suffix")]
    MissingVersion(String),
    #[error("action identifier `{0}` has no owner/name, expected `owner/name@version`")]
    MissingOwner(String),
    #[error("action identifier is empty")]
    Empty,
}

impl FromStr for ActionIdentifier {
    type Err = ParseIdentifierError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.trim().is_empty() {
            return Err(ParseIdentifierError::Empty);
        }

        let (head, version) = raw
            .rsplit_once('@')
            .ok_or_else(|| ParseIdentifierError::MissingVersion(raw.to_string()))?;
        let version = if version.is_empty() { LATEST } else { version };

        if head.contains("://") || head.starts_with("git@") {
            // Explicit git reference: owner/name are derived from the
            // trailing path segment for display and cache-namespacing
            // purposes only; the URL itself is authoritative for fetching.
            let trimmed = head.trim_end_matches(".git");
            let name = trimmed
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or(trimmed)
                .to_string();
            let owner = trimmed
                .rsplit('/')
                .nth(1)
                .unwrap_or("unknown")
                .to_string();
            return Ok(ActionIdentifier {
                owner,
                name,
                version: version.to_string(),
                explicit_git_url: Some(head.to_string()),
            });
        }

        let (owner, name) = head
            .split_once('/')
            .ok_or_else(|| ParseIdentifierError::MissingOwner(raw.to_string()))?;
        let owner = rewrite_alias(owner);

        Ok(ActionIdentifier {
            owner,
            name: name.to_string(),
            version: version.to_string(),
            explicit_git_url: None,
        })
    }
}

/// Rewrites owners known to have moved, currently only `datatorch` ->
/// `datatorch-actions`. Anything else passes through unchanged.
fn rewrite_alias(owner: &str) -> String {
    if owner == "datatorch" {
        "datatorch-actions".to_string()
    } else {
        owner.to_string()
    }
}

impl TryFrom<String> for ActionIdentifier {
    type Error = ParseIdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ActionIdentifier> for String {
    fn from(value: ActionIdentifier) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_owner_name_version() {
        let id: ActionIdentifier = "acme/build@v3".parse().unwrap();
        assert_eq!(id.owner(), "acme");
        assert_eq!(id.name(), "build");
        assert_eq!(id.version(), "v3");
        assert_eq!(id.git_url(), "git://github.com/acme/build.git");
    }

    #[test]
    fn rewrites_datatorch_alias() {
        let id: ActionIdentifier = "datatorch/checkout@v1".parse().unwrap();
        assert_eq!(id.owner(), "datatorch-actions");
        assert_eq!(id.slug(), "datatorch-actions/checkout");
    }

    #[test]
    fn empty_version_becomes_latest_sentinel() {
        let id: ActionIdentifier = "acme/build@".parse().unwrap();
        assert!(id.is_latest());
    }

    #[test]
    fn missing_version_is_an_error() {
        let err = "acme/build".parse::<ActionIdentifier>().unwrap_err();
        assert_eq!(err, ParseIdentifierError::MissingVersion("acme/build".into()));
    }

    #[test]
    fn explicit_git_url_is_preserved_verbatim() {
        let id: ActionIdentifier = "https://example.com/acme/build@main".parse().unwrap();
        assert_eq!(id.git_url(), "https://example.com/acme/build");
        assert_eq!(id.name(), "build");
    }

    #[test]
    fn display_round_trips_owner_name_form() {
        let id: ActionIdentifier = "acme/build@v3".parse().unwrap();
        assert_eq!(id.to_string(), "acme/build@v3");
    }
}
