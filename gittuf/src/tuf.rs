//! Signed policy metadata: root and rule-file (targets) documents.
//!
//! Documents are versioned; `v0.1` carries bare keys, `v0.2` adds
//! stable-id persons and multi-key principals. Readers accept both and
//! migrate on read; writers emit the latest version.

pub mod principal;
pub mod root;
pub mod targets;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tuf::principal::PrincipalId;

/// Name of the root role.
pub const ROOT_ROLE: &str = "root";
/// Name of the primary rule file.
pub const TARGETS_ROLE: &str = "targets";

/// Maximum length of a name in policy metadata.
pub const MAX_NAME_LENGTH: usize = 255;

#[derive(Debug, Error)]
pub enum Error {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid role name `{0}`")]
    InvalidRoleName(String),
    #[error("invalid threshold `{0}`: {1}")]
    Threshold(usize, &'static str),
    #[error("principal `{0}` is not defined")]
    UnknownPrincipal(PrincipalId),
    #[error("principal `{0}` is already defined")]
    PrincipalExists(PrincipalId),
    #[error("cannot remove principal `{0}`: {1}")]
    CannotRemovePrincipal(PrincipalId, &'static str),
    #[error("rule `{0}` not found")]
    RuleNotFound(String),
    #[error("rule `{0}` already exists")]
    RuleExists(String),
    #[error("global rule `{0}` already exists")]
    GlobalRuleExists(String),
    #[error("global rule `{0}` not found")]
    GlobalRuleNotFound(String),
    #[error("propagation directive `{0}` not found")]
    DirectiveNotFound(String),
    #[error("hook `{0}` already exists")]
    HookExists(String),
    #[error("hook `{0}` not found")]
    HookNotFound(String),
    #[error("app `{0}` not found")]
    AppNotFound(String),
    #[error("invalid hook `{0}`: {1}")]
    InvalidHook(String, &'static str),
    #[error("invalid metadata: {0}")]
    Invalid(&'static str),
}

/// Schema version of a metadata document.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[serde(rename = "v0.1")]
    V01,
    #[default]
    #[serde(rename = "v0.2")]
    V02,
}

impl SchemaVersion {
    /// The version written by this release.
    pub const LATEST: SchemaVersion = SchemaVersion::V02;
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V01 => write!(f, "v0.1"),
            Self::V02 => write!(f, "v0.2"),
        }
    }
}

/// A set of principals with a signature threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub principal_ids: std::collections::BTreeSet<PrincipalId>,
    pub threshold: usize,
}

impl Role {
    pub fn new(principal_ids: impl IntoIterator<Item = PrincipalId>, threshold: usize) -> Self {
        Self {
            principal_ids: principal_ids.into_iter().collect(),
            threshold,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.threshold == 0 {
            return Err(Error::Threshold(self.threshold, "threshold cannot be zero"));
        }
        if self.threshold > self.principal_ids.len() {
            return Err(Error::Threshold(
                self.threshold,
                "threshold cannot exceed number of principals",
            ));
        }
        Ok(())
    }
}

/// Match a metadata path pattern against a path.
///
/// Patterns are `scheme:pattern` strings such as `git:refs/heads/*` or
/// `file:src/*`; `*` matches any run of characters, including `/`.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    fn glob(pattern: &[u8], path: &[u8]) -> bool {
        match (pattern.split_first(), path.split_first()) {
            (None, None) => true,
            (Some((b'*', rest)), _) => {
                glob(rest, path) || (!path.is_empty() && glob(pattern, &path[1..]))
            }
            (Some((p, p_rest)), Some((c, c_rest))) if p == c => glob(p_rest, c_rest),
            _ => false,
        }
    }
    glob(pattern.as_bytes(), path.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("git:refs/heads/main", "git:refs/heads/main"));
        assert!(pattern_matches("git:refs/heads/*", "git:refs/heads/main"));
        assert!(pattern_matches(
            "git:refs/heads/*",
            "git:refs/heads/feature/x"
        ));
        assert!(pattern_matches("*", "git:refs/heads/main"));
        assert!(pattern_matches("file:src/*", "file:src/lib.rs"));
        assert!(!pattern_matches("git:refs/heads/*", "git:refs/tags/v1"));
        assert!(!pattern_matches("git:refs/heads/main", "git:refs/heads/m"));
    }

    #[test]
    fn test_role_validation() {
        let role = Role::new(["a".to_owned(), "b".to_owned()], 2);
        assert!(role.validate().is_ok());

        let role = Role::new(["a".to_owned()], 2);
        assert!(role.validate().is_err());

        let role = Role::new(["a".to_owned()], 0);
        assert!(role.validate().is_err());
    }

    #[test]
    fn test_schema_version_serde() {
        assert_eq!(
            serde_json::to_string(&SchemaVersion::V01).unwrap(),
            "\"v0.1\""
        );
        let v: SchemaVersion = serde_json::from_str("\"v0.2\"").unwrap();
        assert_eq!(v, SchemaVersion::V02);
    }
}
