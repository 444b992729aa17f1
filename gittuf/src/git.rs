//! Thin helpers over `git2` shared by the rest of the crate.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use git2 as raw;

#[derive(Debug, Error)]
pub enum Error {
    #[error("git: {0}")]
    Git(#[from] git2::Error),
    #[error("object `{0}` not found")]
    NotFound(Oid),
    #[error("reference `{0}` not found")]
    RefNotFound(String),
}

impl Error {
    /// Whether this error is caused by an object or reference not being found.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::RefNotFound(_) => true,
            Self::Git(e) => is_not_found_err(e),
        }
    }
}

/// Whether a `git2` error means "not found".
pub fn is_not_found_err(err: &git2::Error) -> bool {
    err.code() == git2::ErrorCode::NotFound
}

/// A Git object id.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Oid(git2::Oid);

impl Oid {
    /// The all-zero object id.
    pub fn zero() -> Self {
        Self(git2::Oid::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.0)
    }
}

impl Deref for Oid {
    type Target = git2::Oid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<git2::Oid> for Oid {
    fn from(oid: git2::Oid) -> Self {
        Self(oid)
    }
}

impl From<Oid> for git2::Oid {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.to_string()
    }
}

impl FromStr for Oid {
    type Err = git2::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        git2::Oid::from_str(s).map(Self)
    }
}

impl TryFrom<String> for Oid {
    type Error = git2::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// Qualify a branch name: `main` becomes `refs/heads/main`.
/// Names that are already fully qualified pass through.
pub fn qualify_branch(name: &str) -> String {
    if name.starts_with("refs/") {
        name.to_owned()
    } else {
        format!("refs/heads/{name}")
    }
}

/// Qualify a tag name: `v1.0` becomes `refs/tags/v1.0`.
pub fn qualify_tag(name: &str) -> String {
    if name.starts_with("refs/") {
        name.to_owned()
    } else {
        format!("refs/tags/{name}")
    }
}
