//! Hook declarations and the sandbox contract.
//!
//! Hooks are declared in root metadata per stage; the source is a
//! content-addressed blob whose digest map must match before anything
//! is handed to the sandbox. Execution itself (the Lua sandbox) lives
//! outside this crate, behind [`HookExecutor`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hash::Digest;
use crate::git::Oid;
use crate::storage::ReadRepository;
use crate::tuf::principal::PrincipalId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("hook `{0}`: blob {1} does not match the declared content id")]
    BlobMismatch(String, Oid),
    #[error("hook `{0}`: sha256 digest does not match metadata")]
    DigestMismatch(String),
    #[error("hook `{0}`: no sha256 digest declared")]
    MissingSha256(String),
    #[error("hook `{0}` failed: {1}")]
    Execution(String, String),
    #[error("storage: {0}")]
    Storage(#[from] crate::storage::Error),
}

/// The stage a hook is attached to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    PreCommit,
    PrePush,
}

/// Sandbox environment a hook runs in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    Lua,
}

/// Digest algorithms for hook sources. `sha256` is mandatory; further
/// algorithms may be declared alongside it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
    Sha256,
}

/// A hook declaration, held in root metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    pub name: String,
    pub principal_ids: BTreeSet<PrincipalId>,
    /// Content id of the hook source in the object store.
    pub blob_id: Oid,
    /// Digests of the hook source, keyed by algorithm.
    pub hashes: BTreeMap<HashAlgorithm, Digest>,
    pub environment: Environment,
    /// Timeout in seconds.
    pub timeout: u64,
}

impl Hook {
    pub fn sha256(&self) -> Option<&Digest> {
        self.hashes.get(&HashAlgorithm::Sha256)
    }
}

/// A single ref update passed to pre-push hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefUpdate {
    pub local_ref: String,
    pub remote_ref: String,
    pub local_hash: Oid,
    pub remote_hash: Oid,
}

/// Stage-specific parameters handed to the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "stage")]
pub enum Parameters {
    PreCommit,
    PrePush {
        remote_name: String,
        remote_url: String,
        updates: Vec<RefUpdate>,
    },
}

impl Parameters {
    pub fn stage(&self) -> Stage {
        match self {
            Self::PreCommit => Stage::PreCommit,
            Self::PrePush { .. } => Stage::PrePush,
        }
    }
}

/// Outcome of one hook run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub hook: String,
    pub exit_code: i32,
}

/// The sandbox. Implementations must enforce the given timeout and must
/// not expose filesystem or network access to the hook.
pub trait HookExecutor {
    fn execute(
        &self,
        hook: &Hook,
        source: &[u8],
        parameters: &Parameters,
        timeout: Duration,
    ) -> Result<i32, String>;
}

/// Run the hooks the applied policy declares for the parameters'
/// stage.
pub fn invoke_for_policy<R: ReadRepository>(
    repo: &R,
    policy: &crate::policy::PolicyState,
    parameters: &Parameters,
    executor: &dyn HookExecutor,
) -> Result<Vec<Outcome>, Error> {
    invoke_for_stage(
        repo,
        policy.root.hooks_for_stage(parameters.stage()),
        parameters,
        executor,
    )
}

/// Fetch, check and run every hook declared for the given stage.
///
/// The source blob is loaded by its content id and its sha256 digest is
/// checked against the declaration before the sandbox sees it.
pub fn invoke_for_stage<R: ReadRepository>(
    repo: &R,
    hooks: &[Hook],
    parameters: &Parameters,
    executor: &dyn HookExecutor,
) -> Result<Vec<Outcome>, Error> {
    let mut outcomes = Vec::with_capacity(hooks.len());

    for hook in hooks {
        let expected = hook
            .sha256()
            .ok_or_else(|| Error::MissingSha256(hook.name.clone()))?;
        let source = repo.read_blob(hook.blob_id)?;

        let content_id = crate::storage::blob_id(&source).map_err(crate::storage::Error::from)?;
        if content_id != hook.blob_id {
            return Err(Error::BlobMismatch(hook.name.clone(), content_id));
        }
        if Digest::new(&source) != *expected {
            return Err(Error::DigestMismatch(hook.name.clone()));
        }

        log::debug!(target: "hooks", "Running hook `{}` for stage {:?}", hook.name, parameters.stage());

        let exit_code = executor
            .execute(hook, &source, parameters, Duration::from_secs(hook.timeout))
            .map_err(|e| Error::Execution(hook.name.clone(), e))?;

        outcomes.push(Outcome {
            hook: hook.name.clone(),
            exit_code,
        });
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::fixtures;

    struct EchoExecutor;

    impl HookExecutor for EchoExecutor {
        fn execute(
            &self,
            _hook: &Hook,
            _source: &[u8],
            _parameters: &Parameters,
            _timeout: Duration,
        ) -> Result<i32, String> {
            Ok(0)
        }
    }

    fn declaration(repo: &crate::storage::git::Repository, source: &[u8]) -> Hook {
        use crate::storage::WriteRepository as _;

        let blob_id = repo.write_blob(source).unwrap();

        Hook {
            name: "check-commit".to_owned(),
            principal_ids: BTreeSet::new(),
            blob_id,
            hashes: BTreeMap::from_iter([(HashAlgorithm::Sha256, Digest::new(source))]),
            environment: Environment::Lua,
            timeout: 10,
        }
    }

    #[test]
    fn test_invoke_checks_digest() {
        let (repo, _tmp) = fixtures::repository();
        let hook = declaration(&repo, b"return 0");

        let outcomes =
            invoke_for_stage(&repo, &[hook.clone()], &Parameters::PreCommit, &EchoExecutor)
                .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].exit_code, 0);

        // Tampered digest map is refused.
        let mut bad = hook;
        bad.hashes
            .insert(HashAlgorithm::Sha256, Digest::new(b"something else"));
        let err = invoke_for_stage(&repo, &[bad], &Parameters::PreCommit, &EchoExecutor)
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch(_)));
    }

    #[test]
    fn test_missing_sha256_rejected() {
        let (repo, _tmp) = fixtures::repository();
        let mut hook = declaration(&repo, b"return 0");
        hook.hashes.clear();

        let err = invoke_for_stage(&repo, &[hook], &Parameters::PreCommit, &EchoExecutor)
            .unwrap_err();
        assert!(matches!(err, Error::MissingSha256(_)));
    }
}
