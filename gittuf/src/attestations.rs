//! Signed side-statements about refs, stored as a content-addressed
//! tree of envelopes under the attestations ref.
//!
//! Each leaf is an [`Envelope`] at a path derived from what the
//! statement speaks about, so a statement for a given transition is
//! found without walking history.

pub mod authorization;
pub mod github;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::crypto::Signer;
use crate::envelope::{self, Envelope};
use crate::git::Oid;
use crate::rsl;
use crate::storage::{self, read_nested_tree, write_nested_tree, ReadRepository, WriteRepository};
use crate::ATTESTATIONS_REF;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage: {0}")]
    Storage(#[from] storage::Error),
    #[error("rsl: {0}")]
    Rsl(#[from] rsl::Error),
    #[error("envelope: {0}")]
    Envelope(#[from] envelope::Error),
    #[error("attestation not found at `{0}`")]
    NotFound(String),
    #[error("signature by `{0}` not found")]
    SignatureNotFound(crate::crypto::KeyId),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Storage(e) => e.is_not_found(),
            Self::Rsl(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Make a refname usable as one path component.
pub fn escape_ref(ref_name: &str) -> String {
    ref_name.replace('/', "-")
}

/// Path of a reference authorization for `(ref, from, to)`.
pub fn reference_authorization_path(ref_name: &str, from: Oid, to: Oid) -> String {
    format!(
        "reference-authorizations/{}/{from}-{to}",
        escape_ref(ref_name)
    )
}

/// Path of a GitHub pull request approval for `(app, ref, from, to, review)`.
pub fn github_approval_path(
    app_name: &str,
    ref_name: &str,
    from: Oid,
    to: Oid,
    review_id: u64,
) -> String {
    format!(
        "github-pull-request-approvals/{app_name}/{}/{from}-{to}/{review_id}",
        escape_ref(ref_name)
    )
}

/// Path of a GitHub pull request attestation for `(ref, commit)`.
pub fn github_attestation_path(ref_name: &str, commit: Oid) -> String {
    format!(
        "github-pull-request-attestations/{}/{commit}",
        escape_ref(ref_name)
    )
}

/// The attestations tree at the tip of the attestations ref.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Attestations {
    leaves: BTreeMap<String, Oid>,
}

impl Attestations {
    /// Load the current attestations. An absent ref is an empty store.
    pub fn load<R: ReadRepository>(repo: &R) -> Result<Self, Error> {
        let tip = match repo.ref_oid(&ATTESTATIONS_REF) {
            Ok(tip) => tip,
            Err(e) if e.is_not_found() => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let commit = repo.read_commit(tip)?;
        let leaves = read_nested_tree(repo, commit.tree)?;

        Ok(Self { leaves })
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Paths with a leaf under the given prefix.
    pub fn paths_under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> {
        self.leaves
            .keys()
            .map(String::as_str)
            .filter(move |path| path.starts_with(prefix))
    }

    /// Read the envelope at a path.
    pub fn envelope_at<R: ReadRepository>(
        &self,
        repo: &R,
        path: &str,
    ) -> Result<Envelope, Error> {
        let blob_id = self
            .leaves
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_owned()))?;
        let bytes = repo.read_blob(*blob_id)?;

        serde_json::from_slice(&bytes)
            .map_err(envelope::Error::from)
            .map_err(Error::from)
    }

    /// Write or replace the envelope at a path.
    pub fn set<R: WriteRepository>(
        &mut self,
        repo: &R,
        path: String,
        envelope: &Envelope,
    ) -> Result<(), Error> {
        let bytes = crate::canonical::encode(envelope).map_err(envelope::Error::from)?;
        let blob_id = repo.write_blob(&bytes)?;

        self.leaves.insert(path, blob_id);
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<(), Error> {
        self.leaves
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(path.to_owned()))
    }

    /// Commit this state to the attestations ref and record the update
    /// in the RSL.
    pub fn commit<R: WriteRepository>(
        &self,
        repo: &R,
        message: &str,
        signer: Option<&dyn Signer>,
    ) -> Result<Oid, Error> {
        let tree = write_nested_tree(repo, &self.leaves)?;
        let parents = match repo.ref_oid(&ATTESTATIONS_REF) {
            Ok(tip) => vec![tip],
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let commit = repo.commit(tree, &parents, message, signer)?;

        repo.set_ref(&ATTESTATIONS_REF, commit)?;
        rsl::append(
            repo,
            rsl::Entry::Reference(rsl::ReferenceEntry {
                ref_name: ATTESTATIONS_REF.to_string(),
                target_id: commit,
                number: 0,
            }),
            signer,
            &rsl::AppendOptions::default(),
        )?;
        log::debug!(target: "attestations", "Committed attestations at {commit}");

        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::envelope::PAYLOAD_TYPE_ATTESTATION;
    use crate::test::fixtures;

    #[test]
    fn test_empty_store() {
        let (repo, _tmp) = fixtures::repository();
        let attestations = Attestations::load(&repo).unwrap();

        assert!(attestations.is_empty());
    }

    #[test]
    fn test_set_commit_load_round_trip() {
        let (repo, _tmp) = fixtures::repository();
        fixtures::commit(&repo, "refs/heads/main", b"a", &[]);

        let envelope = Envelope::seal(
            &serde_json::json!({ "kind": "test" }),
            PAYLOAD_TYPE_ATTESTATION,
        )
        .unwrap();
        let path = reference_authorization_path(
            "refs/heads/main",
            fixtures::oid(1),
            fixtures::oid(2),
        );

        let mut attestations = Attestations::load(&repo).unwrap();
        attestations
            .set(&repo, path.clone(), &envelope)
            .unwrap();
        attestations.commit(&repo, "Add attestation", None).unwrap();

        let reloaded = Attestations::load(&repo).unwrap();
        assert_eq!(reloaded.envelope_at(&repo, &path).unwrap(), envelope);

        // The RSL records the attestations ref update.
        let entry = rsl::latest(&repo).unwrap();
        assert_eq!(entry.ref_name(), Some(*ATTESTATIONS_REF));
    }

    #[test]
    fn test_paths() {
        assert_eq!(
            reference_authorization_path("refs/heads/main", fixtures::oid(1), fixtures::oid(2)),
            format!(
                "reference-authorizations/refs-heads-main/{}-{}",
                fixtures::oid(1),
                fixtures::oid(2)
            )
        );
        assert_eq!(
            github_approval_path("github-app", "refs/heads/main", fixtures::oid(1), fixtures::oid(2), 7),
            format!(
                "github-pull-request-approvals/github-app/refs-heads-main/{}-{}/7",
                fixtures::oid(1),
                fixtures::oid(2)
            )
        );
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let (repo, _tmp) = fixtures::repository();
        let mut attestations = Attestations::load(&repo).unwrap();

        let err = attestations.remove("reference-authorizations/x/y").unwrap_err();
        assert!(err.is_not_found());
    }
}
