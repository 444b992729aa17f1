//! Reference authorizations: pre-merge approvals over a transition.
//!
//! An approver signs `(ref, from, to)` where `to` is the tree the
//! merge is expected to produce, so approval can exist before the
//! merge commit does. For tags, `to` is the target commit id.

use serde::{Deserialize, Serialize};

use crate::attestations::{reference_authorization_path, Attestations, Error};
use crate::crypto::Signer;
use crate::envelope::{Envelope, PAYLOAD_TYPE_ATTESTATION};
use crate::git::Oid;
use crate::storage::{ReadRepository, WriteRepository};

/// The signed statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceAuthorization {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub from_id: Oid,
    pub target_id: Oid,
}

impl ReferenceAuthorization {
    pub fn new(ref_name: impl Into<String>, from_id: Oid, target_id: Oid) -> Self {
        Self {
            ref_name: ref_name.into(),
            from_id,
            target_id,
        }
    }

    pub fn path(&self) -> String {
        reference_authorization_path(&self.ref_name, self.from_id, self.target_id)
    }
}

/// The transition an authorization for merging `feature_ref` into
/// `target_ref` must speak about: from the target's current tip to the
/// prospective merge tree.
pub fn prospective_transition<R: ReadRepository>(
    repo: &R,
    target_ref: &str,
    feature_ref: &str,
) -> Result<ReferenceAuthorization, Error> {
    let from_id = match repo.ref_oid(target_ref) {
        Ok(tip) => tip,
        Err(e) if e.is_not_found() => Oid::zero(),
        Err(e) => return Err(e.into()),
    };
    let feature_tip = repo.ref_oid(feature_ref)?;
    let target_id = if from_id.is_zero() {
        // Nothing to merge over; the expected tree is the feature's own.
        repo.read_commit(repo.peel_to_commit(feature_tip)?)?.tree
    } else {
        repo.merge_tree(from_id, feature_tip)?
    };

    Ok(ReferenceAuthorization::new(target_ref, from_id, target_id))
}

/// Create or co-sign the authorization for merging `feature_ref` into
/// `target_ref`, and record it.
pub fn authorize<R: WriteRepository>(
    repo: &R,
    signer: &dyn Signer,
    target_ref: &str,
    feature_ref: &str,
) -> Result<ReferenceAuthorization, Error> {
    let statement = prospective_transition(repo, target_ref, feature_ref)?;
    authorize_transition(repo, signer, &statement)?;
    Ok(statement)
}

/// Create or co-sign an authorization for an explicit transition.
pub fn authorize_transition<R: WriteRepository>(
    repo: &R,
    signer: &dyn Signer,
    statement: &ReferenceAuthorization,
) -> Result<(), Error> {
    let mut attestations = Attestations::load(repo)?;
    let path = statement.path();

    let mut envelope = match attestations.envelope_at(repo, &path) {
        Ok(envelope) => envelope,
        Err(e) if e.is_not_found() => Envelope::seal(statement, PAYLOAD_TYPE_ATTESTATION)?,
        Err(e) => return Err(e),
    };
    envelope.resign(signer)?;

    attestations.set(repo, path, &envelope)?;
    attestations.commit(
        repo,
        &format!(
            "Add reference authorization for {} by {}",
            statement.ref_name,
            signer.key_id()
        ),
        Some(signer),
    )?;
    Ok(())
}

/// Withdraw the signer's approval of a transition. The leaf is removed
/// once no signatures remain.
pub fn dismiss<R: WriteRepository>(
    repo: &R,
    signer: &dyn Signer,
    ref_name: &str,
    from_id: Oid,
    target_id: Oid,
) -> Result<(), Error> {
    let mut attestations = Attestations::load(repo)?;
    let path = reference_authorization_path(ref_name, from_id, target_id);
    let mut envelope = attestations.envelope_at(repo, &path)?;

    if !envelope.remove_signature(signer.key_id()) {
        return Err(Error::SignatureNotFound(signer.key_id().clone()));
    }
    if envelope.signatures.is_empty() {
        attestations.remove(&path)?;
    } else {
        attestations.set(repo, path, &envelope)?;
    }
    attestations.commit(
        repo,
        &format!("Dismiss reference authorization for {ref_name} by {}", signer.key_id()),
        Some(signer),
    )?;
    Ok(())
}

/// The authorization envelope for a transition, if present.
pub fn find<R: ReadRepository>(
    repo: &R,
    attestations: &Attestations,
    ref_name: &str,
    from_id: Oid,
    target_id: Oid,
) -> Result<Option<(ReferenceAuthorization, Envelope)>, Error> {
    let path = reference_authorization_path(ref_name, from_id, target_id);

    match attestations.envelope_at(repo, &path) {
        Ok(envelope) => {
            let statement: ReferenceAuthorization = envelope.open()?;
            Ok(Some((statement, envelope)))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
