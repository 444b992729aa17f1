//! Attestations issued by a trusted GitHub app: pull request approvals
//! and pull request snapshots.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::attestations::{
    github_approval_path, github_attestation_path, Attestations, Error,
};
use crate::crypto::Signer;
use crate::envelope::{Envelope, PAYLOAD_TYPE_ATTESTATION};
use crate::git::Oid;
use crate::storage::{ReadRepository, WriteRepository};
use crate::tuf::principal::PrincipalId;

/// Review state for a transition, as observed by the app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestApproval {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub from_id: Oid,
    pub target_id: Oid,
    /// Principals whose review currently stands.
    pub approvers: BTreeSet<PrincipalId>,
    /// Principals who approved and later withdrew or were dismissed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dismissed_approvers: BTreeSet<PrincipalId>,
}

/// A snapshot of pull request metadata for a commit, recorded when the
/// PR is observed. The payload is opaque to verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestAttestation {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub commit_id: Oid,
    pub pull_request: serde_json::Value,
}

/// Record the app's view of a review round.
pub fn set_approval<R: WriteRepository>(
    repo: &R,
    app_signer: &dyn Signer,
    app_name: &str,
    review_id: u64,
    approval: &PullRequestApproval,
) -> Result<(), Error> {
    let mut attestations = Attestations::load(repo)?;
    let path = github_approval_path(
        app_name,
        &approval.ref_name,
        approval.from_id,
        approval.target_id,
        review_id,
    );
    let mut envelope = Envelope::seal(approval, PAYLOAD_TYPE_ATTESTATION)?;
    envelope.sign(app_signer)?;

    attestations.set(repo, path, &envelope)?;
    attestations.commit(
        repo,
        &format!(
            "Add GitHub approval for {} (review {review_id})",
            approval.ref_name
        ),
        Some(app_signer),
    )?;
    Ok(())
}

/// All approvals recorded by `app_name` for a transition, across
/// review rounds.
pub fn approvals_for<R: ReadRepository>(
    repo: &R,
    attestations: &Attestations,
    app_name: &str,
    ref_name: &str,
    from_id: Oid,
    target_id: Oid,
) -> Result<Vec<(PullRequestApproval, Envelope)>, Error> {
    let prefix = format!(
        "github-pull-request-approvals/{app_name}/{}/{from_id}-{target_id}/",
        super::escape_ref(ref_name)
    );
    let paths: Vec<String> = attestations
        .paths_under(&prefix)
        .map(str::to_owned)
        .collect();
    let mut approvals = Vec::with_capacity(paths.len());

    for path in paths {
        let envelope = attestations.envelope_at(repo, &path)?;
        let approval: PullRequestApproval = envelope.open()?;
        approvals.push((approval, envelope));
    }
    Ok(approvals)
}

/// Record a pull request snapshot for a commit.
pub fn set_pull_request_attestation<R: WriteRepository>(
    repo: &R,
    app_signer: &dyn Signer,
    attestation: &PullRequestAttestation,
) -> Result<(), Error> {
    let mut attestations = Attestations::load(repo)?;
    let path = github_attestation_path(&attestation.ref_name, attestation.commit_id);
    let mut envelope = Envelope::seal(attestation, PAYLOAD_TYPE_ATTESTATION)?;
    envelope.sign(app_signer)?;

    attestations.set(repo, path, &envelope)?;
    attestations.commit(
        repo,
        &format!(
            "Add GitHub pull request attestation for {}",
            attestation.ref_name
        ),
        Some(app_signer),
    )?;
    Ok(())
}
