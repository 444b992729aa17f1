//! Policy state: the signed metadata in effect at a point in RSL
//! history.
//!
//! A policy is the aggregate of a root envelope, an optional primary
//! rule-file envelope, and any nested rule-file envelopes, materialized
//! from one commit on the policy ref. Changes are assembled and signed
//! on the staging ref, then promoted by [`apply`], which re-verifies
//! the whole chain and records the promotion in the RSL.

pub mod resolve;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use thiserror::Error;

use crate::crypto::{KeyId, Signer, Verifier};
use crate::envelope::{self, Envelope, PAYLOAD_TYPE_METADATA};
use crate::git::Oid;
use crate::rsl;
use crate::storage::{self, read_nested_tree, write_nested_tree, ReadRepository, WriteRepository};
use crate::tuf::principal::Principal;
use crate::tuf::root::RootMetadata;
use crate::tuf::targets::TargetsMetadata;
use crate::tuf::{self, TARGETS_ROLE};
use crate::{POLICY_REF, POLICY_STAGING_REF};

/// Tree path of the root envelope in a policy commit.
pub const ROOT_PATH: &str = "metadata/root.json";
/// Tree path of the primary rule-file envelope.
pub const TARGETS_PATH: &str = "metadata/targets.json";

fn delegation_path(name: &str) -> String {
    format!("metadata/{name}.json")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage: {0}")]
    Storage(#[from] storage::Error),
    #[error("rsl: {0}")]
    Rsl(#[from] rsl::Error),
    #[error("envelope: {0}")]
    Envelope(#[from] envelope::Error),
    #[error("metadata: {0}")]
    Tuf(#[from] tuf::Error),
    #[error("policy metadata not found")]
    NotFound,
    #[error("policy is already initialized")]
    AlreadyExists,
    #[error("verification of `{name}` failed: {source}")]
    Verification {
        name: String,
        #[source]
        source: envelope::Error,
    },
    #[error(transparent)]
    Cancelled(#[from] crate::Cancelled),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound => true,
            Self::Storage(e) => e.is_not_found(),
            Self::Rsl(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Where to locate the policy commit.
#[derive(Debug, Default, Clone)]
pub struct LoadOptions {
    /// Use the latest policy entry at or before this RSL entry instead
    /// of the newest one.
    pub before_entry_id: Option<Oid>,
    /// Read the ref directly instead of consulting the RSL. Used for
    /// staged (not yet applied) policy.
    pub bypass_rsl: bool,
}

/// The policy in effect at one commit on a policy ref.
#[derive(Debug, Clone)]
pub struct PolicyState {
    pub root_envelope: Envelope,
    pub targets_envelope: Option<Envelope>,
    pub delegation_envelopes: BTreeMap<String, Envelope>,
    pub root: RootMetadata,
    pub targets: Option<TargetsMetadata>,
    pub delegations: BTreeMap<String, TargetsMetadata>,
    /// The RSL entry the state was located through, if any.
    pub entry_id: Option<Oid>,
    /// The policy commit the state was read from, if any.
    pub commit_id: Option<Oid>,
}

impl PolicyState {
    /// A fresh, unsaved state carrying the given root metadata, signed
    /// by `signer`.
    pub fn init(root: RootMetadata, signer: &dyn Signer) -> Result<Self, Error> {
        root.validate()?;
        let mut root_envelope = Envelope::seal(&root, PAYLOAD_TYPE_METADATA)?;
        root_envelope.sign(signer)?;

        Ok(Self {
            root_envelope,
            targets_envelope: None,
            delegation_envelopes: BTreeMap::new(),
            root,
            targets: None,
            delegations: BTreeMap::new(),
            entry_id: None,
            commit_id: None,
        })
    }

    /// Replace the root metadata. Prior signatures are dropped since
    /// they no longer cover the payload; `signer` provides the first
    /// new one.
    pub fn set_root(&mut self, root: RootMetadata, signer: &dyn Signer) -> Result<(), Error> {
        root.validate()?;
        let mut envelope = Envelope::seal(&root, PAYLOAD_TYPE_METADATA)?;
        envelope.sign(signer)?;
        self.root = root;
        self.root_envelope = envelope;
        Ok(())
    }

    /// Add a signature over the current root payload.
    pub fn sign_root(&mut self, signer: &dyn Signer) -> Result<(), Error> {
        self.root_envelope.resign(signer)?;
        Ok(())
    }

    /// Replace the primary rule file, as [`PolicyState::set_root`] does
    /// for root.
    pub fn set_targets(
        &mut self,
        targets: TargetsMetadata,
        signer: &dyn Signer,
    ) -> Result<(), Error> {
        targets.validate()?;
        let mut envelope = Envelope::seal(&targets, PAYLOAD_TYPE_METADATA)?;
        envelope.sign(signer)?;
        self.targets = Some(targets);
        self.targets_envelope = Some(envelope);
        Ok(())
    }

    pub fn sign_targets(&mut self, signer: &dyn Signer) -> Result<(), Error> {
        let envelope = self.targets_envelope.as_mut().ok_or(Error::NotFound)?;
        envelope.resign(signer)?;
        Ok(())
    }

    /// Replace or add a nested rule file.
    pub fn set_delegation(
        &mut self,
        name: &str,
        targets: TargetsMetadata,
        signer: &dyn Signer,
    ) -> Result<(), Error> {
        targets.validate()?;
        let mut envelope = Envelope::seal(&targets, PAYLOAD_TYPE_METADATA)?;
        envelope.sign(signer)?;
        self.delegations.insert(name.to_owned(), targets);
        self.delegation_envelopes.insert(name.to_owned(), envelope);
        Ok(())
    }

    pub fn remove_delegation(&mut self, name: &str) -> Result<(), Error> {
        if self.delegations.remove(name).is_none() {
            return Err(Error::NotFound);
        }
        self.delegation_envelopes.remove(name);
        Ok(())
    }

    /// The rule file delegated to by `name`, when present.
    pub fn delegation(&self, name: &str) -> Option<&TargetsMetadata> {
        self.delegations.get(name)
    }

    /// Verify every envelope of this state.
    ///
    /// The root envelope is checked against `trusted_root` when given
    /// (continuity with the previously applied policy or a caller
    /// pinning), and always against its own principals (self-signing,
    /// which carries rotation). The targets envelope is checked
    /// against the verified root's primary-rule role, and each
    /// reachable delegation against its delegating rule.
    pub fn verify(&self, trusted_root: Option<&RootMetadata>) -> Result<(), Error> {
        match trusted_root {
            Some(trusted) => {
                verify_envelope(
                    &self.root_envelope,
                    &trusted.root_principals(),
                    trusted.roles.root.threshold,
                )
                .map_err(|source| Error::Verification {
                    name: tuf::ROOT_ROLE.to_owned(),
                    source,
                })?;
            }
            None => {
                log::warn!(
                    target: "policy",
                    "No trusted root supplied; trusting policy root on first use"
                );
            }
        }
        verify_envelope(
            &self.root_envelope,
            &self.root.root_principals(),
            self.root.roles.root.threshold,
        )
        .map_err(|source| Error::Verification {
            name: tuf::ROOT_ROLE.to_owned(),
            source,
        })?;

        if let Some(targets_envelope) = &self.targets_envelope {
            let role = self
                .root
                .roles
                .targets
                .as_ref()
                .ok_or(Error::Tuf(tuf::Error::Invalid(
                    "a rule file is present but no principals are authorized for it",
                )))?;
            verify_envelope(
                targets_envelope,
                &self.root.primary_rule_principals(),
                role.threshold,
            )
            .map_err(|source| Error::Verification {
                name: TARGETS_ROLE.to_owned(),
                source,
            })?;
        }

        self.verify_delegations()?;
        Ok(())
    }

    /// Verify reachable delegation envelopes, pre-order from the
    /// primary rule file. Unreachable envelopes are ignored.
    fn verify_delegations(&self) -> Result<(), Error> {
        let Some(targets) = &self.targets else {
            return Ok(());
        };
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut queue: Vec<(&TargetsMetadata, &str)> = vec![(targets, TARGETS_ROLE)];

        while let Some((file, _)) = queue.pop() {
            for rule in &file.rules {
                if rule.is_allow() {
                    continue;
                }
                let Some(envelope) = self.delegation_envelopes.get(&rule.name) else {
                    continue;
                };
                if !visited.insert(rule.name.as_str()) {
                    continue;
                }
                let principals: Vec<&Principal> = rule
                    .principal_ids
                    .iter()
                    .filter_map(|id| file.principals.get(id))
                    .collect();
                verify_envelope(envelope, &principals, rule.threshold).map_err(|source| {
                    Error::Verification {
                        name: rule.name.clone(),
                        source,
                    }
                })?;
                if let Some(nested) = self.delegations.get(&rule.name) {
                    queue.push((nested, rule.name.as_str()));
                }
            }
        }
        Ok(())
    }
}

/// Verify an envelope against principals, counting each principal at
/// most once no matter how many of its keys signed.
pub fn verify_envelope(
    envelope: &Envelope,
    principals: &[&Principal],
    threshold: usize,
) -> Result<(), envelope::Error> {
    if threshold == 0 {
        return Err(envelope::Error::ZeroThreshold);
    }
    let pae = envelope.pae();
    let mut satisfied = 0;

    for principal in principals {
        let verified = principal.keys().into_iter().any(|key| {
            envelope
                .signatures
                .iter()
                .filter(|s| s.key_id == key.key_id)
                .any(|s| key.verify(&pae, &s.sig).is_ok())
        });
        if verified {
            satisfied += 1;
        }
    }
    if satisfied >= threshold {
        Ok(())
    } else {
        Err(envelope::Error::InsufficientSignatures {
            verified: satisfied,
            threshold,
        })
    }
}

/// Key ids that verify the envelope, drawn from the given principals'
/// keys. Used by the verifier to attribute attestation signatures.
pub fn verifying_key_ids(envelope: &Envelope, principals: &[&Principal]) -> BTreeSet<KeyId> {
    let pae = envelope.pae();
    let mut out = BTreeSet::new();

    for principal in principals {
        for key in principal.keys() {
            let ok = envelope
                .signatures
                .iter()
                .filter(|s| s.key_id == key.key_id)
                .any(|s| key.verify(&pae, &s.sig).is_ok());
            if ok {
                out.insert(key.key_id.clone());
            }
        }
    }
    out
}

/// Read the envelopes in a policy commit without verifying anything.
pub fn read_state_at<R: ReadRepository>(repo: &R, commit_id: Oid) -> Result<PolicyState, Error> {
    let commit = repo.read_commit(commit_id)?;
    let leaves = read_nested_tree(repo, commit.tree)?;

    let mut root_envelope = None;
    let mut targets_envelope = None;
    let mut delegation_envelopes = BTreeMap::new();

    for (path, blob_id) in &leaves {
        let Some(name) = path
            .strip_prefix("metadata/")
            .and_then(|f| f.strip_suffix(".json"))
        else {
            continue;
        };
        let bytes = repo.read_blob(*blob_id)?;
        let envelope: Envelope = serde_json::from_slice(&bytes).map_err(envelope::Error::from)?;

        match name {
            tuf::ROOT_ROLE => root_envelope = Some(envelope),
            TARGETS_ROLE => targets_envelope = Some(envelope),
            other => {
                delegation_envelopes.insert(other.to_owned(), envelope);
            }
        }
    }

    let root_envelope = root_envelope.ok_or(Error::NotFound)?;
    let root = RootMetadata::from_json(&root_envelope.payload)?;
    let targets = targets_envelope
        .as_ref()
        .map(|e| TargetsMetadata::from_json(&e.payload))
        .transpose()?;
    let delegations = delegation_envelopes
        .iter()
        .map(|(name, e)| Ok((name.clone(), TargetsMetadata::from_json(&e.payload)?)))
        .collect::<Result<BTreeMap<_, _>, tuf::Error>>()?;

    Ok(PolicyState {
        root_envelope,
        targets_envelope,
        delegation_envelopes,
        root,
        targets,
        delegations,
        entry_id: None,
        commit_id: Some(commit_id),
    })
}

/// Load and verify the policy on `ref_name`.
///
/// Returns `None` when the policy does not exist (yet). The root is
/// checked against `trusted_root` when supplied; otherwise the
/// repository is trusted on first use.
pub fn load<R: ReadRepository>(
    repo: &R,
    ref_name: &str,
    opts: &LoadOptions,
    trusted_root: Option<&RootMetadata>,
) -> Result<Option<PolicyState>, Error> {
    let located = if opts.bypass_rsl {
        match repo.ref_oid(ref_name) {
            Ok(commit) => Some((None, commit)),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        }
    } else {
        rsl::latest_for_ref(
            repo,
            ref_name,
            &rsl::FindOptions {
                unskipped: true,
                before_entry_id: opts.before_entry_id,
                kind: Some(rsl::Kind::Reference),
            },
        )?
        .map(|entry| {
            let target = entry.target_id().expect("reference entries have targets");
            (Some(entry.id), target)
        })
    };
    let Some((entry_id, commit_id)) = located else {
        return Ok(None);
    };

    let mut state = read_state_at(repo, commit_id)?;
    state.entry_id = entry_id;
    state.verify(trusted_root)?;

    Ok(Some(state))
}

/// The applied policy in effect at or before the given RSL entry,
/// verified along the chain of policy promotions.
///
/// Each promotion's root is checked under the previous promotion's
/// root (continuity); the first is checked against `pinned_root` when
/// given, and trusted on first use otherwise.
pub fn applicable_policy<R: ReadRepository>(
    repo: &R,
    before_entry_id: Option<Oid>,
    pinned_root: Option<&RootMetadata>,
    cancel: &crate::Cancel,
) -> Result<Option<PolicyState>, Error> {
    let mut chain = Vec::new();
    let mut cursor = rsl::latest_for_ref(
        repo,
        &POLICY_REF,
        &rsl::FindOptions {
            unskipped: true,
            before_entry_id,
            kind: Some(rsl::Kind::Reference),
        },
    )?;
    while let Some(entry) = cursor {
        chain.push(entry.clone());
        cursor = rsl::parent_of(repo, entry.id)?.and_then(|parent| {
            rsl::latest_for_ref(
                repo,
                &POLICY_REF,
                &rsl::FindOptions {
                    unskipped: true,
                    before_entry_id: Some(parent.id),
                    kind: Some(rsl::Kind::Reference),
                },
            )
            .transpose()
        })
        .transpose()?;
    }
    chain.reverse();

    let mut prev: Option<PolicyState> = None;
    for entry in chain {
        cancel.check()?;
        let commit_id = entry.target_id().expect("reference entries have targets");
        let mut state = read_state_at(repo, commit_id)?;
        state.entry_id = Some(entry.id);
        state.verify(prev.as_ref().map(|p| &p.root).or(pinned_root))?;
        prev = Some(state);
    }
    Ok(prev)
}

fn commit_state<R: WriteRepository>(
    repo: &R,
    state: &PolicyState,
    ref_name: &str,
    message: &str,
) -> Result<Oid, Error> {
    let mut leaves = BTreeMap::new();

    let root_bytes = crate::canonical::encode(&state.root_envelope)
        .map_err(envelope::Error::from)?;
    leaves.insert(ROOT_PATH.to_owned(), repo.write_blob(&root_bytes)?);

    if let Some(targets_envelope) = &state.targets_envelope {
        let bytes = crate::canonical::encode(targets_envelope).map_err(envelope::Error::from)?;
        leaves.insert(TARGETS_PATH.to_owned(), repo.write_blob(&bytes)?);
    }
    for (name, envelope) in &state.delegation_envelopes {
        let bytes = crate::canonical::encode(envelope).map_err(envelope::Error::from)?;
        leaves.insert(delegation_path(name), repo.write_blob(&bytes)?);
    }

    let tree = write_nested_tree(repo, &leaves)?;
    let parents = match repo.ref_oid(ref_name) {
        Ok(tip) => vec![tip],
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let commit = repo.commit(tree, &parents, message, None)?;

    repo.set_ref(ref_name, commit)?;
    Ok(commit)
}

/// Initialize the staging policy with fresh root metadata. Fails if a
/// policy (staged or applied) already exists.
pub fn init<R: WriteRepository>(
    repo: &R,
    root: RootMetadata,
    signer: &dyn Signer,
) -> Result<Oid, Error> {
    for ref_name in [*POLICY_STAGING_REF, *POLICY_REF] {
        match repo.ref_oid(ref_name) {
            Ok(_) => return Err(Error::AlreadyExists),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    let state = PolicyState::init(root, signer)?;

    commit_state(repo, &state, &POLICY_STAGING_REF, "Initialize policy")
}

/// Load the staged policy without verifying thresholds: staged
/// metadata may still be collecting signatures.
pub fn load_staging<R: ReadRepository>(repo: &R) -> Result<PolicyState, Error> {
    let commit = repo
        .ref_oid(&POLICY_STAGING_REF)
        .map_err(|e| if e.is_not_found() { Error::NotFound } else { e.into() })?;

    read_state_at(repo, commit)
}

/// Write the given state to the staging ref.
pub fn stage<R: WriteRepository>(
    repo: &R,
    state: &PolicyState,
    message: &str,
) -> Result<Oid, Error> {
    commit_state(repo, state, &POLICY_STAGING_REF, message)
}

/// Promote the staged policy: re-verify it against the currently
/// applied policy, commit it to the policy ref, and record the
/// promotion in the RSL.
pub fn apply<R: WriteRepository>(
    repo: &R,
    signer: Option<&dyn Signer>,
) -> Result<rsl::EntryAt, Error> {
    let staged = load_staging(repo)?;
    let applied = load(repo, &POLICY_REF, &LoadOptions::default(), None)?;

    staged.verify(applied.as_ref().map(|p| &p.root))?;

    let commit = commit_state(repo, &staged, &POLICY_REF, "Apply policy")?;
    let appended = rsl::append(
        repo,
        rsl::Entry::Reference(rsl::ReferenceEntry {
            ref_name: POLICY_REF.to_string(),
            target_id: commit,
            number: 0,
        }),
        signer,
        &rsl::AppendOptions::default(),
    )?;

    log::info!(target: "policy", "Applied policy at {commit}");
    match appended {
        rsl::Appended::Written(entry) => Ok(entry),
        // The RSL already records this exact policy commit.
        rsl::Appended::Unchanged { latest } => Ok(latest),
    }
}

/// Drop staged edits, resetting the staging ref to the applied policy.
pub fn discard<R: WriteRepository>(repo: &R) -> Result<(), Error> {
    match repo.ref_oid(&POLICY_REF) {
        Ok(tip) => {
            repo.set_ref(&POLICY_STAGING_REF, tip)?;
        }
        Err(e) if e.is_not_found() => match repo.delete_ref(&POLICY_STAGING_REF) {
            Ok(()) | Err(storage::Error::RefNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        },
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Blob path helpers used by tests and the CLI to show where metadata
/// lives.
pub fn metadata_path(name: &str) -> String {
    match name {
        tuf::ROOT_ROLE => ROOT_PATH.to_owned(),
        TARGETS_ROLE => TARGETS_PATH.to_owned(),
        other => delegation_path(other),
    }
}

/// Convenience for reading a single metadata blob at a commit.
pub fn blob_at<R: ReadRepository>(repo: &R, commit: Oid, name: &str) -> Result<Vec<u8>, Error> {
    repo.blob_at(commit, Path::new(&metadata_path(name)))
        .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crypto::test::signer::MockSigner;
    use crate::crypto::{Key, Signer as _};
    use crate::test::fixtures;
    use crate::tuf::targets::Rule;

    fn key_principal(signer: &MockSigner) -> Principal {
        Principal::Key(Key::ed25519(*signer.public_key()))
    }

    #[test]
    fn test_init_and_load_staging() {
        let (repo, _tmp) = fixtures::repository();
        let signer = MockSigner::from_seed([31; 32]);

        init(&repo, RootMetadata::new(key_principal(&signer)), &signer).unwrap();
        let staged = load_staging(&repo).unwrap();

        assert_eq!(staged.root.root_principals().len(), 1);
        assert!(staged.verify(None).is_ok());

        // A second init is refused.
        let err = init(&repo, RootMetadata::new(key_principal(&signer)), &signer).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
    }

    #[test]
    fn test_apply_records_rsl_entry() {
        let (repo, _tmp) = fixtures::repository();
        let signer = MockSigner::from_seed([32; 32]);

        init(&repo, RootMetadata::new(key_principal(&signer)), &signer).unwrap();
        let entry = apply(&repo, None).unwrap();

        assert_eq!(entry.ref_name(), Some(*POLICY_REF));
        let commit = repo.ref_oid(&POLICY_REF).unwrap();
        assert_eq!(entry.target_id(), Some(commit));

        let applied = load(&repo, &POLICY_REF, &LoadOptions::default(), None)
            .unwrap()
            .expect("policy must exist");
        assert_eq!(applied.commit_id, Some(commit));
        assert_eq!(applied.entry_id, Some(entry.id));
    }

    #[test]
    fn test_apply_requires_threshold() {
        let (repo, _tmp) = fixtures::repository();
        let alice = MockSigner::from_seed([33; 32]);
        let bob = MockSigner::from_seed([34; 32]);

        let mut root = RootMetadata::new(key_principal(&alice));
        root.add_root_principal(key_principal(&bob));
        root.set_root_threshold(2).unwrap();

        init(&repo, root, &alice).unwrap();

        // One signature, threshold two.
        let err = apply(&repo, None).unwrap_err();
        assert!(matches!(err, Error::Verification { .. }));

        // The second root holder signs the staged envelope.
        let mut staged = load_staging(&repo).unwrap();
        staged.sign_root(&bob).unwrap();
        stage(&repo, &staged, "Add second root signature").unwrap();

        apply(&repo, None).unwrap();
    }

    #[test]
    fn test_rotation_requires_old_and_new_roots() {
        let (repo, _tmp) = fixtures::repository();
        let old = MockSigner::from_seed([35; 32]);
        let new = MockSigner::from_seed([36; 32]);

        init(&repo, RootMetadata::new(key_principal(&old)), &old).unwrap();
        apply(&repo, None).unwrap();

        // Rotate to the new key. Signed only by the new key: continuity
        // with the applied root fails.
        let mut staged = load_staging(&repo).unwrap();
        let mut root = staged.root.clone();
        root.add_root_principal(key_principal(&new));
        root.remove_root_principal(key_principal(&old).id()).unwrap();
        staged.set_root(root, &new).unwrap();
        stage(&repo, &staged, "Rotate root").unwrap();

        let err = apply(&repo, None).unwrap_err();
        assert!(matches!(err, Error::Verification { .. }));

        // With the old key's signature as well, rotation is accepted.
        let mut staged = load_staging(&repo).unwrap();
        staged.sign_root(&old).unwrap();
        stage(&repo, &staged, "Old root countersigns").unwrap();
        apply(&repo, None).unwrap();
    }

    #[test]
    fn test_targets_verified_against_root_role() {
        let (repo, _tmp) = fixtures::repository();
        let root_signer = MockSigner::from_seed([37; 32]);
        let targets_signer = MockSigner::from_seed([38; 32]);
        let rogue = MockSigner::from_seed([39; 32]);

        let mut root = RootMetadata::new(key_principal(&root_signer));
        root.add_primary_rule_principal(key_principal(&targets_signer));
        init(&repo, root, &root_signer).unwrap();

        // Signed by a key not in the targets role.
        let mut staged = load_staging(&repo).unwrap();
        staged
            .set_targets(TargetsMetadata::new(), &rogue)
            .unwrap();
        stage(&repo, &staged, "Init rule file").unwrap();
        let err = apply(&repo, None).unwrap_err();
        assert!(matches!(err, Error::Verification { .. }));

        // Signed by the authorized key.
        let mut staged = load_staging(&repo).unwrap();
        staged.sign_targets(&targets_signer).unwrap();
        stage(&repo, &staged, "Sign rule file").unwrap();
        apply(&repo, None).unwrap();
    }

    #[test]
    fn test_delegation_verified_against_delegating_rule() {
        let (repo, _tmp) = fixtures::repository();
        let root_signer = MockSigner::from_seed([40; 32]);
        let delegate = MockSigner::from_seed([41; 32]);

        let mut root = RootMetadata::new(key_principal(&root_signer));
        root.add_primary_rule_principal(key_principal(&root_signer));
        init(&repo, root, &root_signer).unwrap();

        let delegate_principal = key_principal(&delegate);
        let delegate_id = delegate_principal.id().to_owned();

        let mut targets = TargetsMetadata::new();
        targets.add_principal(delegate_principal).unwrap();
        targets
            .add_rule(Rule {
                name: "src".to_owned(),
                paths: nonempty::NonEmpty::new("file:src/*".to_owned()),
                principal_ids: std::collections::BTreeSet::from_iter([delegate_id]),
                threshold: 1,
                terminating: false,
            })
            .unwrap();

        let mut staged = load_staging(&repo).unwrap();
        staged.set_targets(targets, &root_signer).unwrap();
        // The nested file must be signed by the delegate named in the
        // `src` rule, not by root.
        staged
            .set_delegation("src", TargetsMetadata::new(), &root_signer)
            .unwrap();
        stage(&repo, &staged, "Delegate src").unwrap();
        let err = apply(&repo, None).unwrap_err();
        assert!(matches!(err, Error::Verification { .. }));

        let mut staged = load_staging(&repo).unwrap();
        let nested = staged.delegation("src").cloned().unwrap();
        staged.set_delegation("src", nested, &delegate).unwrap();
        stage(&repo, &staged, "Delegate signs src").unwrap();
        apply(&repo, None).unwrap();
    }

    #[test]
    fn test_discard_resets_staging() {
        let (repo, _tmp) = fixtures::repository();
        let signer = MockSigner::from_seed([42; 32]);

        init(&repo, RootMetadata::new(key_principal(&signer)), &signer).unwrap();
        apply(&repo, None).unwrap();
        let applied_tip = repo.ref_oid(&POLICY_REF).unwrap();

        // Stage an edit, then drop it.
        let mut staged = load_staging(&repo).unwrap();
        let mut root = staged.root.clone();
        root.add_root_principal(key_principal(&MockSigner::from_seed([43; 32])));
        staged.set_root(root, &signer).unwrap();
        stage(&repo, &staged, "Add root principal").unwrap();
        assert_ne!(repo.ref_oid(&POLICY_STAGING_REF).unwrap(), applied_tip);

        discard(&repo).unwrap();
        assert_eq!(repo.ref_oid(&POLICY_STAGING_REF).unwrap(), applied_tip);
    }

    #[test]
    fn test_applicable_policy_walks_chain() {
        let (repo, _tmp) = fixtures::repository();
        let signer = MockSigner::from_seed([44; 32]);

        init(&repo, RootMetadata::new(key_principal(&signer)), &signer).unwrap();
        let first_entry = apply(&repo, None).unwrap();

        let mut staged = load_staging(&repo).unwrap();
        let mut root = staged.root.clone();
        root.add_root_principal(key_principal(&MockSigner::from_seed([45; 32])));
        staged.set_root(root, &signer).unwrap();
        stage(&repo, &staged, "Add root principal").unwrap();
        let second_entry = apply(&repo, None).unwrap();

        let cancel = crate::Cancel::new();
        let at_first = applicable_policy(&repo, Some(first_entry.id), None, &cancel)
            .unwrap()
            .unwrap();
        assert_eq!(at_first.entry_id, Some(first_entry.id));
        assert_eq!(at_first.root.root_principals().len(), 1);

        let latest = applicable_policy(&repo, None, None, &cancel).unwrap().unwrap();
        assert_eq!(latest.entry_id, Some(second_entry.id));
        assert_eq!(latest.root.root_principals().len(), 2);
    }
}
