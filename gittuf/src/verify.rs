//! The verifier: walks the RSL for a reference, loads the policy in
//! effect at each entry, and checks that every state transition was
//! caused by enough of the right principals.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::attestations::{authorization, github, Attestations};
use crate::crypto::{KeyId, Signature};
use crate::git::Oid;
use crate::policy::{self, resolve, PolicyState};
use crate::rsl;
use crate::storage::{self, ObjectKind, ReadRepository};
use crate::tuf::principal::{Principal, PrincipalId};
use crate::tuf::root::RootMetadata;
use crate::Cancel;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage: {0}")]
    Storage(#[from] storage::Error),
    #[error("rsl: {0}")]
    Rsl(#[from] rsl::Error),
    #[error("policy: {0}")]
    Policy(#[from] policy::Error),
    #[error("attestations: {0}")]
    Attestations(#[from] crate::attestations::Error),
    #[error("no reference entries found for `{0}`")]
    NoEntries(String),
    #[error("no policy applies to entry `{0}`")]
    NoPolicy(Oid),
    #[error(
        "verification of `{ref_name}` failed at entry {entry_id}: \
         rule `{rule_name}` requires {threshold} approvals, found {verified}"
    )]
    Unsatisfied {
        ref_name: String,
        entry_id: Oid,
        rule_name: String,
        verified: usize,
        threshold: usize,
    },
    #[error(
        "update of `{ref_name}` at entry {entry_id} violates `{rule_name}`: \
         {new} does not descend from {old}"
    )]
    ForcePush {
        ref_name: String,
        entry_id: Oid,
        rule_name: String,
        old: Oid,
        new: Oid,
    },
    #[error("`{ref_name}` does not match the log: expected {expected}, found {actual}")]
    RefStateDoesNotMatchRsl {
        ref_name: String,
        expected: Oid,
        actual: Oid,
    },
    #[error(transparent)]
    Cancelled(#[from] crate::Cancelled),
}

/// Outcome of one requirement at one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementOutcome {
    pub rule_name: String,
    pub threshold: usize,
    /// Principals whose approval was counted.
    pub approvers: Vec<PrincipalId>,
    pub satisfied: bool,
}

/// Sub-report for one RSL entry.
#[derive(Debug, Clone)]
pub struct EntryReport {
    pub entry_id: Oid,
    pub ref_name: String,
    pub target_id: Oid,
    pub satisfied: Vec<RequirementOutcome>,
    pub unsatisfied: Vec<RequirementOutcome>,
    /// Key ids whose signatures contributed to this entry.
    pub signatures: BTreeSet<KeyId>,
}

/// Structured outcome of verifying a ref across an RSL range.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub ref_name: String,
    pub entries: Vec<EntryReport>,
    /// The tip the local ref must point at for the repository state to
    /// match the log.
    pub expected_tip: Oid,
}

/// Options for [`verify_ref`].
#[derive(Debug, Default, Clone)]
pub struct VerifyOptions {
    /// Start verification at this entry (inclusive) instead of the
    /// oldest entry for the ref.
    pub from_entry: Option<Oid>,
    /// Verify only the newest entry.
    pub latest_only: bool,
    /// Root principals pinned by the caller (eg. at clone time). When
    /// absent, the first applied policy is trusted on first use.
    pub pinned_root: Option<RootMetadata>,
    pub cancel: Cancel,
}

/// Outcome of [`verify_mergeable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mergeable {
    /// Whether the merge can satisfy policy.
    pub ok: bool,
    /// Whether the threshold is one short and the signature on the
    /// eventual RSL entry, by a qualified approver, would complete it.
    pub needs_rsl_signature: bool,
}

/// Verify the RSL history of `ref_name` and check the local ref
/// against the resulting expected tip.
pub fn verify_ref<R: ReadRepository>(
    repo: &R,
    ref_name: &str,
    opts: &VerifyOptions,
) -> Result<VerificationReport, Error> {
    let history = rsl::history_for_ref(repo, ref_name, opts.from_entry)?;
    let mut entries = history.entries;

    if opts.latest_only && entries.len() > 1 {
        entries.drain(..entries.len() - 1);
    }
    if entries.is_empty() {
        return Err(Error::NoEntries(ref_name.to_owned()));
    }

    // The accepted state before the first verified entry.
    let mut previous_target = match rsl::parent_of(repo, entries[0].id)? {
        Some(parent) => rsl::latest_for_ref(
            repo,
            ref_name,
            &rsl::FindOptions {
                unskipped: true,
                before_entry_id: Some(parent.id),
                kind: None,
            },
        )?
        .and_then(|e| e.target_id())
        .unwrap_or_else(Oid::zero),
        None => Oid::zero(),
    };

    let attestations = Attestations::load(repo)?;
    let mut policy_cache: Option<PolicyState> = None;
    let mut reports = Vec::with_capacity(entries.len());

    for entry in &entries {
        opts.cancel.check()?;

        let policy = applicable_policy_cached(
            repo,
            entry.id,
            opts.pinned_root.as_ref(),
            &opts.cancel,
            &mut policy_cache,
        )?
        .ok_or(Error::NoPolicy(entry.id))?;

        let report = verify_entry(
            repo,
            &policy,
            &attestations,
            entry,
            &history.annotations,
            previous_target,
        )?;

        log::debug!(
            target: "verify",
            "Entry {} for {} accepted ({} requirements)",
            entry.id,
            ref_name,
            report.satisfied.len()
        );
        reports.push(report);
        previous_target = entry.target_id().expect("ref history has targets");
    }

    let expected_tip = previous_target;
    let actual = match repo.ref_oid(ref_name) {
        Ok(tip) => tip,
        Err(e) if e.is_not_found() => Oid::zero(),
        Err(e) => return Err(e.into()),
    };
    if actual != expected_tip {
        return Err(Error::RefStateDoesNotMatchRsl {
            ref_name: ref_name.to_owned(),
            expected: expected_tip,
            actual,
        });
    }

    Ok(VerificationReport {
        ref_name: ref_name.to_owned(),
        entries: reports,
        expected_tip,
    })
}

fn applicable_policy_cached<R: ReadRepository>(
    repo: &R,
    entry_id: Oid,
    pinned_root: Option<&RootMetadata>,
    cancel: &Cancel,
    cache: &mut Option<PolicyState>,
) -> Result<Option<PolicyState>, Error> {
    let applicable_entry = rsl::latest_for_ref(
        repo,
        &crate::POLICY_REF,
        &rsl::FindOptions {
            unskipped: true,
            before_entry_id: Some(entry_id),
            kind: Some(rsl::Kind::Reference),
        },
    )?;
    let Some(applicable_entry) = applicable_entry else {
        return Ok(None);
    };
    if let Some(cached) = cache {
        if cached.entry_id == Some(applicable_entry.id) {
            return Ok(Some(cached.clone()));
        }
    }
    let state = policy::applicable_policy(repo, Some(entry_id), pinned_root, cancel)?;
    *cache = state.clone();
    Ok(state)
}

fn verify_entry<R: ReadRepository>(
    repo: &R,
    policy: &PolicyState,
    attestations: &Attestations,
    entry: &rsl::EntryAt,
    annotations: &BTreeMap<Oid, Vec<rsl::EntryAt>>,
    previous_target: Oid,
) -> Result<EntryReport, Error> {
    let ref_name = entry.ref_name().expect("ref history has names").to_owned();
    let target_id = entry.target_id().expect("ref history has targets");
    let requirements = resolve::resolve_for_ref(policy, &ref_name);
    let full_path = format!("{}:{ref_name}", resolve::GIT_NAMESPACE);

    // Block-force-push rules come first: an update that rewinds a
    // protected ref is rejected regardless of approvals.
    let target_kind = repo.object_kind(target_id)?;
    for rule in policy.root.force_push_rules_for(&full_path) {
        if previous_target.is_zero() {
            continue;
        }
        let permitted = match target_kind {
            ObjectKind::Commit => repo.knows_commit(previous_target, target_id)?,
            _ => previous_target == target_id,
        };
        if !permitted {
            return Err(Error::ForcePush {
                ref_name,
                entry_id: entry.id,
                rule_name: rule.name().to_owned(),
                old: previous_target,
                new: target_id,
            });
        }
    }

    // All keys that could matter for this entry.
    let candidates: Vec<&Principal> = requirements
        .iter()
        .flat_map(|r| r.principals.iter())
        .collect();

    let mut signatures: BTreeSet<KeyId> = BTreeSet::new();

    // The signature on the RSL entry commit itself.
    signatures.extend(commit_signature_key_ids(repo, entry.id, &candidates)?);

    // Signatures on annotations referencing this entry.
    if let Some(referencing) = annotations.get(&entry.id) {
        for annotation in referencing {
            signatures.extend(commit_signature_key_ids(repo, annotation.id, &candidates)?);
        }
    }

    // Reference authorizations are keyed by the merge tree for
    // branches and by the target commit for tags.
    let authorization_target = match target_kind {
        ObjectKind::Commit if !ref_name.starts_with("refs/tags/") => {
            repo.read_commit(target_id)?.tree
        }
        ObjectKind::Tag => repo.peel_to_commit(target_id)?,
        _ => target_id,
    };
    if let Some((_, envelope)) = authorization::find(
        repo,
        attestations,
        &ref_name,
        previous_target,
        authorization_target,
    )? {
        signatures.extend(policy::verifying_key_ids(&envelope, &candidates));
    }

    // Approvals recorded by trusted apps count at the principal level.
    let mut app_approved: BTreeSet<PrincipalId> = BTreeSet::new();
    for (app_name, app) in &policy.root.github_apps {
        if !app.trusted {
            continue;
        }
        let app_principals: Vec<&Principal> = app
            .principal_ids
            .iter()
            .filter_map(|id| policy.root.principals.get(id))
            .collect();
        for (approval, envelope) in github::approvals_for(
            repo,
            attestations,
            app_name,
            &ref_name,
            previous_target,
            authorization_target,
        )? {
            if policy::verify_envelope(&envelope, &app_principals, 1).is_err() {
                log::warn!(
                    target: "verify",
                    "Ignoring approval not signed by app `{app_name}`"
                );
                continue;
            }
            for approver in &approval.approvers {
                if !approval.dismissed_approvers.contains(approver) {
                    app_approved.insert(approver.clone());
                }
            }
        }
    }

    let mut satisfied = Vec::new();
    let mut unsatisfied = Vec::new();

    for requirement in &requirements {
        let mut approvers = Vec::new();

        for principal in &requirement.principals {
            let by_key = principal
                .keys()
                .iter()
                .any(|key| signatures.contains(&key.key_id));
            let by_app = app_approved.contains(principal.id());

            if by_key || by_app {
                approvers.push(principal.id().to_owned());
            }
        }
        let outcome = RequirementOutcome {
            rule_name: requirement.rule_name.clone(),
            threshold: requirement.threshold,
            satisfied: approvers.len() >= requirement.threshold,
            approvers,
        };
        if outcome.satisfied {
            satisfied.push(outcome);
        } else {
            unsatisfied.push(outcome);
        }
    }

    if let Some(failed) = unsatisfied.first() {
        return Err(Error::Unsatisfied {
            ref_name,
            entry_id: entry.id,
            rule_name: failed.rule_name.clone(),
            verified: failed.approvers.len(),
            threshold: failed.threshold,
        });
    }

    Ok(EntryReport {
        entry_id: entry.id,
        ref_name,
        target_id,
        satisfied,
        unsatisfied,
        signatures,
    })
}

/// Which of the candidate principals' keys signed the given commit.
fn commit_signature_key_ids<R: ReadRepository>(
    repo: &R,
    commit_id: Oid,
    candidates: &[&Principal],
) -> Result<BTreeSet<KeyId>, Error> {
    let commit = repo.read_commit(commit_id)?;
    let mut out = BTreeSet::new();

    let Some(sig) = commit.signature else {
        return Ok(out);
    };
    let Ok(parsed) = std::str::from_utf8(&sig.signature)
        .map_err(|_| ())
        .and_then(|s| s.parse::<Signature>().map_err(|_| ()))
    else {
        // Signatures in foreign formats are attributed by external
        // verifiers, not here.
        return Ok(out);
    };

    for principal in candidates {
        for key in principal.keys() {
            let Some(public) = key.public_key() else {
                continue;
            };
            if public.verify(&sig.signed_data, &parsed).is_ok() {
                out.insert(key.key_id.clone());
            }
        }
    }
    Ok(out)
}

/// Check whether merging `feature_ref` into `target_ref` would satisfy
/// the policy for `target_ref`, based on the attestations collected so
/// far.
pub fn verify_mergeable<R: ReadRepository>(
    repo: &R,
    target_ref: &str,
    feature_ref: &str,
    opts: &VerifyOptions,
) -> Result<Mergeable, Error> {
    let policy = policy::applicable_policy(repo, None, opts.pinned_root.as_ref(), &opts.cancel)?
        .ok_or_else(|| Error::NoEntries(target_ref.to_owned()))?;
    let transition = authorization::prospective_transition(repo, target_ref, feature_ref)?;
    let requirements = resolve::resolve_for_ref(&policy, target_ref);
    let attestations = Attestations::load(repo)?;

    let candidates: Vec<&Principal> = requirements
        .iter()
        .flat_map(|r| r.principals.iter())
        .collect();
    let mut signatures: BTreeSet<KeyId> = BTreeSet::new();

    if let Some((_, envelope)) = authorization::find(
        repo,
        &attestations,
        target_ref,
        transition.from_id,
        transition.target_id,
    )? {
        signatures.extend(policy::verifying_key_ids(&envelope, &candidates));
    }

    let mut app_approved: BTreeSet<PrincipalId> = BTreeSet::new();
    for (app_name, app) in &policy.root.github_apps {
        if !app.trusted {
            continue;
        }
        let app_principals: Vec<&Principal> = app
            .principal_ids
            .iter()
            .filter_map(|id| policy.root.principals.get(id))
            .collect();
        for (approval, envelope) in github::approvals_for(
            repo,
            &attestations,
            app_name,
            target_ref,
            transition.from_id,
            transition.target_id,
        )? {
            if policy::verify_envelope(&envelope, &app_principals, 1).is_ok() {
                for approver in &approval.approvers {
                    if !approval.dismissed_approvers.contains(approver) {
                        app_approved.insert(approver.clone());
                    }
                }
            }
        }
    }

    let mut short: Vec<&resolve::Requirement> = Vec::new();
    for requirement in &requirements {
        let mut have = 0;
        for principal in &requirement.principals {
            let counted = principal
                .keys()
                .iter()
                .any(|key| signatures.contains(&key.key_id))
                || app_approved.contains(principal.id());
            if counted {
                have += 1;
            }
        }
        if have >= requirement.threshold {
            continue;
        }
        if have + 1 == requirement.threshold {
            short.push(requirement);
        } else {
            return Ok(Mergeable {
                ok: false,
                needs_rsl_signature: false,
            });
        }
    }
    if short.is_empty() {
        return Ok(Mergeable {
            ok: true,
            needs_rsl_signature: false,
        });
    }

    // One more signature can only help if a single principal not yet
    // counted is qualified for every remaining requirement.
    let counted = |p: &Principal| {
        p.keys().iter().any(|key| signatures.contains(&key.key_id))
            || app_approved.contains(p.id())
    };
    let mut completers: Option<BTreeSet<String>> = None;
    for requirement in &short {
        let eligible: BTreeSet<String> = requirement
            .principals
            .iter()
            .filter(|p| !counted(p))
            .map(|p| p.id().to_owned())
            .collect();
        completers = Some(match completers {
            None => eligible,
            Some(prev) => prev.intersection(&eligible).cloned().collect(),
        });
    }
    let ok = completers.is_some_and(|c| !c.is_empty());

    Ok(Mergeable {
        ok,
        needs_rsl_signature: ok,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use nonempty::NonEmpty;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crypto::test::signer::MockSigner;
    use crate::crypto::{Key, Signer as _};
    use crate::rsl::AppendOptions;
    use crate::storage::WriteRepository as _;
    use crate::test::fixtures;
    use crate::tuf::root::GlobalRule;
    use crate::tuf::targets::{Rule, TargetsMetadata};

    fn key_principal(signer: &MockSigner) -> Principal {
        Principal::Key(Key::ed25519(*signer.public_key()))
    }

    /// Apply a policy whose `protect-main` rule requires one approval
    /// by `dev` over `refs/heads/main`.
    fn apply_protect_main_policy(
        repo: &crate::storage::git::Repository,
        owner: &MockSigner,
        dev: &MockSigner,
    ) {
        let mut root = RootMetadata::new(key_principal(owner));
        root.add_primary_rule_principal(key_principal(owner));
        policy::init(repo, root, owner).unwrap();

        let dev_principal = key_principal(dev);
        let dev_id = dev_principal.id().to_owned();
        let mut targets = TargetsMetadata::new();
        targets.add_principal(dev_principal).unwrap();
        targets
            .add_rule(Rule {
                name: "protect-main".to_owned(),
                paths: NonEmpty::new("git:refs/heads/main".to_owned()),
                principal_ids: BTreeSet::from_iter([dev_id]),
                threshold: 1,
                terminating: false,
            })
            .unwrap();

        let mut staged = policy::load_staging(repo).unwrap();
        staged.set_targets(targets, owner).unwrap();
        policy::stage(repo, &staged, "Protect main").unwrap();
        policy::apply(repo, None).unwrap();
    }

    #[test]
    fn test_happy_path() {
        let (repo, _tmp) = fixtures::repository();
        let owner = MockSigner::from_seed([70; 32]);
        let dev = MockSigner::from_seed([71; 32]);

        apply_protect_main_policy(&repo, &owner, &dev);

        let commit = fixtures::commit(&repo, "refs/heads/main", b"feature", &[]);
        rsl::record(&repo, "refs/heads/main", Some(&dev), &AppendOptions::default()).unwrap();

        let report = verify_ref(&repo, "refs/heads/main", &VerifyOptions::default()).unwrap();
        assert_eq!(report.expected_tip, commit);
        assert_eq!(report.entries.len(), 1);
        assert!(report.entries[0]
            .satisfied
            .iter()
            .any(|o| o.rule_name == "protect-main"));
    }

    #[test]
    fn test_unauthorized_signer_fails() {
        let (repo, _tmp) = fixtures::repository();
        let owner = MockSigner::from_seed([72; 32]);
        let dev = MockSigner::from_seed([73; 32]);
        let rogue = MockSigner::from_seed([74; 32]);

        apply_protect_main_policy(&repo, &owner, &dev);

        fixtures::commit(&repo, "refs/heads/main", b"feature", &[]);
        rsl::record(&repo, "refs/heads/main", Some(&rogue), &AppendOptions::default()).unwrap();

        let err = verify_ref(&repo, "refs/heads/main", &VerifyOptions::default()).unwrap_err();
        match err {
            Error::Unsatisfied {
                rule_name,
                verified,
                threshold,
                ..
            } => {
                assert_eq!(rule_name, "protect-main");
                assert_eq!(verified, 0);
                assert_eq!(threshold, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_ref_tip_mismatch() {
        let (repo, _tmp) = fixtures::repository();
        let owner = MockSigner::from_seed([75; 32]);
        let dev = MockSigner::from_seed([76; 32]);

        apply_protect_main_policy(&repo, &owner, &dev);

        let recorded = fixtures::commit(&repo, "refs/heads/main", b"one", &[]);
        rsl::record(&repo, "refs/heads/main", Some(&dev), &AppendOptions::default()).unwrap();

        // A commit the log does not know about.
        fixtures::commit(&repo, "refs/heads/main", b"two", &[recorded]);

        let err = verify_ref(
            &repo,
            "refs/heads/main",
            &VerifyOptions {
                latest_only: true,
                ..VerifyOptions::default()
            },
        )
        .unwrap_err();
        match err {
            Error::RefStateDoesNotMatchRsl { expected, actual, .. } => {
                assert_eq!(expected, recorded);
                assert_ne!(actual, recorded);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_skip_annotation_recovers_history() {
        let (repo, _tmp) = fixtures::repository();
        let owner = MockSigner::from_seed([77; 32]);
        let dev = MockSigner::from_seed([78; 32]);
        let rogue = MockSigner::from_seed([79; 32]);

        apply_protect_main_policy(&repo, &owner, &dev);

        let good = fixtures::commit(&repo, "refs/heads/main", b"good", &[]);
        rsl::record(&repo, "refs/heads/main", Some(&dev), &AppendOptions::default()).unwrap();

        let bad = fixtures::commit(&repo, "refs/heads/main", b"bad", &[good]);
        let bad_entry = rsl::record(&repo, "refs/heads/main", Some(&rogue), &AppendOptions::default())
            .unwrap()
            .entry()
            .clone();

        // Verification fails while the bad entry stands.
        assert!(verify_ref(&repo, "refs/heads/main", &VerifyOptions::default()).is_err());

        // An authorized principal skips it and the branch is reset.
        rsl::annotate(
            &repo,
            vec![bad_entry.id],
            true,
            "unauthorized update".to_owned(),
            Some(&dev),
        )
        .unwrap();
        repo.set_ref("refs/heads/main", good).unwrap();

        let report = verify_ref(&repo, "refs/heads/main", &VerifyOptions::default()).unwrap();
        assert_eq!(report.expected_tip, good);

        let _ = bad;
    }

    #[test]
    fn test_force_push_blocked() {
        let (repo, _tmp) = fixtures::repository();
        let owner = MockSigner::from_seed([80; 32]);
        let dev = MockSigner::from_seed([81; 32]);

        let mut root = RootMetadata::new(key_principal(&owner));
        root.add_primary_rule_principal(key_principal(&owner));
        root.add_global_rule(GlobalRule::BlockForcePush {
            name: "block-force-pushes".to_owned(),
            paths: NonEmpty::new("git:refs/heads/main".to_owned()),
        })
        .unwrap();
        policy::init(&repo, root, &owner).unwrap();
        policy::apply(&repo, None).unwrap();

        let a = fixtures::commit(&repo, "refs/heads/main", b"a", &[]);
        rsl::record(&repo, "refs/heads/main", Some(&dev), &AppendOptions::default()).unwrap();
        let b = fixtures::commit(&repo, "refs/heads/main", b"b", &[a]);
        rsl::record(&repo, "refs/heads/main", Some(&dev), &AppendOptions::default()).unwrap();

        // Fast-forward history verifies.
        verify_ref(&repo, "refs/heads/main", &VerifyOptions::default()).unwrap();

        // Rewind to `a` and record: blocked.
        repo.set_ref("refs/heads/main", a).unwrap();
        rsl::record(&repo, "refs/heads/main", Some(&dev), &AppendOptions::default()).unwrap();

        let err = verify_ref(&repo, "refs/heads/main", &VerifyOptions::default()).unwrap_err();
        match err {
            Error::ForcePush { rule_name, old, new, .. } => {
                assert_eq!(rule_name, "block-force-pushes");
                assert_eq!(old, b);
                assert_eq!(new, a);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_authorization_attestation_satisfies_threshold() {
        let (repo, _tmp) = fixtures::repository();
        let owner = MockSigner::from_seed([82; 32]);
        let dev = MockSigner::from_seed([83; 32]);
        let approver = MockSigner::from_seed([84; 32]);

        // protect-main requires two approvals: dev and approver.
        let mut root = RootMetadata::new(key_principal(&owner));
        root.add_primary_rule_principal(key_principal(&owner));
        policy::init(&repo, root, &owner).unwrap();

        let dev_principal = key_principal(&dev);
        let approver_principal = key_principal(&approver);
        let ids = BTreeSet::from_iter([
            dev_principal.id().to_owned(),
            approver_principal.id().to_owned(),
        ]);
        let mut targets = TargetsMetadata::new();
        targets.add_principal(dev_principal).unwrap();
        targets.add_principal(approver_principal).unwrap();
        targets
            .add_rule(Rule {
                name: "protect-main".to_owned(),
                paths: NonEmpty::new("git:refs/heads/main".to_owned()),
                principal_ids: ids,
                threshold: 2,
                terminating: false,
            })
            .unwrap();
        let mut staged = policy::load_staging(&repo).unwrap();
        staged.set_targets(targets, &owner).unwrap();
        policy::stage(&repo, &staged, "Protect main").unwrap();
        policy::apply(&repo, None).unwrap();

        let base = fixtures::commit(&repo, "refs/heads/main", b"base", &[]);
        rsl::record(&repo, "refs/heads/main", Some(&dev), &AppendOptions::default()).unwrap();
        // The first entry only carries dev's signature; approve it via
        // an attestation over (ref, zero, tree-of-base) as well.
        let base_tree = repo.read_commit(base).unwrap().tree;
        authorization::authorize_transition(
            &repo,
            &approver,
            &authorization::ReferenceAuthorization::new(
                "refs/heads/main",
                Oid::zero(),
                base_tree,
            ),
        )
        .unwrap();

        let report = verify_ref(&repo, "refs/heads/main", &VerifyOptions::default()).unwrap();
        assert_eq!(report.entries[0].satisfied[0].approvers.len(), 2);
    }

    #[test]
    fn test_verify_mergeable() {
        let (repo, _tmp) = fixtures::repository();
        let owner = MockSigner::from_seed([85; 32]);
        let dev = MockSigner::from_seed([86; 32]);
        let approver = MockSigner::from_seed([87; 32]);

        let mut root = RootMetadata::new(key_principal(&owner));
        root.add_primary_rule_principal(key_principal(&owner));
        policy::init(&repo, root, &owner).unwrap();

        let dev_principal = key_principal(&dev);
        let approver_principal = key_principal(&approver);
        let ids = BTreeSet::from_iter([
            dev_principal.id().to_owned(),
            approver_principal.id().to_owned(),
        ]);
        let mut targets = TargetsMetadata::new();
        targets.add_principal(dev_principal).unwrap();
        targets.add_principal(approver_principal).unwrap();
        targets
            .add_rule(Rule {
                name: "protect-main".to_owned(),
                paths: NonEmpty::new("git:refs/heads/main".to_owned()),
                principal_ids: ids,
                threshold: 2,
                terminating: false,
            })
            .unwrap();
        let mut staged = policy::load_staging(&repo).unwrap();
        staged.set_targets(targets, &owner).unwrap();
        policy::stage(&repo, &staged, "Protect main").unwrap();
        policy::apply(&repo, None).unwrap();

        let base = fixtures::commit(&repo, "refs/heads/main", b"base", &[]);
        fixtures::commit(&repo, "refs/heads/feature", b"feature", &[base]);

        // No attestations yet: two approvals missing, one extra
        // signature cannot complete the threshold.
        let mergeable =
            verify_mergeable(&repo, "refs/heads/main", "refs/heads/feature", &VerifyOptions::default())
                .unwrap();
        assert!(!mergeable.ok);

        // One approval in: the merge entry's own signature by the
        // remaining approver can complete it.
        authorization::authorize(&repo, &approver, "refs/heads/main", "refs/heads/feature")
            .unwrap();
        let mergeable =
            verify_mergeable(&repo, "refs/heads/main", "refs/heads/feature", &VerifyOptions::default())
                .unwrap();
        assert!(mergeable.ok);
        assert!(mergeable.needs_rsl_signature);
    }

    #[test]
    fn test_cancellation() {
        let (repo, _tmp) = fixtures::repository();
        let owner = MockSigner::from_seed([88; 32]);
        let dev = MockSigner::from_seed([89; 32]);

        apply_protect_main_policy(&repo, &owner, &dev);
        fixtures::commit(&repo, "refs/heads/main", b"x", &[]);
        rsl::record(&repo, "refs/heads/main", Some(&dev), &AppendOptions::default()).unwrap();

        let cancel = Cancel::new();
        cancel.cancel();
        let err = verify_ref(
            &repo,
            "refs/heads/main",
            &VerifyOptions {
                cancel,
                ..VerifyOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}
