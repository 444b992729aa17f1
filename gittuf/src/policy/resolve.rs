//! Rule resolution over the delegation graph.
//!
//! Resolution answers: for a given namespaced path, which sets of
//! principals must approve, and with what thresholds. The walk is
//! pure; the same policy and path always produce the same
//! requirements, independent of map iteration order.

use std::collections::BTreeSet;

use crate::policy::PolicyState;
use crate::tuf::principal::Principal;
use crate::tuf::targets::TargetsMetadata;
use crate::tuf::TARGETS_ROLE;

/// The `git:` namespace for references.
pub const GIT_NAMESPACE: &str = "git";
/// The `file:` namespace for repository paths.
pub const FILE_NAMESPACE: &str = "file";

/// One approval requirement. Every requirement returned by
/// [`resolve`] must be satisfied independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Name of the rule (or global rule) the requirement stems from.
    pub rule_name: String,
    pub principals: Vec<Principal>,
    pub threshold: usize,
}

enum Walk {
    Continue,
    Terminate,
}

/// Resolve the requirements for `path` in `namespace`.
///
/// Rules are walked in order; a matching rule emits its principals and
/// threshold, recursing pre-order into the nested rule file of the
/// same name when one exists. The walk of a file ends at its terminal
/// allow rule; a matching terminating rule ends resolution entirely.
/// Cycles are broken by refusing to re-enter a rule file.
pub fn resolve(policy: &PolicyState, namespace: &str, path: &str) -> Vec<Requirement> {
    let Some(targets) = &policy.targets else {
        return Vec::new();
    };
    let full_path = format!("{namespace}:{path}");
    let mut requirements = Vec::new();
    let mut visited = BTreeSet::from_iter([TARGETS_ROLE.to_owned()]);

    walk_file(
        policy,
        targets,
        &full_path,
        &mut visited,
        &mut requirements,
    );
    requirements
}

fn walk_file(
    policy: &PolicyState,
    file: &TargetsMetadata,
    path: &str,
    visited: &mut BTreeSet<String>,
    out: &mut Vec<Requirement>,
) -> Walk {
    for rule in &file.rules {
        if !rule.matches(path) {
            continue;
        }
        if rule.is_allow() {
            // Everything below the matched rules is allowed; stop
            // walking this file.
            return Walk::Continue;
        }
        out.push(Requirement {
            rule_name: rule.name.clone(),
            principals: rule
                .principal_ids
                .iter()
                .filter_map(|id| file.principals.get(id))
                .cloned()
                .collect(),
            threshold: rule.threshold,
        });

        if let Some(nested) = policy.delegation(&rule.name) {
            if visited.insert(rule.name.clone()) {
                if let Walk::Terminate = walk_file(policy, nested, path, visited, out) {
                    return Walk::Terminate;
                }
            }
        }
        if rule.terminating {
            return Walk::Terminate;
        }
    }
    Walk::Continue
}

/// Requirements for a Git reference, including the global threshold
/// overlays from root metadata.
///
/// A global threshold rule borrows its candidate approvers from the
/// rule requirements matching the same path; when no rule protects the
/// path, every principal known to the rule files is a candidate.
pub fn resolve_for_ref(policy: &PolicyState, ref_name: &str) -> Vec<Requirement> {
    let mut requirements = resolve(policy, GIT_NAMESPACE, ref_name);
    let full_path = format!("{GIT_NAMESPACE}:{ref_name}");

    for rule in policy.root.threshold_rules_for(&full_path) {
        let crate::tuf::root::GlobalRule::Threshold { name, threshold, .. } = rule else {
            continue;
        };
        let mut candidates: Vec<Principal> = Vec::new();
        let mut seen = BTreeSet::new();
        let pool = if requirements.is_empty() {
            all_principals(policy)
        } else {
            requirements
                .iter()
                .flat_map(|r| r.principals.iter().cloned())
                .collect()
        };
        for principal in pool {
            if seen.insert(principal.id().to_owned()) {
                candidates.push(principal);
            }
        }
        requirements.push(Requirement {
            rule_name: name.clone(),
            principals: candidates,
            threshold: *threshold,
        });
    }
    requirements
}

fn all_principals(policy: &PolicyState) -> Vec<Principal> {
    let mut principals = Vec::new();

    if let Some(targets) = &policy.targets {
        principals.extend(targets.principals.values().cloned());
    }
    for delegation in policy.delegations.values() {
        principals.extend(delegation.principals.values().cloned());
    }
    principals
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use nonempty::NonEmpty;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crypto::test::signer::MockSigner;
    use crate::crypto::{Key, Signer as _};
    use crate::envelope::{Envelope, PAYLOAD_TYPE_METADATA};
    use crate::tuf::root::RootMetadata;
    use crate::tuf::targets::Rule;

    fn principal(seed: u8) -> Principal {
        let signer = MockSigner::from_seed([seed; 32]);
        Principal::Key(Key::ed25519(*signer.public_key()))
    }

    fn rule(name: &str, paths: &[&str], principals: &[&Principal], terminating: bool) -> Rule {
        Rule {
            name: name.to_owned(),
            paths: NonEmpty::from_vec(paths.iter().map(|p| p.to_string()).collect()).unwrap(),
            principal_ids: principals.iter().map(|p| p.id().to_owned()).collect(),
            threshold: 1,
            terminating,
        }
    }

    /// A policy state assembled in memory; envelopes are placeholders
    /// since resolution never consults them.
    fn state(
        targets: TargetsMetadata,
        delegations: Vec<(&str, TargetsMetadata)>,
    ) -> PolicyState {
        let root = RootMetadata::new(principal(99));
        let root_envelope = Envelope::seal(&root, PAYLOAD_TYPE_METADATA).unwrap();

        PolicyState {
            root_envelope,
            targets_envelope: None,
            delegation_envelopes: Default::default(),
            root,
            targets: Some(targets),
            delegations: delegations
                .into_iter()
                .map(|(name, t)| (name.to_owned(), t))
                .collect(),
            entry_id: None,
            commit_id: None,
        }
    }

    fn targets_with(principals: &[&Principal], rules: Vec<Rule>) -> TargetsMetadata {
        let mut targets = TargetsMetadata::new();
        for p in principals {
            targets.add_principal((*p).clone()).unwrap();
        }
        for r in rules {
            targets.add_rule(r).unwrap();
        }
        targets
    }

    #[test]
    fn test_resolution_is_ordered_and_pure() {
        let alice = principal(1);
        let bob = principal(2);
        let targets = targets_with(
            &[&alice, &bob],
            vec![
                rule("protect-main", &["git:refs/heads/main"], &[&alice], false),
                rule("protect-heads", &["git:refs/heads/*"], &[&bob], false),
            ],
        );
        let policy = state(targets, vec![]);

        let reqs = resolve(&policy, GIT_NAMESPACE, "refs/heads/main");
        assert_eq!(
            reqs.iter().map(|r| r.rule_name.as_str()).collect::<Vec<_>>(),
            vec!["protect-main", "protect-heads"]
        );

        // Same inputs, same output.
        assert_eq!(resolve(&policy, GIT_NAMESPACE, "refs/heads/main"), reqs);

        // A path matched only by the wildcard rule.
        let reqs = resolve(&policy, GIT_NAMESPACE, "refs/heads/feature");
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].rule_name, "protect-heads");

        // A path nothing protects.
        assert!(resolve(&policy, GIT_NAMESPACE, "refs/tags/v1").is_empty());
    }

    #[test]
    fn test_terminating_rule_stops_resolution() {
        let alice = principal(1);
        let bob = principal(2);
        let targets = targets_with(
            &[&alice, &bob],
            vec![
                rule("protect-main", &["git:refs/heads/main"], &[&alice], true),
                rule("protect-heads", &["git:refs/heads/*"], &[&bob], false),
            ],
        );
        let policy = state(targets, vec![]);

        let reqs = resolve(&policy, GIT_NAMESPACE, "refs/heads/main");
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].rule_name, "protect-main");
    }

    #[test]
    fn test_delegation_extends_requirements() {
        let alice = principal(1);
        let carol = principal(3);
        let nested = targets_with(
            &[&carol],
            vec![rule("src-core", &["file:src/core/*"], &[&carol], false)],
        );
        let targets = targets_with(
            &[&alice],
            vec![rule("src", &["file:src/*"], &[&alice], false)],
        );
        let policy = state(targets, vec![("src", nested)]);

        let reqs = resolve(&policy, FILE_NAMESPACE, "src/core/main.rs");
        assert_eq!(
            reqs.iter().map(|r| r.rule_name.as_str()).collect::<Vec<_>>(),
            vec!["src", "src-core"]
        );
        assert_eq!(reqs[1].principals[0].id(), carol.id());

        // Outside the nested scope only the outer rule applies.
        let reqs = resolve(&policy, FILE_NAMESPACE, "src/lib.rs");
        assert_eq!(
            reqs.iter().map(|r| r.rule_name.as_str()).collect::<Vec<_>>(),
            vec!["src"]
        );
    }

    #[test]
    fn test_delegation_cycle_is_broken() {
        let alice = principal(1);
        let bob = principal(2);
        // `a` delegates to `b` and `b` back to `a`.
        let file_a = targets_with(&[&bob], vec![rule("b", &["file:src/*"], &[&bob], false)]);
        let file_b = targets_with(&[&alice], vec![rule("a", &["file:src/*"], &[&alice], false)]);
        let targets = targets_with(&[&alice], vec![rule("a", &["file:src/*"], &[&alice], false)]);
        let policy = state(targets, vec![("a", file_a), ("b", file_b)]);

        let reqs = resolve(&policy, FILE_NAMESPACE, "src/main.rs");
        // a (primary), b (nested), then `a` again is refused.
        assert_eq!(
            reqs.iter().map(|r| r.rule_name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "a"]
        );
    }

    #[test]
    fn test_global_threshold_overlay() {
        let alice = principal(1);
        let bob = principal(2);
        let targets = targets_with(
            &[&alice, &bob],
            vec![rule(
                "protect-main",
                &["git:refs/heads/main"],
                &[&alice, &bob],
                false,
            )],
        );
        let mut policy = state(targets, vec![]);
        policy
            .root
            .add_global_rule(crate::tuf::root::GlobalRule::Threshold {
                name: "two-eyes".to_owned(),
                paths: NonEmpty::new("git:refs/heads/*".to_owned()),
                threshold: 2,
            })
            .unwrap();

        let reqs = resolve_for_ref(&policy, "refs/heads/main");
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].rule_name, "two-eyes");
        assert_eq!(reqs[1].threshold, 2);
        let ids: BTreeSet<&str> = reqs[1].principals.iter().map(|p| p.id()).collect();
        assert_eq!(ids.len(), 2);
    }
}
