//! Root metadata: the trust anchor of a policy.
//!
//! Root names the principals for the root role itself and for the
//! primary rule file, carries repository-wide global rules, propagation
//! directives, app roles, hook declarations, and references to
//! controller and network repositories.

use std::collections::{BTreeMap, BTreeSet};

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};

use crate::crypto::{Key, KeyId};
use crate::hooks::{Hook, Stage};
use crate::tuf::principal::{Principal, PrincipalId};
use crate::tuf::{pattern_matches, Error, Role, SchemaVersion};

/// Reserved app role name, used when no explicit name is given.
pub const GITHUB_APP_ROLE_NAME: &str = "github-app";

/// A GitHub app role trusted to issue approval attestations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubApp {
    pub principal_ids: BTreeSet<PrincipalId>,
    /// Approval attestations from this app only count while trusted.
    pub trusted: bool,
}

/// A policy-wide requirement overlaying per-rule requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum GlobalRule {
    /// An additional approval threshold over matching namespaces.
    Threshold {
        name: String,
        paths: NonEmpty<String>,
        threshold: usize,
    },
    /// Matching references may only move to descendants of their
    /// previous state.
    BlockForcePush {
        name: String,
        paths: NonEmpty<String>,
    },
}

impl GlobalRule {
    pub fn name(&self) -> &str {
        match self {
            Self::Threshold { name, .. } => name,
            Self::BlockForcePush { name, .. } => name,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        let paths = match self {
            Self::Threshold { paths, .. } => paths,
            Self::BlockForcePush { paths, .. } => paths,
        };
        paths.iter().any(|p| pattern_matches(p, path))
    }
}

/// Declarative instruction to fold an upstream repository's subtree
/// into a downstream subtree on each new upstream entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationDirective {
    pub name: String,
    pub upstream_repository: String,
    pub upstream_ref: String,
    pub upstream_path: String,
    pub downstream_ref: String,
    pub downstream_path: String,
}

/// Reference to another repository participating in a gittuf network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRef {
    pub name: String,
    pub location: String,
}

/// The role assignments held in root metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootRoles {
    pub root: Role,
    /// The primary rule file's role. Absent until the first principal
    /// is authorized for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Role>,
}

/// Root metadata, the `v0.2` model. `v0.1` documents are migrated on
/// read by [`RootMetadata::from_json`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootMetadata {
    pub schema_version: SchemaVersion,
    pub principals: BTreeMap<PrincipalId, Principal>,
    pub roles: RootRoles,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub github_apps: BTreeMap<String, GitHubApp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_rules: Vec<GlobalRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub propagation_directives: Vec<PropagationDirective>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controller_repositories: Vec<RepositoryRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_repositories: Vec<RepositoryRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<Stage, Vec<Hook>>,
}

/// The `v0.1` wire format: bare keys, no persons or app principals.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RootMetadataV01 {
    keys: BTreeMap<KeyId, Key>,
    roles: RootRoles,
    #[serde(default)]
    github_apps: BTreeMap<String, GitHubApp>,
    #[serde(default)]
    global_rules: Vec<GlobalRule>,
    #[serde(default)]
    propagation_directives: Vec<PropagationDirective>,
    #[serde(default)]
    controller_repositories: Vec<RepositoryRef>,
    #[serde(default)]
    network_repositories: Vec<RepositoryRef>,
    #[serde(default)]
    hooks: BTreeMap<Stage, Vec<Hook>>,
}

impl From<RootMetadataV01> for RootMetadata {
    fn from(old: RootMetadataV01) -> Self {
        Self {
            schema_version: SchemaVersion::V01,
            principals: old
                .keys
                .into_values()
                .map(|key| (key.key_id.to_string(), Principal::Key(key)))
                .collect(),
            roles: old.roles,
            github_apps: old.github_apps,
            global_rules: old.global_rules,
            propagation_directives: old.propagation_directives,
            controller_repositories: old.controller_repositories,
            network_repositories: old.network_repositories,
            hooks: old.hooks,
        }
    }
}

impl RootMetadata {
    /// Create root metadata anchored on a single root principal.
    pub fn new(root: Principal) -> Self {
        let id = root.id().to_owned();

        Self {
            schema_version: SchemaVersion::LATEST,
            principals: BTreeMap::from_iter([(id.clone(), root)]),
            roles: RootRoles {
                root: Role::new([id], 1),
                targets: None,
            },
            github_apps: BTreeMap::new(),
            global_rules: Vec::new(),
            propagation_directives: Vec::new(),
            controller_repositories: Vec::new(),
            network_repositories: Vec::new(),
            hooks: BTreeMap::new(),
        }
    }

    /// Parse a document of any supported schema version, migrating old
    /// versions to the current model.
    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;

        match value.get("schemaVersion").and_then(|v| v.as_str()) {
            Some("v0.1") => {
                let old: RootMetadataV01 = serde_json::from_value(value)?;
                Ok(Self::from(old))
            }
            _ => serde_json::from_value(value).map_err(Error::from),
        }
    }

    /// The principals authorized for the root role.
    pub fn root_principals(&self) -> Vec<&Principal> {
        self.roles
            .root
            .principal_ids
            .iter()
            .filter_map(|id| self.principals.get(id))
            .collect()
    }

    /// The principals authorized for the primary rule file.
    pub fn primary_rule_principals(&self) -> Vec<&Principal> {
        self.roles
            .targets
            .iter()
            .flat_map(|role| role.principal_ids.iter())
            .filter_map(|id| self.principals.get(id))
            .collect()
    }

    pub fn add_root_principal(&mut self, principal: Principal) {
        let id = principal.id().to_owned();

        self.principals.insert(id.clone(), principal);
        self.roles.root.principal_ids.insert(id);
    }

    pub fn remove_root_principal(&mut self, id: &str) -> Result<(), Error> {
        if !self.roles.root.principal_ids.contains(id) {
            return Err(Error::UnknownPrincipal(id.to_owned()));
        }
        if self.roles.root.principal_ids.len() == 1 {
            return Err(Error::CannotRemovePrincipal(
                id.to_owned(),
                "the root role cannot be left without principals",
            ));
        }
        if self.roles.root.threshold > self.roles.root.principal_ids.len() - 1 {
            return Err(Error::Threshold(
                self.roles.root.threshold,
                "the threshold exceeds the principal count after removal",
            ));
        }
        self.roles.root.principal_ids.remove(id);
        self.prune_principal(id);
        Ok(())
    }

    pub fn add_primary_rule_principal(&mut self, principal: Principal) {
        let id = principal.id().to_owned();

        self.principals.insert(id.clone(), principal);
        match &mut self.roles.targets {
            Some(role) => {
                role.principal_ids.insert(id);
            }
            None => self.roles.targets = Some(Role::new([id], 1)),
        }
    }

    pub fn remove_primary_rule_principal(&mut self, id: &str) -> Result<(), Error> {
        let role = self
            .roles
            .targets
            .as_mut()
            .ok_or_else(|| Error::UnknownPrincipal(id.to_owned()))?;

        if !role.principal_ids.contains(id) {
            return Err(Error::UnknownPrincipal(id.to_owned()));
        }
        if role.principal_ids.len() == 1 {
            return Err(Error::CannotRemovePrincipal(
                id.to_owned(),
                "the primary rule file cannot be left without principals",
            ));
        }
        if role.threshold > role.principal_ids.len() - 1 {
            return Err(Error::Threshold(
                role.threshold,
                "the threshold exceeds the principal count after removal",
            ));
        }
        role.principal_ids.remove(id);
        self.prune_principal(id);
        Ok(())
    }

    pub fn set_root_threshold(&mut self, threshold: usize) -> Result<(), Error> {
        let mut role = self.roles.root.clone();
        role.threshold = threshold;
        role.validate()?;
        self.roles.root = role;
        Ok(())
    }

    pub fn set_primary_rule_threshold(&mut self, threshold: usize) -> Result<(), Error> {
        let role = self
            .roles
            .targets
            .as_mut()
            .ok_or(Error::Invalid("no primary rule principals are authorized"))?;
        let mut updated = role.clone();
        updated.threshold = threshold;
        updated.validate()?;
        *role = updated;
        Ok(())
    }

    /// Declare an app role. The reserved name is used when none is
    /// given explicitly. Newly added apps are untrusted until
    /// [`RootMetadata::set_github_app_trust`] enables them.
    pub fn add_github_app(&mut self, name: Option<&str>, principal: Principal) {
        let name = name.unwrap_or(GITHUB_APP_ROLE_NAME).to_owned();
        let id = principal.id().to_owned();

        self.principals.insert(id.clone(), principal);
        self.github_apps
            .entry(name)
            .or_insert_with(|| GitHubApp {
                principal_ids: BTreeSet::new(),
                trusted: false,
            })
            .principal_ids
            .insert(id);
    }

    pub fn remove_github_app(&mut self, name: Option<&str>) -> Result<(), Error> {
        let name = name.unwrap_or(GITHUB_APP_ROLE_NAME);
        let app = self
            .github_apps
            .remove(name)
            .ok_or_else(|| Error::AppNotFound(name.to_owned()))?;

        for id in &app.principal_ids {
            self.prune_principal(id);
        }
        Ok(())
    }

    pub fn set_github_app_trust(&mut self, name: Option<&str>, trusted: bool) -> Result<(), Error> {
        let name = name.unwrap_or(GITHUB_APP_ROLE_NAME);
        let app = self
            .github_apps
            .get_mut(name)
            .ok_or_else(|| Error::AppNotFound(name.to_owned()))?;

        app.trusted = trusted;
        Ok(())
    }

    /// Whether approvals from the named app may count.
    pub fn is_github_app_trusted(&self, name: &str) -> bool {
        self.github_apps.get(name).is_some_and(|app| app.trusted)
    }

    pub fn add_global_rule(&mut self, rule: GlobalRule) -> Result<(), Error> {
        if self.global_rules.iter().any(|r| r.name() == rule.name()) {
            return Err(Error::GlobalRuleExists(rule.name().to_owned()));
        }
        self.global_rules.push(rule);
        Ok(())
    }

    pub fn remove_global_rule(&mut self, name: &str) -> Result<(), Error> {
        let before = self.global_rules.len();
        self.global_rules.retain(|r| r.name() != name);

        if self.global_rules.len() == before {
            return Err(Error::GlobalRuleNotFound(name.to_owned()));
        }
        Ok(())
    }

    pub fn add_propagation_directive(&mut self, directive: PropagationDirective) {
        self.propagation_directives
            .retain(|d| d.name != directive.name);
        self.propagation_directives.push(directive);
    }

    pub fn remove_propagation_directive(&mut self, name: &str) -> Result<(), Error> {
        let before = self.propagation_directives.len();
        self.propagation_directives.retain(|d| d.name != name);

        if self.propagation_directives.len() == before {
            return Err(Error::DirectiveNotFound(name.to_owned()));
        }
        Ok(())
    }

    pub fn add_hook(&mut self, stage: Stage, hook: Hook, force: bool) -> Result<(), Error> {
        validate_hook(&hook)?;
        let hooks = self.hooks.entry(stage).or_default();

        if let Some(existing) = hooks.iter_mut().find(|h| h.name == hook.name) {
            if !force {
                return Err(Error::HookExists(hook.name));
            }
            *existing = hook;
            return Ok(());
        }
        hooks.push(hook);
        Ok(())
    }

    pub fn remove_hook(&mut self, stage: Stage, name: &str) -> Result<(), Error> {
        let hooks = self
            .hooks
            .get_mut(&stage)
            .ok_or_else(|| Error::HookNotFound(name.to_owned()))?;
        let before = hooks.len();
        hooks.retain(|h| h.name != name);

        if hooks.len() == before {
            return Err(Error::HookNotFound(name.to_owned()));
        }
        Ok(())
    }

    pub fn hooks_for_stage(&self, stage: Stage) -> &[Hook] {
        self.hooks.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Global threshold rules matching the given path.
    pub fn threshold_rules_for(&self, path: &str) -> Vec<&GlobalRule> {
        self.global_rules
            .iter()
            .filter(|r| matches!(r, GlobalRule::Threshold { .. }) && r.matches(path))
            .collect()
    }

    /// Block-force-push rules matching the given path.
    pub fn force_push_rules_for(&self, path: &str) -> Vec<&GlobalRule> {
        self.global_rules
            .iter()
            .filter(|r| matches!(r, GlobalRule::BlockForcePush { .. }) && r.matches(path))
            .collect()
    }

    /// Drop a principal from the shared table once nothing references it.
    fn prune_principal(&mut self, id: &str) {
        let referenced = self.roles.root.principal_ids.contains(id)
            || self
                .roles
                .targets
                .as_ref()
                .is_some_and(|role| role.principal_ids.contains(id))
            || self
                .github_apps
                .values()
                .any(|app| app.principal_ids.contains(id))
            || self
                .hooks
                .values()
                .flatten()
                .any(|hook| hook.principal_ids.contains(id));

        if !referenced {
            self.principals.remove(id);
        }
    }

    /// Structural validation, independent of signatures.
    pub fn validate(&self) -> Result<(), Error> {
        self.roles.root.validate()?;
        if let Some(targets) = &self.roles.targets {
            targets.validate()?;
        }

        let known = |id: &PrincipalId| self.principals.contains_key(id);
        for id in self.roles.root.principal_ids.iter() {
            if !known(id) {
                return Err(Error::UnknownPrincipal(id.clone()));
            }
        }
        for id in self
            .roles
            .targets
            .iter()
            .flat_map(|role| role.principal_ids.iter())
        {
            if !known(id) {
                return Err(Error::UnknownPrincipal(id.clone()));
            }
        }
        for app in self.github_apps.values() {
            for id in &app.principal_ids {
                if !known(id) {
                    return Err(Error::UnknownPrincipal(id.clone()));
                }
            }
        }

        let mut names = BTreeSet::new();
        for rule in &self.global_rules {
            if !names.insert(rule.name()) {
                return Err(Error::GlobalRuleExists(rule.name().to_owned()));
            }
            if let GlobalRule::Threshold { threshold, .. } = rule {
                if *threshold == 0 {
                    return Err(Error::Threshold(*threshold, "threshold cannot be zero"));
                }
            }
        }
        for hook in self.hooks.values().flatten() {
            validate_hook(hook)?;
        }
        Ok(())
    }
}

fn validate_hook(hook: &Hook) -> Result<(), Error> {
    if hook.timeout == 0 {
        return Err(Error::InvalidHook(
            hook.name.clone(),
            "timeout cannot be zero",
        ));
    }
    if hook.sha256().is_none() {
        return Err(Error::InvalidHook(
            hook.name.clone(),
            "a sha256 digest is required",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crypto::test::signer::MockSigner;
    use crate::crypto::Signer as _;

    fn principal(seed: u8) -> Principal {
        let signer = MockSigner::from_seed([seed; 32]);
        Principal::Key(Key::ed25519(*signer.public_key()))
    }

    #[test]
    fn test_new_root() {
        let root = RootMetadata::new(principal(1));

        assert_eq!(root.roles.root.threshold, 1);
        assert_eq!(root.root_principals().len(), 1);
        assert!(root.roles.targets.is_none());
        assert!(root.validate().is_ok());
    }

    #[test]
    fn test_cannot_remove_sole_root_principal() {
        let p = principal(1);
        let id = p.id().to_owned();
        let mut root = RootMetadata::new(p);

        let err = root.remove_root_principal(&id).unwrap_err();
        assert!(matches!(err, Error::CannotRemovePrincipal(_, _)));
    }

    #[test]
    fn test_root_principal_lifecycle() {
        let a = principal(1);
        let b = principal(2);
        let b_id = b.id().to_owned();
        let mut root = RootMetadata::new(a);

        root.add_root_principal(b);
        assert_eq!(root.root_principals().len(), 2);

        root.remove_root_principal(&b_id).unwrap();
        assert_eq!(root.root_principals().len(), 1);
        assert!(!root.principals.contains_key(&b_id));
    }

    #[test]
    fn test_threshold_bounds() {
        let mut root = RootMetadata::new(principal(1));

        assert!(root.set_root_threshold(2).is_err());
        root.add_root_principal(principal(2));
        assert!(root.set_root_threshold(2).is_ok());

        // Removal that would undercut the threshold is refused.
        let id = principal(2).id().to_owned();
        assert!(root.remove_root_principal(&id).is_err());
    }

    #[test]
    fn test_primary_rule_role() {
        let mut root = RootMetadata::new(principal(1));

        root.add_primary_rule_principal(principal(3));
        assert_eq!(root.primary_rule_principals().len(), 1);
        assert_eq!(root.roles.targets.as_ref().unwrap().threshold, 1);
        assert!(root.validate().is_ok());
    }

    #[test]
    fn test_github_app_defaults_to_reserved_name() {
        let mut root = RootMetadata::new(principal(1));

        root.add_github_app(None, principal(4));
        assert!(root.github_apps.contains_key(GITHUB_APP_ROLE_NAME));
        assert!(!root.is_github_app_trusted(GITHUB_APP_ROLE_NAME));

        root.set_github_app_trust(None, true).unwrap();
        assert!(root.is_github_app_trusted(GITHUB_APP_ROLE_NAME));

        root.remove_github_app(None).unwrap();
        assert!(root.remove_github_app(None).is_err());
    }

    #[test]
    fn test_duplicate_global_rule_rejected() {
        let mut root = RootMetadata::new(principal(1));
        let rule = GlobalRule::BlockForcePush {
            name: "block-force-pushes".to_owned(),
            paths: NonEmpty::new("git:refs/heads/main".to_owned()),
        };

        root.add_global_rule(rule.clone()).unwrap();
        assert!(matches!(
            root.add_global_rule(rule),
            Err(Error::GlobalRuleExists(_))
        ));

        root.remove_global_rule("block-force-pushes").unwrap();
        assert!(root.remove_global_rule("block-force-pushes").is_err());
    }

    #[test]
    fn test_global_rule_matching() {
        let mut root = RootMetadata::new(principal(1));
        root.add_global_rule(GlobalRule::Threshold {
            name: "two-eyes".to_owned(),
            paths: NonEmpty::new("git:refs/heads/*".to_owned()),
            threshold: 2,
        })
        .unwrap();

        assert_eq!(root.threshold_rules_for("git:refs/heads/main").len(), 1);
        assert!(root.threshold_rules_for("git:refs/tags/v1").is_empty());
        assert!(root.force_push_rules_for("git:refs/heads/main").is_empty());
    }

    #[test]
    fn test_v01_migration() {
        let signer = MockSigner::from_seed([5; 32]);
        let key = Key::ed25519(*signer.public_key());
        let key_id = key.key_id.to_string();
        let mut keys = serde_json::Map::new();
        keys.insert(key_id.clone(), serde_json::to_value(&key).unwrap());
        let json = serde_json::json!({
            "schemaVersion": "v0.1",
            "keys": keys,
            "roles": {
                "root": { "principalIds": [key_id.clone()], "threshold": 1 }
            }
        });

        let root = RootMetadata::from_json(&serde_json::to_vec(&json).unwrap()).unwrap();
        assert_eq!(root.schema_version, SchemaVersion::V01);
        assert_eq!(root.root_principals().len(), 1);
        assert!(matches!(
            root.principals.get(&key_id),
            Some(Principal::Key(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let mut root = RootMetadata::new(principal(6));
        root.add_primary_rule_principal(principal(7));
        root.add_propagation_directive(PropagationDirective {
            name: "vendor".to_owned(),
            upstream_repository: "https://example.com/upstream".to_owned(),
            upstream_ref: "refs/heads/main".to_owned(),
            upstream_path: "src".to_owned(),
            downstream_ref: "refs/heads/main".to_owned(),
            downstream_path: "vendor/upstream".to_owned(),
        });

        let bytes = serde_json::to_vec(&root).unwrap();
        let parsed = RootMetadata::from_json(&bytes).unwrap();

        assert_eq!(parsed, root);
    }
}
