//! Rule-file metadata.
//!
//! A rule file names principals and an ordered list of rules over path
//! patterns. A rule may delegate into a nested rule file carrying the
//! rule's name; the file always ends in the terminal allow rule, which
//! matches everything and requires nothing.

use std::collections::{BTreeMap, BTreeSet};

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};

use crate::crypto::{Key, KeyId};
use crate::tuf::principal::{Principal, PrincipalId};
use crate::tuf::{pattern_matches, Error, SchemaVersion, ROOT_ROLE};

/// Name of the terminal rule matching every path.
pub const ALLOW_RULE_NAME: &str = "allow-*";

/// A single rule: who may update which paths, and with how many
/// approvals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,
    pub paths: NonEmpty<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub principal_ids: BTreeSet<PrincipalId>,
    pub threshold: usize,
    /// A matching terminating rule ends resolution; later rules are
    /// not consulted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminating: bool,
}

impl Rule {
    /// The terminal allow rule.
    pub fn allow() -> Self {
        Self {
            name: ALLOW_RULE_NAME.to_owned(),
            paths: NonEmpty::new("*".to_owned()),
            principal_ids: BTreeSet::new(),
            threshold: 1,
            terminating: false,
        }
    }

    pub fn is_allow(&self) -> bool {
        self.name == ALLOW_RULE_NAME
    }

    pub fn matches(&self, path: &str) -> bool {
        self.paths.iter().any(|p| pattern_matches(p, path))
    }
}

/// Rule-file metadata, the `v0.2` model. `v0.1` documents are migrated
/// on read by [`TargetsMetadata::from_json`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetsMetadata {
    pub schema_version: SchemaVersion,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub principals: BTreeMap<PrincipalId, Principal>,
    pub rules: Vec<Rule>,
}

/// The `v0.1` wire format: bare keys.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetsMetadataV01 {
    #[serde(default)]
    keys: BTreeMap<KeyId, Key>,
    rules: Vec<Rule>,
}

impl From<TargetsMetadataV01> for TargetsMetadata {
    fn from(old: TargetsMetadataV01) -> Self {
        Self {
            schema_version: SchemaVersion::V01,
            principals: old
                .keys
                .into_values()
                .map(|key| (key.key_id.to_string(), Principal::Key(key)))
                .collect(),
            rules: old.rules,
        }
    }
}

impl Default for TargetsMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetsMetadata {
    /// An empty rule file: just the allow rule.
    pub fn new() -> Self {
        Self {
            schema_version: SchemaVersion::LATEST,
            principals: BTreeMap::new(),
            rules: vec![Rule::allow()],
        }
    }

    /// Parse a document of any supported schema version.
    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;

        match value.get("schemaVersion").and_then(|v| v.as_str()) {
            Some("v0.1") => {
                let old: TargetsMetadataV01 = serde_json::from_value(value)?;
                Ok(Self::from(old))
            }
            _ => serde_json::from_value(value).map_err(Error::from),
        }
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Add a rule ahead of the terminal allow rule.
    pub fn add_rule(&mut self, rule: Rule) -> Result<(), Error> {
        validate_rule_name(&rule.name)?;
        if self.rule(&rule.name).is_some() {
            return Err(Error::RuleExists(rule.name));
        }
        for id in &rule.principal_ids {
            if !self.principals.contains_key(id) {
                return Err(Error::UnknownPrincipal(id.clone()));
            }
        }
        let at = self
            .rules
            .iter()
            .position(|r| r.is_allow())
            .unwrap_or(self.rules.len());
        self.rules.insert(at, rule);
        Ok(())
    }

    /// Replace a rule in place, keeping its position.
    pub fn update_rule(&mut self, rule: Rule) -> Result<(), Error> {
        validate_rule_name(&rule.name)?;
        for id in &rule.principal_ids {
            if !self.principals.contains_key(id) {
                return Err(Error::UnknownPrincipal(id.clone()));
            }
        }
        let existing = self
            .rules
            .iter_mut()
            .find(|r| r.name == rule.name)
            .ok_or_else(|| Error::RuleNotFound(rule.name.clone()))?;
        *existing = rule;
        Ok(())
    }

    pub fn remove_rule(&mut self, name: &str) -> Result<(), Error> {
        if name == ALLOW_RULE_NAME {
            return Err(Error::Invalid("the allow rule cannot be removed"));
        }
        let before = self.rules.len();
        self.rules.retain(|r| r.name != name);

        if self.rules.len() == before {
            return Err(Error::RuleNotFound(name.to_owned()));
        }
        Ok(())
    }

    /// Reorder the non-terminal rules to the given name order.
    pub fn reorder_rules(&mut self, names: &[String]) -> Result<(), Error> {
        let mut reordered = Vec::with_capacity(self.rules.len());

        for name in names {
            let rule = self
                .rule(name)
                .cloned()
                .ok_or_else(|| Error::RuleNotFound(name.clone()))?;
            if rule.is_allow() {
                return Err(Error::Invalid("the allow rule cannot be reordered"));
            }
            reordered.push(rule);
        }
        if reordered.len() != self.rules.len() - 1 {
            return Err(Error::Invalid("reordering must name every rule exactly once"));
        }
        reordered.push(Rule::allow());
        self.rules = reordered;
        Ok(())
    }

    pub fn add_principal(&mut self, principal: Principal) -> Result<(), Error> {
        let id = principal.id().to_owned();

        if self.principals.contains_key(&id) {
            return Err(Error::PrincipalExists(id));
        }
        self.principals.insert(id, principal);
        Ok(())
    }

    pub fn remove_principal(&mut self, id: &str) -> Result<(), Error> {
        if !self.principals.contains_key(id) {
            return Err(Error::UnknownPrincipal(id.to_owned()));
        }
        if self
            .rules
            .iter()
            .any(|rule| rule.principal_ids.contains(id))
        {
            return Err(Error::CannotRemovePrincipal(
                id.to_owned(),
                "the principal is referenced by a rule",
            ));
        }
        self.principals.remove(id);
        Ok(())
    }

    /// Structural validation, independent of signatures.
    pub fn validate(&self) -> Result<(), Error> {
        match self.rules.last() {
            Some(last) if last.is_allow() => {}
            _ => return Err(Error::Invalid("the allow rule must terminate the rule list")),
        }

        let mut names = BTreeSet::new();
        for rule in &self.rules {
            if !names.insert(rule.name.as_str()) {
                return Err(Error::RuleExists(rule.name.clone()));
            }
            if rule.is_allow() {
                continue;
            }
            validate_rule_name(&rule.name)?;
            if rule.principal_ids.is_empty() {
                return Err(Error::Invalid("a rule must name at least one principal"));
            }
            if rule.threshold == 0 {
                return Err(Error::Threshold(rule.threshold, "threshold cannot be zero"));
            }
            if rule.threshold > rule.principal_ids.len() {
                return Err(Error::Threshold(
                    rule.threshold,
                    "threshold cannot exceed number of principals",
                ));
            }
            for id in &rule.principal_ids {
                if !self.principals.contains_key(id) {
                    return Err(Error::UnknownPrincipal(id.clone()));
                }
            }
        }
        Ok(())
    }
}

fn validate_rule_name(name: &str) -> Result<(), Error> {
    if name == ROOT_ROLE || name == crate::tuf::TARGETS_ROLE || name == ALLOW_RULE_NAME {
        return Err(Error::InvalidRoleName(name.to_owned()));
    }
    if name.is_empty() || name.len() > crate::tuf::MAX_NAME_LENGTH {
        return Err(Error::InvalidRoleName(name.to_owned()));
    }
    Ok(())
}
