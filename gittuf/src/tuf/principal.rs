//! Principals: the parties that policy rules authorize.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::{Key, KeyId};

/// Identifier of a principal. For a single-key principal this is the
/// key id; persons and app roles carry stable ids of their own.
pub type PrincipalId = String;

/// A person with a stable id and any number of verification keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub person_id: PrincipalId,
    pub public_keys: BTreeMap<KeyId, Key>,
    /// External identity claims, eg. a code-forge handle. Opaque to
    /// verification; carried for attestation matching and display.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub associated_identities: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

/// An app role: a name plus the keys the app signs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub name: String,
    pub keys: Vec<Key>,
}

/// A party that may satisfy a rule.
///
/// The verifier never inspects the variant beyond asking which key ids
/// may satisfy the principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Principal {
    /// A single key; the principal id is the key id.
    Key(Key),
    Person(Person),
    App(App),
}

impl Principal {
    pub fn id(&self) -> &str {
        match self {
            Self::Key(key) => key.key_id.as_str(),
            Self::Person(person) => person.person_id.as_str(),
            Self::App(app) => app.name.as_str(),
        }
    }

    /// The keys that may satisfy this principal.
    pub fn keys(&self) -> Vec<&Key> {
        match self {
            Self::Key(key) => vec![key],
            Self::Person(person) => person.public_keys.values().collect(),
            Self::App(app) => app.keys.iter().collect(),
        }
    }

    /// Whether a signature by `key_id` may count for this principal.
    pub fn has_key(&self, key_id: &KeyId) -> bool {
        self.keys().iter().any(|k| k.key_id == *key_id)
    }
}

impl From<Key> for Principal {
    fn from(key: Key) -> Self {
        Self::Key(key)
    }
}
