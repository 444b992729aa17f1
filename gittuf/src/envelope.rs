//! Detached-payload signed envelopes.
//!
//! An [`Envelope`] wraps canonical-JSON metadata together with any
//! number of `(key id, signature)` pairs. Signatures are computed over
//! the pre-authentication encoding (PAE) of the payload, which frames
//! the payload type and length so the same bytes cannot be replayed
//! under a different type.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical;
use crate::crypto::{KeyId, Signer, SignerError, Verifier};

/// Payload type for policy metadata envelopes.
pub const PAYLOAD_TYPE_METADATA: &str = "application/vnd.gittuf+json";
/// Payload type for attestation envelopes.
pub const PAYLOAD_TYPE_ATTESTATION: &str = "application/vnd.gittuf.attestation+json";

#[derive(Debug, Error)]
pub enum Error {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signer: {0}")]
    Signer(#[from] SignerError),
    #[error("signature by key `{0}` is invalid")]
    BadSignature(KeyId),
    #[error("insufficient signatures: {verified} verified, {threshold} required")]
    InsufficientSignatures { verified: usize, threshold: usize },
    #[error("threshold cannot be zero")]
    ZeroThreshold,
}

/// A single signature over an envelope's PAE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeSignature {
    pub key_id: KeyId,
    #[serde(with = "base64str")]
    pub sig: Vec<u8>,
}

/// A DSSE-shaped envelope: typed payload plus signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(with = "base64str")]
    pub payload: Vec<u8>,
    pub payload_type: String,
    pub signatures: Vec<EnvelopeSignature>,
}

impl Envelope {
    /// Create an envelope with no signatures.
    pub fn new(payload: Vec<u8>, payload_type: impl Into<String>) -> Self {
        Self {
            payload,
            payload_type: payload_type.into(),
            signatures: Vec::new(),
        }
    }

    /// Canonically encode a value and wrap it.
    pub fn seal<T: Serialize>(value: &T, payload_type: impl Into<String>) -> Result<Self, Error> {
        let payload = canonical::encode(value)?;

        Ok(Self::new(payload, payload_type))
    }

    /// Deserialize the payload.
    pub fn open<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.payload).map_err(Error::from)
    }

    /// The pre-authentication encoding:
    /// `DSSEv1 SP len(type) SP type SP len(payload) SP payload`.
    pub fn pae(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + self.payload_type.len() + 32);

        buf.extend_from_slice(b"DSSEv1 ");
        buf.extend_from_slice(self.payload_type.len().to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.payload_type.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.payload.len().to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Append one signature. Duplicate key ids are the caller's concern;
    /// [`Envelope::resign`] is the replace-in-place variant.
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<(), Error> {
        let pae = self.pae();
        let sig = signer.try_sign(&pae)?;

        self.signatures.push(EnvelopeSignature {
            key_id: signer.key_id().clone(),
            sig: sig.as_ref().to_vec(),
        });
        Ok(())
    }

    /// Sign, dropping any prior signature by the same key first.
    pub fn resign(&mut self, signer: &dyn Signer) -> Result<(), Error> {
        self.signatures.retain(|s| &s.key_id != signer.key_id());
        self.sign(signer)
    }

    /// Remove all signatures by the given key. Returns whether any were present.
    pub fn remove_signature(&mut self, key_id: &KeyId) -> bool {
        let before = self.signatures.len();
        self.signatures.retain(|s| &s.key_id != key_id);
        before != self.signatures.len()
    }

    /// Verify against a set of verifiers with a threshold.
    ///
    /// Counts distinct key ids whose signature verifies; succeeds iff
    /// the count reaches `threshold`. Order-independent, and repeated
    /// signatures by one key count once.
    pub fn verify(&self, verifiers: &[&dyn Verifier], threshold: usize) -> Result<usize, Error> {
        if threshold == 0 {
            return Err(Error::ZeroThreshold);
        }
        let pae = self.pae();
        let mut accepted: BTreeSet<&KeyId> = BTreeSet::new();

        for sig in &self.signatures {
            if accepted.contains(&sig.key_id) {
                continue;
            }
            let Some(verifier) = verifiers.iter().find(|v| *v.key_id() == sig.key_id) else {
                continue;
            };
            if verifier.verify(&pae, &sig.sig).is_ok() {
                accepted.insert(&sig.key_id);
            }
        }

        if accepted.len() >= threshold {
            Ok(accepted.len())
        } else {
            Err(Error::InsufficientSignatures {
                verified: accepted.len(),
                threshold,
            })
        }
    }

    /// Verify a single signature by the given key, strictly.
    pub fn verify_signature(&self, verifier: &dyn Verifier) -> Result<(), Error> {
        let pae = self.pae();
        let sig = self
            .signatures
            .iter()
            .find(|s| s.key_id == *verifier.key_id())
            .ok_or_else(|| Error::InsufficientSignatures {
                verified: 0,
                threshold: 1,
            })?;

        verifier
            .verify(&pae, &sig.sig)
            .map_err(|_| Error::BadSignature(sig.key_id.clone()))
    }
}

/// Standard base64 ser/de for binary fields.
mod base64str {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
