//! OpenSSH public key support.
//!
//! Key loaders proper (agent, disk, passphrases) live outside this
//! crate; this module only turns an OpenSSH-encoded Ed25519 public key
//! into a [`Key`] usable by the verification core.

use std::str::FromStr;

use thiserror::Error;

use crate::{Key, PublicKey};

#[derive(Debug, Error)]
pub enum PublicKeyError {
    #[error("invalid OpenSSH key: {0}")]
    Ssh(#[from] ssh_key::Error),
    #[error("unsupported algorithm `{0}`")]
    UnsupportedAlgorithm(String),
}

/// Parse an `ssh-ed25519 AAAA... comment` line.
pub fn parse_public_key(s: &str) -> Result<Key, PublicKeyError> {
    let key = ssh_key::PublicKey::from_str(s.trim())?;

    match key.key_data().ed25519() {
        Some(ed) => {
            let pk = PublicKey::from(ed.0);
            Ok(Key::ed25519(pk))
        }
        None => Err(PublicKeyError::UnsupportedAlgorithm(
            key.algorithm().to_string(),
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_public_key() {
        // Fixed 32-byte key, encoded with `ssh-keygen`.
        let line = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAINDoXIrhcnRjnLGUXUFdxhkuy08lkTOwrj2IoGsEX6+Q test@gittuf";
        let key = parse_public_key(line).unwrap();

        assert!(key.public_key().is_some());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_public_key("not a key").is_err());
    }
}
