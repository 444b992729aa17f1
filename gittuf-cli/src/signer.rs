//! Signing-key loading for the CLI.
//!
//! The CLI reads a 32-byte Ed25519 seed, hex-encoded, from the path
//! given with `-k`/`--signing-key` or the `GITTUF_SIGNING_KEY`
//! environment variable. SSH agents, GPG and Sigstore signers are
//! provided by external loaders and are not wired in here.

use std::path::Path;

use anyhow::{anyhow, Context as _};
use gittuf_crypto::{KeyId, KeyPair, PublicKey, SecretKey, Seed, Signature, Signer, SignerError};

pub struct FileSigner {
    pk: PublicKey,
    sk: SecretKey,
    id: KeyId,
}

impl FileSigner {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read signing key from {}", path.display()))?;
        let hex = contents.trim();

        if hex.len() != 64 {
            return Err(anyhow!(
                "Signing key must be a 32-byte hex-encoded Ed25519 seed"
            ));
        }
        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| anyhow!("Signing key is not valid hexadecimal"))?;
        }
        let keypair = KeyPair::from_seed(Seed::new(seed));
        let sk = SecretKey::from(keypair.sk);
        let pk = PublicKey::from(sk.public_key());
        let id = KeyId::from(&pk);

        Ok(Self { pk, sk, id })
    }

    /// Resolve `-k` argument or environment fallback.
    pub fn from_option(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let env = std::env::var("GITTUF_SIGNING_KEY")
                    .map_err(|_| anyhow!("No signing key: pass `-k` or set GITTUF_SIGNING_KEY"))?;
                Self::load(Path::new(&env))
            }
        }
    }
}

impl Signer for FileSigner {
    fn public_key(&self) -> &PublicKey {
        &self.pk
    }

    fn key_id(&self) -> &KeyId {
        &self.id
    }

    fn sign(&self, msg: &[u8]) -> Signature {
        self.sk.sign(msg)
    }

    fn try_sign(&self, msg: &[u8]) -> Result<Signature, SignerError> {
        Ok(self.sign(msg))
    }
}
