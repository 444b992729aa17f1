//! Verifiable policy and audit log layered over a Git repository.
//!
//! Reference updates are recorded in an append-only Reference State Log
//! (RSL) kept under `refs/gittuf/`, and checked against signed,
//! delegation-based policy metadata. The two questions this crate
//! answers about any reference are: who was allowed to cause this
//! state, and is the current state the one the log claims.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use thiserror::Error;

pub mod attestations;
pub mod canonical;
pub mod envelope;
pub mod git;
pub mod hooks;
pub mod policy;
pub mod propagation;
pub mod rsl;
pub mod storage;
pub mod sync;
#[cfg(any(test, feature = "test"))]
pub mod test;
pub mod tuf;
pub mod verify;

pub use gittuf_crypto as crypto;

/// The reference state log.
pub static RSL_REF: Lazy<&str> = Lazy::new(|| "refs/gittuf/reference-state-log");
/// Applied, verified policy.
pub static POLICY_REF: Lazy<&str> = Lazy::new(|| "refs/gittuf/policy");
/// Proposed policy being assembled and signed.
pub static POLICY_STAGING_REF: Lazy<&str> = Lazy::new(|| "refs/gittuf/policy-staging");
/// Signed side-statements about refs.
pub static ATTESTATIONS_REF: Lazy<&str> = Lazy::new(|| "refs/gittuf/attestations");
/// Local-only index. Reserved; never pushed.
pub static CACHE_REF: Lazy<&str> = Lazy::new(|| "refs/gittuf/cache");

/// Returned when an operation observes its [`Cancel`] token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Cooperative cancellation token.
///
/// Long-running operations check it between RSL entries and between
/// metadata loads, and discard partial work when it fires; no refs are
/// updated by a cancelled operation.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let cancel = Cancel::new();
        assert!(cancel.check().is_ok());

        let shared = cancel.clone();
        shared.cancel();

        assert!(cancel.is_cancelled());
        assert_eq!(cancel.check(), Err(Cancelled));
    }
}
