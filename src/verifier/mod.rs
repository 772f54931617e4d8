//! Pluggable result verification.
//!
//! [`DigestVerifier`] checks a cryptographic commitment the provider
//! publishes next to its output; [`RemoteVerifier`] asks a designated
//! verifier service to recompute the job.

mod digest;
mod remote;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::VerifierPolicy;
use crate::error::EngineResult;
use crate::ids::ContentRef;
use crate::state_machine::JobSpec;
use crate::store::ContentStore;
pub use digest::{DigestVerifier, ResultEnvelope};
pub use remote::RemoteVerifier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Accept,
    Reject(String),
    /// The verifier could not decide (unreachable, timed out, missing data).
    Inconclusive(String),
}

impl Verdict {
    pub fn is_inconclusive(&self) -> bool {
        matches!(self, Verdict::Inconclusive(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "accept"),
            Verdict::Reject(reason) => write!(f, "reject ({reason})"),
            Verdict::Inconclusive(reason) => write!(f, "inconclusive ({reason})"),
        }
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn verify(&self, spec: &JobSpec, result: &ContentRef) -> Verdict;
}

/// Build the verifier selected in configuration.
pub fn from_policy(
    policy: &VerifierPolicy,
    store: Arc<dyn ContentStore>,
    call_timeout: Duration,
) -> EngineResult<Arc<dyn Verifier>> {
    Ok(match policy {
        VerifierPolicy::Digest => Arc::new(DigestVerifier::new(store)),
        VerifierPolicy::Recompute { endpoint } => {
            Arc::new(RemoteVerifier::new(endpoint, call_timeout)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn verdict_display() {
        assert_eq!(Verdict::Accept.to_string(), "accept");
        assert_eq!(
            Verdict::Inconclusive("timeout".into()).to_string(),
            "inconclusive (timeout)"
        );
        assert!(Verdict::Inconclusive(String::new()).is_inconclusive());
    }

    #[test]
    fn policy_selects_implementation() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let digest = from_policy(&VerifierPolicy::Digest, store.clone(), Duration::from_secs(1)).unwrap();
        assert_eq!(digest.name(), "digest");

        let remote = from_policy(
            &VerifierPolicy::Recompute {
                endpoint: "http://127.0.0.1:7000".into(),
            },
            store,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(remote.name(), "recompute");
    }
}
