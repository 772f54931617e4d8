use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{Verdict, Verifier};
use crate::ids::{ContentRef, JobId};
use crate::state_machine::JobSpec;
use crate::store::{ContentStore, StoreError};

/// What a provider uploads as its result: the output plus a commitment
/// binding it to the job and its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub job: JobId,
    pub output: String,
    pub commitment: String,
}

impl ResultEnvelope {
    pub fn seal(spec: &JobSpec, output: impl Into<String>) -> Self {
        let output = output.into();
        let job = spec.id();
        let commitment = commitment(&job, &spec.input_ref, &output);
        Self {
            job,
            output,
            commitment,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// hex(sha256(job id ‖ input ref ‖ output))
pub fn commitment(job: &JobId, input: &ContentRef, output: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job.as_str().as_bytes());
    hasher.update(input.as_str().as_bytes());
    hasher.update(output.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct DigestVerifier {
    store: Arc<dyn ContentStore>,
}

impl DigestVerifier {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Verifier for DigestVerifier {
    fn name(&self) -> &'static str {
        "digest"
    }

    async fn verify(&self, spec: &JobSpec, result: &ContentRef) -> Verdict {
        let bytes = match self.store.get(result).await {
            Ok(bytes) => bytes,
            Err(StoreError::RefMismatch { .. }) => {
                return Verdict::Reject("result blob does not match its reference".to_string());
            }
            Err(err) => return Verdict::Inconclusive(err.to_string()),
        };

        let envelope: ResultEnvelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => return Verdict::Reject(format!("malformed result envelope: {err}")),
        };

        let job = spec.id();
        if envelope.job != job {
            return Verdict::Reject(format!("envelope names job {}", envelope.job));
        }
        let expected = commitment(&job, &spec.input_ref, &envelope.output);
        if envelope.commitment != expected {
            return Verdict::Reject("commitment does not match output".to_string());
        }
        debug!(job = %job.short(), "Result commitment verified");
        Verdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::fixtures::spec;
    use crate::store::MemoryStore;

    async fn upload(store: &MemoryStore, envelope: &ResultEnvelope) -> ContentRef {
        store.put(&envelope.to_bytes().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn accepts_sealed_envelope() {
        let store = Arc::new(MemoryStore::new());
        let s = spec(100);
        let result = upload(&store, &ResultEnvelope::seal(&s, "42")).await;
        let verifier = DigestVerifier::new(store);
        assert_eq!(verifier.verify(&s, &result).await, Verdict::Accept);
    }

    #[tokio::test]
    async fn rejects_tampered_output() {
        let store = Arc::new(MemoryStore::new());
        let s = spec(100);
        let mut envelope = ResultEnvelope::seal(&s, "42");
        envelope.output = "43".into();
        let result = upload(&store, &envelope).await;
        let verifier = DigestVerifier::new(store);
        assert!(matches!(verifier.verify(&s, &result).await, Verdict::Reject(_)));
    }

    #[tokio::test]
    async fn rejects_envelope_for_other_job() {
        let store = Arc::new(MemoryStore::new());
        let result = upload(&store, &ResultEnvelope::seal(&spec(200), "42")).await;
        let verifier = DigestVerifier::new(store);
        assert!(matches!(
            verifier.verify(&spec(100), &result).await,
            Verdict::Reject(_)
        ));
    }

    #[tokio::test]
    async fn missing_or_unreachable_blob_is_inconclusive() {
        let store = Arc::new(MemoryStore::new());
        let verifier = DigestVerifier::new(store.clone());
        let s = spec(100);
        assert!(verifier
            .verify(&s, &ContentRef::of(b"never uploaded"))
            .await
            .is_inconclusive());

        let result = upload(&store, &ResultEnvelope::seal(&s, "42")).await;
        store.set_unavailable(true);
        assert!(verifier.verify(&s, &result).await.is_inconclusive());
    }
}
