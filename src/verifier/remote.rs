//! Verificador remoto: pede a um serviço designado que recompute o job.
//!
//! `POST {endpoint}/verify` com o id do job, a especificação e a referência
//! do resultado. Respostas 4xx contam como rejeição; erros de rede,
//! timeouts e 5xx são inconclusivos e ficam para nova tentativa.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Verdict, Verifier};
use crate::error::{EngineError, EngineResult};
use crate::ids::{ContentRef, JobId};
use crate::state_machine::JobSpec;

/// Corpo enviado ao serviço de verificação.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub job_id: JobId,
    pub spec: JobSpec,
    pub result_ref: ContentRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteVerdict {
    Accept,
    Reject,
}

/// Resposta do serviço: veredito e motivo opcional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub verdict: RemoteVerdict,
    #[serde(default)]
    pub reason: Option<String>,
}

pub struct RemoteVerifier {
    endpoint: String,
    client: Client,
}

impl RemoteVerifier {
    /// Cria um cliente; `timeout` limita cada chamada.
    pub fn new(endpoint: &str, timeout: Duration) -> EngineResult<Self> {
        if endpoint.trim().is_empty() {
            return Err(EngineError::Config("verifier endpoint is empty".to_string()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self) -> String {
        format!("{}/verify", self.endpoint)
    }
}

#[async_trait]
impl Verifier for RemoteVerifier {
    fn name(&self) -> &'static str {
        "recompute"
    }

    async fn verify(&self, spec: &JobSpec, result: &ContentRef) -> Verdict {
        let req = VerifyRequest {
            job_id: spec.id(),
            spec: spec.clone(),
            result_ref: result.clone(),
        };

        let response = match self.client.post(self.url()).json(&req).send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Verdict::Inconclusive("verifier timed out".to_string());
            }
            Err(err) => return Verdict::Inconclusive(format!("verifier unreachable: {err}")),
        };

        let status = response.status();
        if status.is_server_error() {
            return Verdict::Inconclusive(format!("verifier returned {status}"));
        }
        if status.is_client_error() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Verdict::Reject(format!("verifier refused ({status}): {message}"));
        }

        match response.json::<VerifyResponse>().await {
            Ok(VerifyResponse {
                verdict: RemoteVerdict::Accept,
                ..
            }) => Verdict::Accept,
            Ok(VerifyResponse {
                verdict: RemoteVerdict::Reject,
                reason,
            }) => Verdict::Reject(reason.unwrap_or_else(|| "recomputation mismatch".to_string())),
            Err(err) => {
                warn!(job = %req.job_id.short(), error = %err, "Unreadable verifier response");
                Verdict::Inconclusive(format!("unreadable verifier response: {err}"))
            }
        }
    }
}
