use thiserror::Error;

use crate::ledger::{LedgerError, TxId};
use crate::state_machine::{JobId, JobStatus};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("Invalid transition for job {job}: {event} while {from}")]
    InvalidTransition {
        job: JobId,
        from: String,
        event: String,
    },

    #[error("Transaction for job {job} dropped after {attempts} submissions")]
    TransactionDropped { job: JobId, attempts: u32 },

    #[error("Transaction {tx} reverted: {reason}")]
    TransactionReverted { tx: TxId, reason: String },

    #[error("No eligible provider for job {0}")]
    NoEligibleProvider(JobId),

    #[error("Verification of job {job} timed out after {attempts} attempts")]
    VerificationTimeout { job: JobId, attempts: u32 },

    #[error("Escrow mismatch on job {job}: expected {expected}, got {actual}")]
    EscrowMismatch {
        job: JobId,
        expected: u64,
        actual: u64,
    },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {job} halted: {reason}")]
    JobHalted { job: JobId, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Cancellation of job {job} refused while {status}")]
    CancellationRefused { job: JobId, status: JobStatus },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Content store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(msg) => EngineError::ChainUnavailable(msg),
            LedgerError::Rejected { tx, reason } => EngineError::TransactionReverted { tx, reason },
            other => EngineError::ChainUnavailable(other.to_string()),
        }
    }
}

/// Classifies an engine error for retry and escalation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// Infrastructure hiccup (chain or verifier unreachable); retried with backoff.
    Transient,
    /// Logic violation (bad ordering, refused request); logged, never retried.
    Logical,
    /// Ledger and projection disagree; the job is halted for an operator.
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "Transient"),
            ErrorClass::Logical => write!(f, "Logical"),
            ErrorClass::Fatal => write!(f, "Fatal"),
        }
    }
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::ChainUnavailable(_)
            | EngineError::TransactionDropped { .. }
            | EngineError::NoEligibleProvider(_)
            | EngineError::VerificationTimeout { .. }
            | EngineError::Io(_) => ErrorClass::Transient,
            EngineError::Store(err) if err.is_transient() => ErrorClass::Transient,
            EngineError::EscrowMismatch { .. } | EngineError::JobHalted { .. } => ErrorClass::Fatal,
            _ => ErrorClass::Logical,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
