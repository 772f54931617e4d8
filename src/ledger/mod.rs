//! Ledger-facing types: events, transactions and the client seam.
//!
//! The engine never talks to a chain directly; everything goes through
//! [`LedgerClient`], so the control loop runs unchanged against
//! [`MemoryLedger`] in tests and against a real RPC client in production.

mod event_log;
mod memory;
mod subscription;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::ids::{EventId, TxId};
use crate::ids::{Address, ContentRef, JobId};
use crate::state_machine::JobSpec;
pub use event_log::{EventLog, RegistrySnapshot};
pub use memory::{MemoryLedger, SubmittedTx};
pub use subscription::EventSubscription;

/// Why a provider lost its assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevocationReason {
    HeartbeatTimeout,
    DeadlineMissed,
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RevocationReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            RevocationReason::DeadlineMissed => write!(f, "execution deadline missed"),
        }
    }
}

/// Facts the escrow contract emits. Immutable once confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    JobCreated {
        spec: JobSpec,
    },
    EscrowLocked {
        amount: u64,
    },
    ProviderAssigned {
        provider: Address,
        price: u64,
        attempt: u32,
    },
    AssignmentRevoked {
        provider: Address,
        reason: RevocationReason,
    },
    ExecutionStarted {
        provider: Address,
    },
    ResultSubmitted {
        provider: Address,
        result_ref: ContentRef,
    },
    ResultVerified {
        provider: Address,
        evidence_ref: Option<ContentRef>,
    },
    DisputeRaised {
        reason: String,
        evidence_ref: Option<ContentRef>,
    },
    PaymentReleased {
        provider: Address,
        amount: u64,
    },
    DisputeResolved {
        in_favor_of_provider: bool,
        amount: u64,
    },
    JobCancelled {
        refund: u64,
        penalty: u64,
        provider: Option<Address>,
    },
    JobFailed {
        reason: String,
        refund: u64,
    },
    JobExpired {
        refund: u64,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::JobCreated { .. } => "JobCreated",
            EventKind::EscrowLocked { .. } => "EscrowLocked",
            EventKind::ProviderAssigned { .. } => "ProviderAssigned",
            EventKind::AssignmentRevoked { .. } => "AssignmentRevoked",
            EventKind::ExecutionStarted { .. } => "ExecutionStarted",
            EventKind::ResultSubmitted { .. } => "ResultSubmitted",
            EventKind::ResultVerified { .. } => "ResultVerified",
            EventKind::DisputeRaised { .. } => "DisputeRaised",
            EventKind::PaymentReleased { .. } => "PaymentReleased",
            EventKind::DisputeResolved { .. } => "DisputeResolved",
            EventKind::JobCancelled { .. } => "JobCancelled",
            EventKind::JobFailed { .. } => "JobFailed",
            EventKind::JobExpired { .. } => "JobExpired",
        }
    }
}

/// A confirmed fact read from the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: EventId,
    pub job: JobId,
    pub height: u64,
    pub tx: TxId,
    pub kind: EventKind,
}

/// Calls into the escrow contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPayload {
    CreateJob {
        spec: JobSpec,
    },
    LockEscrow {
        job: JobId,
        amount: u64,
    },
    AssignProvider {
        job: JobId,
        provider: Address,
        price: u64,
        attempt: u32,
    },
    RevokeAssignment {
        job: JobId,
        provider: Address,
        reason: RevocationReason,
    },
    MarkExecuting {
        job: JobId,
        provider: Address,
    },
    SubmitResult {
        job: JobId,
        provider: Address,
        result_ref: ContentRef,
    },
    RecordVerification {
        job: JobId,
        provider: Address,
        evidence_ref: Option<ContentRef>,
    },
    RaiseDispute {
        job: JobId,
        reason: String,
        evidence_ref: Option<ContentRef>,
    },
    ReleasePayment {
        job: JobId,
        provider: Address,
    },
    ResolveDispute {
        job: JobId,
        in_favor_of_provider: bool,
    },
    CancelJob {
        job: JobId,
        penalty: u64,
    },
    FailJob {
        job: JobId,
        reason: String,
    },
    ExpireJob {
        job: JobId,
    },
}

impl TxPayload {
    pub fn job(&self) -> JobId {
        match self {
            TxPayload::CreateJob { spec } => spec.id(),
            TxPayload::LockEscrow { job, .. }
            | TxPayload::AssignProvider { job, .. }
            | TxPayload::RevokeAssignment { job, .. }
            | TxPayload::MarkExecuting { job, .. }
            | TxPayload::SubmitResult { job, .. }
            | TxPayload::RecordVerification { job, .. }
            | TxPayload::RaiseDispute { job, .. }
            | TxPayload::ReleasePayment { job, .. }
            | TxPayload::ResolveDispute { job, .. }
            | TxPayload::CancelJob { job, .. }
            | TxPayload::FailJob { job, .. }
            | TxPayload::ExpireJob { job } => job.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TxPayload::CreateJob { .. } => "CreateJob",
            TxPayload::LockEscrow { .. } => "LockEscrow",
            TxPayload::AssignProvider { .. } => "AssignProvider",
            TxPayload::RevokeAssignment { .. } => "RevokeAssignment",
            TxPayload::MarkExecuting { .. } => "MarkExecuting",
            TxPayload::SubmitResult { .. } => "SubmitResult",
            TxPayload::RecordVerification { .. } => "RecordVerification",
            TxPayload::RaiseDispute { .. } => "RaiseDispute",
            TxPayload::ReleasePayment { .. } => "ReleasePayment",
            TxPayload::ResolveDispute { .. } => "ResolveDispute",
            TxPayload::CancelJob { .. } => "CancelJob",
            TxPayload::FailJob { .. } => "FailJob",
            TxPayload::ExpireJob { .. } => "ExpireJob",
        }
    }

    /// Whether the call moves escrowed funds.
    pub fn moves_funds(&self) -> bool {
        matches!(
            self,
            TxPayload::LockEscrow { .. }
                | TxPayload::ReleasePayment { .. }
                | TxPayload::ResolveDispute { .. }
                | TxPayload::CancelJob { .. }
                | TxPayload::FailJob { .. }
                | TxPayload::ExpireJob { .. }
        )
    }
}

/// Signed envelope around a payload.
///
/// `replaces` names an earlier broadcast of the same intent; the ledger
/// evicts it if it is still unmined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub payload: TxPayload,
    pub nonce: u64,
    pub replaces: Option<TxId>,
}

impl Transaction {
    pub fn new(payload: TxPayload) -> Self {
        Self {
            payload,
            nonce: 0,
            replaces: None,
        }
    }

    /// Fresh broadcast of the same payload superseding `previous`.
    pub fn replacement(&self, previous: TxId) -> Self {
        Self {
            payload: self.payload.clone(),
            nonce: self.nonce + 1,
            replaces: Some(previous),
        }
    }
}

/// Why a transaction will never reach finality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// Evicted from the mempool or orphaned by a reorganization.
    Orphaned,
    /// Superseded by a replacement broadcast.
    Replaced,
    /// Executed and rejected by the contract.
    Reverted(String),
}

/// Outcome of waiting for a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed { height: u64, depth: u64 },
    Dropped(DropReason),
    Timeout,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("unknown transaction {0}")]
    UnknownTransaction(TxId),

    #[error("transaction {tx} rejected: {reason}")]
    Rejected { tx: TxId, reason: String },
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Chain access used by the orchestrator.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Broadcast a transaction; returns as soon as the node accepted it.
    async fn submit_transaction(&self, tx: Transaction) -> LedgerResult<TxId>;

    /// Wait until `tx` is buried `min_depth` blocks deep, dropped, or `timeout` elapses.
    async fn await_confirmation(
        &self,
        tx: &TxId,
        min_depth: u64,
        timeout: Duration,
    ) -> LedgerResult<Confirmation>;

    /// Height of the latest block.
    async fn head_height(&self) -> LedgerResult<u64>;

    /// Events emitted in blocks `from..=to`, in chain order.
    async fn events_in_range(&self, from: u64, to: u64) -> LedgerResult<Vec<LedgerEvent>>;
}
