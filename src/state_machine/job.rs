use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::state::JobStatus;
use crate::ids::{Address, ContentRef, JobId, TxId};

/// Compute resources a job needs from its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub gpu: bool,
}

/// What the owner asks the marketplace to run. Its hash is the job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub owner: Address,
    pub input_ref: ContentRef,
    pub requirements: ResourceRequirements,
    pub deadline: DateTime<Utc>,
    pub escrow: u64,
    /// Lets an owner submit the same work twice under distinct ids.
    #[serde(default)]
    pub salt: u64,
}

impl JobSpec {
    /// Content hash of the specification, stable across processes.
    pub fn id(&self) -> JobId {
        let mut hasher = Sha256::new();
        hasher.update(self.owner.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.input_ref.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.requirements.cpu_cores.to_be_bytes());
        hasher.update(self.requirements.memory_mb.to_be_bytes());
        hasher.update([u8::from(self.requirements.gpu)]);
        hasher.update(self.deadline.timestamp_millis().to_be_bytes());
        hasher.update(self.escrow.to_be_bytes());
        hasher.update(self.salt.to_be_bytes());
        JobId::from(hex::encode(hasher.finalize()))
    }
}

/// Money that left escrow towards a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub provider: Address,
    pub amount: u64,
}

/// Projection of one job as established by confirmed ledger events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub status: JobStatus,
    /// Amount locked on chain; never changes once set.
    pub escrow_locked: Option<u64>,
    pub provider: Option<Address>,
    pub result_ref: Option<ContentRef>,
    pub disputed: bool,
    /// Number of provider assignments confirmed so far.
    pub attempt: u32,
    pub history: Vec<JobStatus>,
    pub payout: Option<Payout>,
    pub refund: u64,
    pub created_height: u64,
    pub last_height: u64,
}

impl Job {
    pub fn created(id: JobId, spec: JobSpec, height: u64) -> Self {
        Self {
            id,
            spec,
            status: JobStatus::Submitted,
            escrow_locked: None,
            provider: None,
            result_ref: None,
            disputed: false,
            attempt: 0,
            history: vec![JobStatus::Submitted],
            payout: None,
            refund: 0,
            created_height: height,
            last_height: height,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Escrow the ledger currently holds for this job.
    pub fn locked_amount(&self) -> u64 {
        self.escrow_locked.unwrap_or(0)
    }
}

/// A transaction the orchestrator has broadcast but the projection has not
/// yet observed as a confirmed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransition {
    pub target: JobStatus,
    pub tx: TxId,
    pub since: DateTime<Utc>,
}

/// What callers see when they ask for a job: last confirmed state plus
/// whatever is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job: Job,
    pub pending: Option<PendingTransition>,
    pub halted: Option<String>,
}

impl JobView {
    /// Display label, e.g. `ESCROWED -> ASSIGNED (pending)`.
    pub fn label(&self) -> String {
        match (&self.halted, &self.pending) {
            (Some(_), _) => format!("{} (halted)", self.job.status),
            (None, Some(p)) => format!("{} -> {} (pending)", self.job.status, p.target),
            (None, None) => self.job.status.to_string(),
        }
    }
}

/// Structured summary produced for operators once a job is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: JobId,
    pub owner: Address,
    pub status: JobStatus,
    pub state_transitions: Vec<JobStatus>,
    pub attempts: u32,
    pub provider: Option<Address>,
    pub escrow: u64,
    pub paid: u64,
    pub refunded: u64,
    pub disputed: bool,
    pub blocks_elapsed: u64,
}

impl AuditRecord {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            owner: job.spec.owner.clone(),
            status: job.status,
            state_transitions: job.history.clone(),
            attempts: job.attempt,
            provider: job.provider.clone(),
            escrow: job.spec.escrow,
            paid: job.payout.as_ref().map(|p| p.amount).unwrap_or(0),
            refunded: job.refund,
            disputed: job.disputed,
            blocks_elapsed: job.last_height.saturating_sub(job.created_height),
        }
    }
}
