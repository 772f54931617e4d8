use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::{Job, Payout};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{EventKind, LedgerEvent};

/// Lifecycle states of a marketplace job.
///
/// Happy path: SUBMITTED → ESCROWED → ASSIGNED → EXECUTING →
/// RESULT_SUBMITTED → VERIFIED → SETTLED, with DISPUTED, EXPIRED,
/// CANCELLED and FAILED as side branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Submitted,
    Escrowed,
    Assigned,
    Executing,
    ResultSubmitted,
    Verified,
    Settled,
    Disputed,
    Expired,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Settled | JobStatus::Expired | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    /// A provider holds the job (assignment confirmed, no result yet).
    pub fn has_provider(self) -> bool {
        matches!(self, JobStatus::Assigned | JobStatus::Executing)
    }

    /// Owner cancellation is only honoured before a result exists.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            JobStatus::Submitted | JobStatus::Escrowed | JobStatus::Assigned | JobStatus::Executing
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Escrowed => "ESCROWED",
            JobStatus::Assigned => "ASSIGNED",
            JobStatus::Executing => "EXECUTING",
            JobStatus::ResultSubmitted => "RESULT_SUBMITTED",
            JobStatus::Verified => "VERIFIED",
            JobStatus::Settled => "SETTLED",
            JobStatus::Disputed => "DISPUTED",
            JobStatus::Expired => "EXPIRED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// The pure transition function behind the job registry.
pub struct StateMachine;

impl StateMachine {
    /// Outgoing edge taken by `kind` from `from`, if there is one.
    pub fn next_status(from: JobStatus, kind: &EventKind) -> Option<JobStatus> {
        use JobStatus::*;

        let to = match (from, kind) {
            (Submitted, EventKind::EscrowLocked { .. }) => Escrowed,
            (Escrowed, EventKind::ProviderAssigned { .. }) => Assigned,
            (Assigned | Executing, EventKind::AssignmentRevoked { .. }) => Escrowed,
            (Assigned, EventKind::ExecutionStarted { .. }) => Executing,
            (Executing, EventKind::ResultSubmitted { .. }) => ResultSubmitted,
            (ResultSubmitted, EventKind::ResultVerified { .. }) => Verified,
            (ResultSubmitted, EventKind::DisputeRaised { .. }) => Disputed,
            (Verified, EventKind::PaymentReleased { .. }) => Settled,
            (Disputed, EventKind::DisputeResolved { in_favor_of_provider, .. }) => {
                if *in_favor_of_provider {
                    Settled
                } else {
                    Failed
                }
            }
            (Escrowed | Assigned | Executing, EventKind::JobFailed { .. }) => Failed,
            (Submitted | Escrowed | Assigned | Executing, EventKind::JobExpired { .. }) => Expired,
            (status, EventKind::JobCancelled { .. }) if !status.is_terminal() => Cancelled,
            _ => return None,
        };
        Some(to)
    }

    /// Compute the job that results from applying `event` to `current`.
    ///
    /// Never mutates its input: an event that does not match an outgoing
    /// edge yields `InvalidTransition`, and an event whose amounts disagree
    /// with the locked escrow yields `EscrowMismatch`.
    pub fn apply(current: Option<&Job>, event: &LedgerEvent) -> EngineResult<Job> {
        let job = match (current, &event.kind) {
            (None, EventKind::JobCreated { spec }) => {
                if spec.id() != event.job {
                    return Err(invalid(None, event));
                }
                return Ok(Job::created(event.job.clone(), spec.clone(), event.height));
            }
            (None, _) | (Some(_), EventKind::JobCreated { .. }) => {
                return Err(invalid(current, event));
            }
            (Some(job), _) => job,
        };

        let to = Self::next_status(job.status, &event.kind).ok_or_else(|| invalid(current, event))?;
        let mut next = job.clone();

        match &event.kind {
            // Rejected before the edge lookup.
            EventKind::JobCreated { .. } => {}
            EventKind::EscrowLocked { amount } => {
                ensure_escrow(job, job.spec.escrow, *amount)?;
                next.escrow_locked = Some(*amount);
            }
            EventKind::ProviderAssigned {
                provider, attempt, ..
            } => {
                if *attempt <= job.attempt {
                    return Err(invalid(current, event));
                }
                next.provider = Some(provider.clone());
                next.attempt = *attempt;
                next.result_ref = None;
            }
            EventKind::AssignmentRevoked { provider, .. } => {
                ensure_provider(job, provider, event)?;
                next.provider = None;
            }
            EventKind::ExecutionStarted { provider } => {
                ensure_provider(job, provider, event)?;
            }
            EventKind::ResultSubmitted {
                provider,
                result_ref,
            } => {
                ensure_provider(job, provider, event)?;
                next.result_ref = Some(result_ref.clone());
            }
            EventKind::ResultVerified { provider, .. } => {
                ensure_provider(job, provider, event)?;
            }
            EventKind::DisputeRaised { .. } => {
                next.disputed = true;
            }
            EventKind::PaymentReleased { provider, amount } => {
                ensure_provider(job, provider, event)?;
                ensure_escrow(job, job.locked_amount(), *amount)?;
                next.payout = Some(Payout {
                    provider: provider.clone(),
                    amount: *amount,
                });
            }
            EventKind::DisputeResolved {
                in_favor_of_provider,
                amount,
            } => {
                ensure_escrow(job, job.locked_amount(), *amount)?;
                if *in_favor_of_provider {
                    let provider = job.provider.clone().ok_or_else(|| invalid(current, event))?;
                    next.payout = Some(Payout {
                        provider,
                        amount: *amount,
                    });
                } else {
                    next.refund = *amount;
                }
            }
            EventKind::JobCancelled {
                refund,
                penalty,
                provider,
            } => {
                ensure_escrow(job, job.locked_amount(), refund.saturating_add(*penalty))?;
                next.refund = *refund;
                if *penalty > 0 {
                    let provider = provider.clone().ok_or_else(|| invalid(current, event))?;
                    next.payout = Some(Payout {
                        provider,
                        amount: *penalty,
                    });
                }
            }
            EventKind::JobFailed { refund, .. } | EventKind::JobExpired { refund } => {
                ensure_escrow(job, job.locked_amount(), *refund)?;
                next.refund = *refund;
            }
        }

        next.status = to;
        next.history.push(to);
        next.last_height = event.height;
        Ok(next)
    }
}

fn invalid(current: Option<&Job>, event: &LedgerEvent) -> EngineError {
    EngineError::InvalidTransition {
        job: event.job.clone(),
        from: current
            .map(|job| job.status.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        event: event.kind.name().to_string(),
    }
}

fn ensure_escrow(job: &Job, expected: u64, actual: u64) -> EngineResult<()> {
    if expected != actual {
        return Err(EngineError::EscrowMismatch {
            job: job.id.clone(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn ensure_provider(
    job: &Job,
    provider: &crate::ids::Address,
    event: &LedgerEvent,
) -> EngineResult<()> {
    if job.provider.as_ref() != Some(provider) {
        return Err(invalid(Some(job), event));
    }
    Ok(())
}
