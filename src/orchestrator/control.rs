//! Reactions to confirmed events and the intents they put on chain.
//!
//! Every function here runs with the job's control mutex held.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::error::{EngineError, EngineResult};
use crate::ids::{Address, JobId, TxId};
use crate::ledger::{Confirmation, DropReason, EventKind, LedgerEvent, Transaction, TxPayload};
use crate::matcher::ProviderMatcher;
use crate::monitor::ReassignmentRequested;
use crate::settlement::SettlementAction;
use crate::state_machine::{Job, JobStatus, PendingTransition};

/// Off-chain bookkeeping for one job.
#[derive(Debug, Default)]
pub(super) struct JobControl {
    /// Providers that timed out on this job.
    pub excluded: HashSet<Address>,
    /// Consecutive matching rounds without an eligible bid.
    pub matching_attempts: u32,
    pub next_match_at: Option<DateTime<Utc>>,
    /// A ReleasePayment was already put on chain.
    pub payment_requested: bool,
    /// Timeout whose revocation never made it on chain.
    pub revocation: Option<ReassignmentRequested>,
}

/// Whether `signal` still names the job's current provider and attempt.
fn is_current(job: &Job, signal: &ReassignmentRequested) -> bool {
    job.status.has_provider()
        && job.provider.as_ref() == Some(&signal.provider)
        && job.attempt == signal.attempt
}

impl Orchestrator {
    pub(super) async fn react(
        &self,
        control: &mut JobControl,
        job: &Job,
        event: &LedgerEvent,
    ) -> EngineResult<()> {
        match &event.kind {
            EventKind::JobCreated { .. } => self.lock_escrow(job).await,
            EventKind::EscrowLocked { .. } => self.try_match(control, job).await,
            EventKind::ProviderAssigned {
                provider, attempt, ..
            } => {
                self.lock_bids().consume(&job.id, provider);
                control.matching_attempts = 0;
                control.next_match_at = None;
                control.revocation = None;
                self.lock_monitor().begin_attempt(
                    &job.id,
                    provider,
                    *attempt,
                    job.spec.deadline,
                    self.clock.now(),
                );
                Ok(())
            }
            EventKind::AssignmentRevoked { provider, reason } => {
                info!(job = %job.id.short(), provider = %provider, reason = %reason, "Assignment revoked");
                self.lock_monitor().close(&job.id);
                control.excluded.insert(provider.clone());
                control.revocation = None;
                self.try_match(control, job).await
            }
            EventKind::ExecutionStarted { .. } => Ok(()),
            EventKind::ResultSubmitted { .. } => self.settle(job).await,
            EventKind::ResultVerified { provider, .. } => {
                self.release_payment(control, job, provider).await
            }
            EventKind::DisputeRaised { reason, .. } => {
                warn!(job = %job.id.short(), reason = %reason, "Job disputed, awaiting arbitration");
                Ok(())
            }
            EventKind::PaymentReleased { .. }
            | EventKind::DisputeResolved { .. }
            | EventKind::JobCancelled { .. }
            | EventKind::JobFailed { .. }
            | EventKind::JobExpired { .. } => {
                self.lock_monitor().close(&job.id);
                self.lock_bids().discard_job(&job.id);
                self.pending.remove(&job.id);
                control.revocation = None;
                info!(
                    job = %job.id.short(),
                    status = %job.status,
                    paid = job.payout.as_ref().map(|p| p.amount).unwrap_or(0),
                    refunded = job.refund,
                    "Job finished"
                );
                Ok(())
            }
        }
    }

    /// Periodic pass over one open job. Retries whatever reaction is due;
    /// jobs with a transaction in flight are left alone.
    pub(super) async fn checkpoint(&self, id: &JobId, now: DateTime<Utc>) -> EngineResult<()> {
        let control = self.control(id);
        let mut control = control.lock().await;
        if self.pending.contains_key(id) || self.halted.contains_key(id) {
            return Ok(());
        }
        let Some(job) = self.job(id) else {
            return Ok(());
        };

        match job.status {
            JobStatus::Submitted if now >= job.spec.deadline => self.expire(&job).await,
            JobStatus::Submitted => self.lock_escrow(&job).await,
            JobStatus::Escrowed => {
                if control.next_match_at.is_none_or(|at| at <= now) {
                    self.try_match(&mut control, &job).await
                } else {
                    Ok(())
                }
            }
            JobStatus::Assigned | JobStatus::Executing if now >= job.spec.deadline => {
                self.expire(&job).await
            }
            JobStatus::Assigned | JobStatus::Executing => {
                self.resume_execution(&mut control, &job).await
            }
            JobStatus::ResultSubmitted => self.settle(&job).await,
            JobStatus::Verified => match job.provider.clone() {
                Some(provider) => self.release_payment(&mut control, &job, &provider).await,
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Handle a timeout reported by the execution monitor.
    pub(super) async fn on_reassignment(&self, signal: &ReassignmentRequested) -> EngineResult<()> {
        let control = self.control(&signal.job);
        let mut control = control.lock().await;
        if self.halted.contains_key(&signal.job) {
            return Ok(());
        }
        let Some(job) = self.job(&signal.job) else {
            return Ok(());
        };
        if !is_current(&job, signal) {
            debug!(job = %signal.job.short(), attempt = signal.attempt, "Stale reassignment signal");
            return Ok(());
        }

        warn!(
            job = %job.id.short(),
            provider = %signal.provider,
            attempt = signal.attempt,
            reason = %signal.reason,
            "Provider timed out"
        );
        control.excluded.insert(signal.provider.clone());

        // The monitor reports each timeout once; keep it until it lands.
        let replaced = self.replace_provider(&job, signal).await;
        control.revocation = replaced.is_err().then(|| signal.clone());
        replaced
    }

    /// Expire, fail or revoke, depending on the deadline and attempts left.
    async fn replace_provider(&self, job: &Job, signal: &ReassignmentRequested) -> EngineResult<()> {
        if self.clock.now() >= job.spec.deadline {
            return self.expire(job).await;
        }
        let max_attempts = self.config.retry.max_assignment_attempts;
        if job.attempt >= max_attempts {
            let reason = format!("{} assignments timed out", job.attempt);
            return self.fail(job, reason).await;
        }
        self.submit_intent(
            &job.id,
            TxPayload::RevokeAssignment {
                job: job.id.clone(),
                provider: signal.provider.clone(),
                reason: signal.reason,
            },
            JobStatus::Escrowed,
        )
        .await
        .map(|_| ())
    }

    /// Retry a revocation that failed, or a MarkExecuting the provider
    /// asked for with a heartbeat that never made it on chain.
    async fn resume_execution(&self, control: &mut JobControl, job: &Job) -> EngineResult<()> {
        if let Some(signal) = control.revocation.clone() {
            if !is_current(job, &signal) {
                control.revocation = None;
                return Ok(());
            }
            info!(job = %job.id.short(), provider = %signal.provider, "Retrying revocation");
            let replaced = self.replace_provider(job, &signal).await;
            if replaced.is_ok() {
                control.revocation = None;
            }
            return replaced;
        }

        let Some(provider) = job.provider.clone() else {
            return Ok(());
        };
        let started = self
            .lock_monitor()
            .active(&job.id)
            .is_some_and(|r| r.provider == provider && r.started_at.is_some());
        if job.status == JobStatus::Assigned && started {
            return self.mark_executing(job, &provider).await;
        }
        Ok(())
    }

    pub(super) async fn mark_executing(&self, job: &Job, provider: &Address) -> EngineResult<()> {
        self.submit_intent(
            &job.id,
            TxPayload::MarkExecuting {
                job: job.id.clone(),
                provider: provider.clone(),
            },
            JobStatus::Executing,
        )
        .await
        .map(|_| ())
    }

    async fn try_match(&self, control: &mut JobControl, job: &Job) -> EngineResult<()> {
        if job.status != JobStatus::Escrowed || self.pending.contains_key(&job.id) {
            return Ok(());
        }
        let now = self.clock.now();
        if now >= job.spec.deadline {
            return self.expire(job).await;
        }

        let bids = self.lock_bids().live(&job.id, now);
        match ProviderMatcher::select(job, &bids, &control.excluded, now) {
            Ok(bid) => {
                control.next_match_at = None;
                let attempt = job.attempt + 1;
                info!(
                    job = %job.id.short(),
                    provider = %bid.provider,
                    price = bid.price,
                    attempt,
                    "Provider selected"
                );
                self.submit_intent(
                    &job.id,
                    TxPayload::AssignProvider {
                        job: job.id.clone(),
                        provider: bid.provider,
                        price: bid.price,
                        attempt,
                    },
                    JobStatus::Assigned,
                )
                .await
                .map(|_| ())
            }
            Err(err @ EngineError::NoEligibleProvider(_)) => {
                control.matching_attempts += 1;
                let policy = self.config.retry.matching_policy();
                if control.matching_attempts >= policy.max_retries {
                    warn!(job = %job.id.short(), rounds = control.matching_attempts, "Matching exhausted");
                    let reason =
                        format!("no eligible provider after {} rounds", control.matching_attempts);
                    return self.fail(job, reason).await;
                }
                let delay = policy.jittered(control.matching_attempts);
                let retry_at = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                control.next_match_at = Some(retry_at);
                debug!(
                    job = %job.id.short(),
                    round = control.matching_attempts,
                    error = %err,
                    retry_at = %retry_at,
                    "Matching retry scheduled"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn settle(&self, job: &Job) -> EngineResult<()> {
        let (Some(provider), Some(result)) = (job.provider.clone(), job.result_ref.clone()) else {
            return Ok(());
        };
        let decision = self
            .settlement
            .settle(&job.spec, job.attempt, &result, self.clock.now())
            .await;
        self.lock_monitor()
            .record_verdict(&job.id, job.attempt, decision.verdict.clone());

        let (payload, target) = match decision.action() {
            SettlementAction::RecordVerification => (
                TxPayload::RecordVerification {
                    job: job.id.clone(),
                    provider,
                    evidence_ref: decision.evidence_ref,
                },
                JobStatus::Verified,
            ),
            SettlementAction::RaiseDispute { reason } => (
                TxPayload::RaiseDispute {
                    job: job.id.clone(),
                    reason,
                    evidence_ref: decision.evidence_ref,
                },
                JobStatus::Disputed,
            ),
        };
        self.submit_intent(&job.id, payload, target).await.map(|_| ())
    }

    /// At most one ReleasePayment per job leaves this process.
    async fn release_payment(
        &self,
        control: &mut JobControl,
        job: &Job,
        provider: &Address,
    ) -> EngineResult<()> {
        if control.payment_requested {
            debug!(job = %job.id.short(), "Payment already requested");
            return Ok(());
        }
        control.payment_requested = true;
        let released = self
            .submit_intent(
                &job.id,
                TxPayload::ReleasePayment {
                    job: job.id.clone(),
                    provider: provider.clone(),
                },
                JobStatus::Settled,
            )
            .await;
        if released.is_err() {
            control.payment_requested = false;
        }
        released.map(|_| ())
    }

    async fn lock_escrow(&self, job: &Job) -> EngineResult<()> {
        self.submit_intent(
            &job.id,
            TxPayload::LockEscrow {
                job: job.id.clone(),
                amount: job.spec.escrow,
            },
            JobStatus::Escrowed,
        )
        .await
        .map(|_| ())
    }

    async fn expire(&self, job: &Job) -> EngineResult<()> {
        info!(job = %job.id.short(), deadline = %job.spec.deadline, "Deadline passed, expiring job");
        self.submit_intent(
            &job.id,
            TxPayload::ExpireJob {
                job: job.id.clone(),
            },
            JobStatus::Expired,
        )
        .await
        .map(|_| ())
    }

    async fn fail(&self, job: &Job, reason: String) -> EngineResult<()> {
        self.submit_intent(
            &job.id,
            TxPayload::FailJob {
                job: job.id.clone(),
                reason,
            },
            JobStatus::Failed,
        )
        .await
        .map(|_| ())
    }

    /// Broadcast `payload` and wait for finality, resubmitting a replacement
    /// when the transaction is dropped or stalls. The job shows `target` as
    /// pending until the resulting event is ingested.
    pub(super) async fn submit_intent(
        &self,
        job: &JobId,
        payload: TxPayload,
        target: JobStatus,
    ) -> EngineResult<TxId> {
        let submitted = self.confirm(job, Transaction::new(payload), target).await;
        if submitted.is_err() {
            self.pending.remove(job);
        }
        submitted
    }

    async fn confirm(&self, job: &JobId, mut tx: Transaction, target: JobStatus) -> EngineResult<TxId> {
        let chain = &self.config.chain;
        let mut submissions = 0;
        loop {
            let id = self.broadcast(job, &tx).await?;
            submissions += 1;
            self.pending.insert(
                job.clone(),
                PendingTransition {
                    target,
                    tx: id.clone(),
                    since: self.clock.now(),
                },
            );
            debug!(job = %job.short(), tx = %id, call = tx.payload.name(), nonce = tx.nonce, "Transaction broadcast");

            match self
                .ledger
                .await_confirmation(&id, chain.finality_depth, chain.confirmation_timeout())
                .await
            {
                Ok(Confirmation::Confirmed { height, depth }) => {
                    debug!(job = %job.short(), tx = %id, height, depth, "Transaction final");
                    return Ok(id);
                }
                Ok(Confirmation::Dropped(DropReason::Reverted(reason))) => {
                    return Err(EngineError::TransactionReverted { tx: id, reason });
                }
                Ok(outcome) => {
                    warn!(job = %job.short(), tx = %id, outcome = ?outcome, "Transaction not confirmed");
                }
                Err(err) => {
                    warn!(job = %job.short(), tx = %id, error = %err, "Confirmation unknown");
                }
            }

            if submissions > chain.max_resubmissions {
                return Err(EngineError::TransactionDropped {
                    job: job.clone(),
                    attempts: submissions,
                });
            }
            info!(job = %job.short(), replaces = %id, nonce = tx.nonce + 1, "Resubmitting transaction");
            tx = tx.replacement(id);
        }
    }

    /// Submit with backoff while the node is unreachable.
    async fn broadcast(&self, job: &JobId, tx: &Transaction) -> EngineResult<TxId> {
        let policy = self.config.retry.chain_policy();
        let limit = self.config.chain.max_resubmissions;
        let mut failures = 0;
        loop {
            match self.ledger.submit_transaction(tx.clone()).await {
                Ok(id) => return Ok(id),
                Err(err) => {
                    let err = EngineError::from(err);
                    failures += 1;
                    if !err.is_transient() || failures > limit {
                        return Err(err);
                    }
                    let delay = policy.jittered(failures);
                    warn!(
                        job = %job.short(),
                        error = %err,
                        attempt = failures,
                        delay = ?delay,
                        "Broadcast failed, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
