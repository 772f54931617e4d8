//! Turns a submitted result into a settlement decision.
//!
//! Inconclusive verdicts are retried with exponential backoff and jitter.
//! Once the retry ceiling is hit the verdict is final-inconclusive and the
//! job goes to dispute. Every decision is persisted to the content store as
//! evidence and cached per (job, attempt), so a replayed result never
//! produces a second decision.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::ids::{ContentRef, JobId};
use crate::retry::RetryPolicy;
use crate::state_machine::JobSpec;
use crate::store::ContentStore;
use crate::verifier::{Verdict, Verifier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementDecision {
    pub job: JobId,
    pub attempt: u32,
    pub verdict: Verdict,
    /// Retries ran out while the verifier stayed inconclusive.
    pub final_inconclusive: bool,
    pub evidence_ref: Option<ContentRef>,
    pub decided_at: DateTime<Utc>,
    pub verifier_calls: u32,
}

/// What the orchestrator should put on chain for a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementAction {
    RecordVerification,
    RaiseDispute { reason: String },
}

impl SettlementDecision {
    pub fn action(&self) -> SettlementAction {
        match &self.verdict {
            Verdict::Accept => SettlementAction::RecordVerification,
            Verdict::Reject(reason) => SettlementAction::RaiseDispute {
                reason: format!("verification rejected: {reason}"),
            },
            Verdict::Inconclusive(reason) => SettlementAction::RaiseDispute {
                reason: format!("verification inconclusive: {reason}"),
            },
        }
    }
}

pub struct SettlementEngine {
    verifier: Arc<dyn Verifier>,
    store: Arc<dyn ContentStore>,
    policy: RetryPolicy,
    call_timeout: Duration,
    decisions: DashMap<(JobId, u32), SettlementDecision>,
}

impl SettlementEngine {
    pub fn new(
        verifier: Arc<dyn Verifier>,
        store: Arc<dyn ContentStore>,
        policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            store,
            policy,
            call_timeout,
            decisions: DashMap::new(),
        }
    }

    pub fn verifier_name(&self) -> &'static str {
        self.verifier.name()
    }

    /// Decision already emitted for this attempt, if any.
    pub fn decision(&self, job: &JobId, attempt: u32) -> Option<SettlementDecision> {
        self.decisions
            .get(&(job.clone(), attempt))
            .map(|d| d.value().clone())
    }

    /// Verify `result` for attempt `attempt` of the job described by `spec`.
    pub async fn settle(
        &self,
        spec: &JobSpec,
        attempt: u32,
        result: &ContentRef,
        now: DateTime<Utc>,
    ) -> SettlementDecision {
        let job = spec.id();
        if let Some(decision) = self.decision(&job, attempt) {
            return decision;
        }

        let mut calls = 0;
        let verdict = loop {
            calls += 1;
            let verdict = match timeout(self.call_timeout, self.verifier.verify(spec, result)).await {
                Ok(verdict) => verdict,
                Err(_) => Verdict::Inconclusive("verifier call timed out".to_string()),
            };
            if !verdict.is_inconclusive() || !self.policy.allows(calls) {
                break verdict;
            }
            let delay = self.policy.jittered(calls);
            warn!(
                job = %job.short(),
                call = calls,
                verdict = %verdict,
                delay = ?delay,
                "Verification inconclusive, retrying"
            );
            sleep(delay).await;
        };

        let final_inconclusive = verdict.is_inconclusive();
        if final_inconclusive {
            let err = EngineError::VerificationTimeout {
                job: job.clone(),
                attempts: calls,
            };
            warn!(job = %job.short(), error = %err, "Escalating to dispute");
        }

        let mut decision = SettlementDecision {
            job: job.clone(),
            attempt,
            verdict,
            final_inconclusive,
            evidence_ref: None,
            decided_at: now,
            verifier_calls: calls,
        };
        decision.evidence_ref = self.store_evidence(&decision).await;
        info!(
            job = %job.short(),
            attempt,
            verdict = %decision.verdict,
            verifier = self.verifier.name(),
            "Settlement decision"
        );

        // First decision for an attempt wins.
        self.decisions
            .entry((job, attempt))
            .or_insert(decision)
            .value()
            .clone()
    }

    async fn store_evidence(&self, decision: &SettlementDecision) -> Option<ContentRef> {
        let bytes = match serde_json::to_vec(decision) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(job = %decision.job.short(), error = %err, "Could not encode evidence");
                return None;
            }
        };
        match self.store.put(&bytes).await {
            Ok(content) => Some(content),
            Err(err) => {
                warn!(job = %decision.job.short(), error = %err, "Could not store evidence");
                None
            }
        }
    }
}
