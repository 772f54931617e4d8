//! Off-chain tracking of provider attempts: heartbeats, progress, results
//! and the timeouts that trigger reassignment.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ids::{Address, ContentRef, JobId};
use crate::ledger::RevocationReason;
use crate::verifier::Verdict;

/// One provider's attempt at one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job: JobId,
    pub provider: Address,
    pub attempt: u32,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Provider-reported completion percentage.
    pub progress: Option<u8>,
    pub result_ref: Option<ContentRef>,
    pub verdict: Option<Verdict>,
    /// Deadline for this attempt: the earlier of the execution deadline and
    /// the job deadline.
    pub deadline: DateTime<Utc>,
    pub timed_out: Option<RevocationReason>,
    pub closed: bool,
}

impl ExecutionRecord {
    fn is_watchable(&self) -> bool {
        !self.closed && self.result_ref.is_none() && self.timed_out.is_none()
    }

    fn last_activity(&self) -> DateTime<Utc> {
        self.last_heartbeat.unwrap_or(self.assigned_at)
    }
}

/// Internal signal consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassignmentRequested {
    pub job: JobId,
    pub provider: Address,
    pub attempt: u32,
    pub reason: RevocationReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// First sign of life for this attempt; execution has started.
    FirstHeartbeat,
    Progress,
    /// No open attempt for that provider (revoked, timed out, or unknown).
    Stale,
}

#[derive(Debug, Default)]
struct JobTrack {
    records: Vec<ExecutionRecord>,
    attempts: u32,
}

impl JobTrack {
    fn open_mut(&mut self, provider: &Address) -> Option<&mut ExecutionRecord> {
        self.records
            .last_mut()
            .filter(|r| !r.closed && &r.provider == provider)
    }
}

#[derive(Debug)]
pub struct ExecutionMonitor {
    tracks: HashMap<JobId, JobTrack>,
    heartbeat_timeout: Duration,
    execution_deadline: Duration,
}

impl ExecutionMonitor {
    pub fn new(heartbeat_timeout: Duration, execution_deadline: Duration) -> Self {
        Self {
            tracks: HashMap::new(),
            heartbeat_timeout,
            execution_deadline,
        }
    }

    /// Open a record for a confirmed assignment. Replayed assignments for an
    /// attempt already seen are ignored.
    pub fn begin_attempt(
        &mut self,
        job: &JobId,
        provider: &Address,
        attempt: u32,
        job_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let track = self.tracks.entry(job.clone()).or_default();
        if attempt <= track.attempts {
            debug!(job = %job.short(), attempt, "Attempt already tracked");
            return;
        }
        if let Some(previous) = track.records.last_mut() {
            previous.closed = true;
        }
        track.attempts = attempt;
        track.records.push(ExecutionRecord {
            job: job.clone(),
            provider: provider.clone(),
            attempt,
            assigned_at: now,
            started_at: None,
            last_heartbeat: None,
            progress: None,
            result_ref: None,
            verdict: None,
            deadline: (now + self.execution_deadline).min(job_deadline),
            timed_out: None,
            closed: false,
        });
        info!(job = %job.short(), provider = %provider, attempt, "Watching attempt");
    }

    pub fn record_heartbeat(
        &mut self,
        job: &JobId,
        provider: &Address,
        progress: Option<u8>,
        now: DateTime<Utc>,
    ) -> HeartbeatOutcome {
        let Some(record) = self
            .tracks
            .get_mut(job)
            .and_then(|t| t.open_mut(provider))
            .filter(|r| r.timed_out.is_none())
        else {
            return HeartbeatOutcome::Stale;
        };
        record.last_heartbeat = Some(now);
        if let Some(p) = progress {
            record.progress = Some(p.min(100));
        }
        if record.started_at.is_none() {
            record.started_at = Some(now);
            HeartbeatOutcome::FirstHeartbeat
        } else {
            HeartbeatOutcome::Progress
        }
    }

    /// Store the result reference of the open attempt. False when the
    /// provider holds no open attempt or already reported.
    pub fn record_result(&mut self, job: &JobId, provider: &Address, result: &ContentRef) -> bool {
        match self.tracks.get_mut(job).and_then(|t| t.open_mut(provider)) {
            Some(record) if record.result_ref.is_none() && record.timed_out.is_none() => {
                record.result_ref = Some(result.clone());
                true
            }
            _ => false,
        }
    }

    /// Undo [`record_result`](Self::record_result) when the result never
    /// made it on chain, so the provider can report again.
    pub fn discard_result(&mut self, job: &JobId) {
        if let Some(record) = self
            .tracks
            .get_mut(job)
            .and_then(|t| t.records.last_mut())
            .filter(|r| !r.closed)
        {
            record.result_ref = None;
        }
    }

    pub fn record_verdict(&mut self, job: &JobId, attempt: u32, verdict: Verdict) {
        if let Some(record) = self
            .tracks
            .get_mut(job)
            .and_then(|t| t.records.iter_mut().find(|r| r.attempt == attempt))
            && record.verdict.is_none()
        {
            record.verdict = Some(verdict);
        }
    }

    /// Close the open attempt, e.g. after revocation or a terminal event.
    pub fn close(&mut self, job: &JobId) {
        if let Some(record) = self.tracks.get_mut(job).and_then(|t| t.records.last_mut()) {
            record.closed = true;
        }
    }

    pub fn active(&self, job: &JobId) -> Option<&ExecutionRecord> {
        self.tracks
            .get(job)
            .and_then(|t| t.records.last())
            .filter(|r| !r.closed)
    }

    pub fn records(&self, job: &JobId) -> &[ExecutionRecord] {
        self.tracks
            .get(job)
            .map(|t| t.records.as_slice())
            .unwrap_or(&[])
    }

    /// Highest attempt number seen for `job`. Never decreases.
    pub fn attempts(&self, job: &JobId) -> u32 {
        self.tracks.get(job).map(|t| t.attempts).unwrap_or(0)
    }

    /// Restore the attempt counter from the projection after a restart.
    pub fn restore_attempts(&mut self, job: &JobId, attempts: u32) {
        let track = self.tracks.entry(job.clone()).or_default();
        track.attempts = track.attempts.max(attempts);
    }

    /// Every open attempt that went silent or overran its deadline. Each
    /// record is reported at most once.
    pub fn check_timeouts(&mut self, now: DateTime<Utc>) -> Vec<ReassignmentRequested> {
        let heartbeat_timeout = self.heartbeat_timeout;
        let mut signals = Vec::new();
        for track in self.tracks.values_mut() {
            let Some(record) = track.records.last_mut().filter(|r| r.is_watchable()) else {
                continue;
            };
            let reason = if now >= record.deadline {
                RevocationReason::DeadlineMissed
            } else if now - record.last_activity() >= heartbeat_timeout {
                RevocationReason::HeartbeatTimeout
            } else {
                continue;
            };
            record.timed_out = Some(reason);
            signals.push(ReassignmentRequested {
                job: record.job.clone(),
                provider: record.provider.clone(),
                attempt: record.attempt,
                reason,
            });
        }
        signals.sort_by(|a, b| a.job.cmp(&b.job));
        signals
    }
}
