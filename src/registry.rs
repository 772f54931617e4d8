//! Projection of all jobs built purely from confirmed ledger events.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::EngineResult;
use crate::ids::{EventId, JobId};
use crate::ledger::{LedgerEvent, RegistrySnapshot};
use crate::state_machine::{Job, JobStatus, StateMachine};

/// Result of feeding one event to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Transitioned(JobStatus),
    /// Event id already applied; nothing changed.
    Duplicate,
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
    applied: HashSet<EventId>,
    height: u64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one confirmed event.
    ///
    /// Idempotent per event id. A rejected event leaves the registry
    /// untouched and is not marked as applied.
    pub fn apply(&mut self, event: &LedgerEvent) -> EngineResult<Applied> {
        if self.applied.contains(&event.id) {
            debug!(job = %event.job.short(), event = %event.id, "Duplicate event ignored");
            return Ok(Applied::Duplicate);
        }

        let next = StateMachine::apply(self.jobs.get(&event.job), event)?;
        let status = next.status;
        self.jobs.insert(event.job.clone(), next);
        self.applied.insert(event.id.clone());
        self.height = self.height.max(event.height);
        debug!(
            job = %event.job.short(),
            event = event.kind.name(),
            status = %status,
            height = event.height,
            "Transition applied"
        );
        Ok(Applied::Transitioned(status))
    }

    pub fn query(&self, job: &JobId) -> Option<&Job> {
        self.jobs.get(job)
    }

    /// All jobs, ordered by creation height then id.
    pub fn jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by(|a, b| {
            a.created_height
                .cmp(&b.created_height)
                .then_with(|| a.id.cmp(&b.id))
        });
        jobs
    }

    /// Highest height of any applied event.
    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn contains_event(&self, id: &EventId) -> bool {
        self.applied.contains(id)
    }

    /// Fold `events` from scratch. Events the state machine rejects are
    /// logged and skipped.
    pub fn rebuild(events: &[LedgerEvent]) -> Self {
        let mut registry = Self::new();
        for event in events {
            if let Err(err) = registry.apply(event) {
                warn!(job = %event.job.short(), event = %event.id, error = %err, "Dropping event during rebuild");
            }
        }
        registry
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            jobs: self
                .jobs
                .iter()
                .map(|(id, job)| (id.clone(), job.clone()))
                .collect(),
            applied: self.applied.iter().cloned().collect(),
            height: self.height,
        }
    }

    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            jobs: snapshot.jobs.into_iter().collect(),
            applied: snapshot.applied.into_iter().collect(),
            height: snapshot.height,
        }
    }
}
