use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::ids::{Address, JobId};
use crate::state_machine::{Job, ResourceRequirements};

/// Resources a provider claims to offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilityAttestation {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub gpu: bool,
}

impl CapabilityAttestation {
    pub fn covers(&self, req: &ResourceRequirements) -> bool {
        self.cpu_cores >= req.cpu_cores && self.memory_mb >= req.memory_mb && (self.gpu || !req.gpu)
    }
}

/// A provider's offer to run a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub provider: Address,
    pub job: JobId,
    pub price: u64,
    pub capabilities: CapabilityAttestation,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Bid {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Live bids per job. A bid leaves the book when it is consumed by an
/// assignment, when it expires, or when its job is done.
#[derive(Debug, Default)]
pub struct BidBook {
    bids: HashMap<JobId, Vec<Bid>>,
}

impl BidBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a bid. A later bid from the same provider replaces the earlier one.
    pub fn submit(&mut self, bid: Bid) {
        let bids = self.bids.entry(bid.job.clone()).or_default();
        bids.retain(|b| b.provider != bid.provider);
        bids.push(bid);
    }

    /// Bids for `job` still live at `now`; expired ones are discarded.
    pub fn live(&mut self, job: &JobId, now: DateTime<Utc>) -> Vec<Bid> {
        let Some(bids) = self.bids.get_mut(job) else {
            return Vec::new();
        };
        bids.retain(|b| b.is_live(now));
        bids.clone()
    }

    /// Remove the bid that won an assignment so it can never be used twice.
    pub fn consume(&mut self, job: &JobId, provider: &Address) -> Option<Bid> {
        let bids = self.bids.get_mut(job)?;
        let idx = bids.iter().position(|b| &b.provider == provider)?;
        Some(bids.remove(idx))
    }

    pub fn discard_job(&mut self, job: &JobId) {
        self.bids.remove(job);
    }

    pub fn len(&self, job: &JobId) -> usize {
        self.bids.get(job).map(Vec::len).unwrap_or(0)
    }
}

/// Deterministic provider selection.
pub struct ProviderMatcher;

impl ProviderMatcher {
    /// Pick the cheapest eligible bid for `job`.
    ///
    /// Eligible: live, for this job, capabilities cover the requirements,
    /// price within the escrow ceiling, provider not in `excluded`.
    /// Ties break on earliest submission, then smallest address.
    pub fn select(
        job: &Job,
        bids: &[Bid],
        excluded: &HashSet<Address>,
        now: DateTime<Utc>,
    ) -> EngineResult<Bid> {
        let ceiling = job.spec.escrow;
        bids.iter()
            .filter(|b| b.job == job.id)
            .filter(|b| b.is_live(now))
            .filter(|b| b.price <= ceiling)
            .filter(|b| b.capabilities.covers(&job.spec.requirements))
            .filter(|b| !excluded.contains(&b.provider))
            .min_by(|a, b| {
                a.price
                    .cmp(&b.price)
                    .then_with(|| a.submitted_at.cmp(&b.submitted_at))
                    .then_with(|| a.provider.cmp(&b.provider))
            })
            .cloned()
            .ok_or_else(|| EngineError::NoEligibleProvider(job.id.clone()))
    }
}
