//! Job lifecycle control loop.
//!
//! The orchestrator is the only writer of the [`JobRegistry`]: it applies
//! confirmed ledger events and reacts to them by putting new intents on
//! chain. Work for one job is serialized by a per-job async mutex; distinct
//! jobs proceed concurrently. Pending transactions are tracked separately
//! so queries can show an in-flight transition without ever mutating the
//! projection speculatively.

mod control;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorClass};
use crate::ids::{Address, ContentRef, JobId, TxId};
use crate::ledger::{
    EventKind, EventLog, EventSubscription, LedgerClient, LedgerEvent, RegistrySnapshot, TxPayload,
};
use crate::matcher::{Bid, BidBook};
use crate::monitor::{ExecutionMonitor, ExecutionRecord, HeartbeatOutcome};
use crate::registry::{Applied, JobRegistry};
use crate::settlement::SettlementEngine;
use crate::state_machine::{AuditRecord, Job, JobSpec, JobStatus, JobView, PendingTransition};
use crate::store::ContentStore;
use crate::verifier::Verifier;
use control::JobControl;

/// How the cached projection compared with the event log at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheStatus {
    /// No cache configured or no cache file yet.
    Missing,
    Current,
    /// Consistent with the log, but behind it.
    Stale,
    /// Disagrees with the log; discarded.
    Diverged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub events: usize,
    pub jobs: usize,
    /// Jobs that were re-armed because they are not terminal.
    pub active: usize,
    pub resume_from: u64,
    pub cache: CacheStatus,
}

pub struct Orchestrator {
    config: EngineConfig,
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    settlement: SettlementEngine,
    registry: RwLock<JobRegistry>,
    monitor: Mutex<ExecutionMonitor>,
    bids: Mutex<BidBook>,
    controls: DashMap<JobId, Arc<AsyncMutex<JobControl>>>,
    pending: DashMap<JobId, PendingTransition>,
    halted: DashMap<JobId, String>,
    subscription: AsyncMutex<EventSubscription>,
    event_log: Mutex<Option<EventLog>>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn ContentStore>,
        verifier: Arc<dyn Verifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let settlement = SettlementEngine::new(
            verifier,
            store,
            config.verification.retry_policy(),
            config.verification.call_timeout(),
        );
        let monitor = ExecutionMonitor::new(
            config.timeouts.heartbeat_timeout(),
            config.timeouts.execution_deadline(),
        );
        let subscription = subscription_from(&config, 1);
        Self {
            config,
            ledger,
            clock,
            settlement,
            registry: RwLock::new(JobRegistry::new()),
            monitor: Mutex::new(monitor),
            bids: Mutex::new(BidBook::new()),
            controls: DashMap::new(),
            pending: DashMap::new(),
            halted: DashMap::new(),
            subscription: AsyncMutex::new(subscription),
            event_log: Mutex::new(None),
        }
    }

    /// Append every applied event to `log`.
    pub fn with_event_log(self, log: EventLog) -> Self {
        *self.lock_log() = Some(log);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Put a new job on chain. Returns once the creation is final; the job
    /// shows up in queries when the event is ingested.
    pub async fn submit_job(&self, spec: JobSpec) -> EngineResult<JobId> {
        let id = spec.id();
        if spec.escrow == 0 {
            return Err(EngineError::InvalidRequest("escrow must be positive".into()));
        }
        if spec.deadline <= self.clock.now() {
            return Err(EngineError::InvalidRequest(format!(
                "deadline {} already passed",
                spec.deadline
            )));
        }
        if self.job(&id).is_some() {
            return Err(EngineError::InvalidRequest(format!("job {id} already exists")));
        }

        let control = self.control(&id);
        let _control = control.lock().await;
        info!(job = %id.short(), owner = %spec.owner, escrow = spec.escrow, "Submitting job");
        self.submit_intent(&id, TxPayload::CreateJob { spec }, JobStatus::Submitted)
            .await?;
        Ok(id)
    }

    /// Record a provider bid. Bids for jobs not yet ingested are accepted.
    pub async fn submit_bid(&self, bid: Bid) -> EngineResult<()> {
        let now = self.clock.now();
        if !bid.is_live(now) {
            return Err(EngineError::InvalidRequest(format!(
                "bid from {} already expired",
                bid.provider
            )));
        }
        if let Some(job) = self.job(&bid.job)
            && job.is_terminal()
        {
            return Err(EngineError::InvalidRequest(format!(
                "job {} is {}",
                job.id, job.status
            )));
        }

        let control = self.control(&bid.job);
        let mut control = control.lock().await;
        debug!(job = %bid.job.short(), provider = %bid.provider, price = bid.price, "Bid received");
        self.lock_bids().submit(bid);
        // Fresh supply: retry matching at the next checkpoint.
        if control.next_match_at.is_some() {
            control.next_match_at = Some(now);
        }
        Ok(())
    }

    /// Provider liveness report. The first heartbeat of an attempt moves the
    /// job to EXECUTING on chain.
    pub async fn heartbeat(
        &self,
        job_id: &JobId,
        provider: &Address,
        progress: Option<u8>,
    ) -> EngineResult<HeartbeatOutcome> {
        let control = self.control(job_id);
        let _control = control.lock().await;
        self.ensure_not_halted(job_id)?;
        let job = self.job(job_id).ok_or_else(|| EngineError::JobNotFound(job_id.clone()))?;

        let outcome = self
            .lock_monitor()
            .record_heartbeat(job_id, provider, progress, self.clock.now());
        match outcome {
            HeartbeatOutcome::Stale => {
                debug!(job = %job_id.short(), provider = %provider, "Stale heartbeat ignored");
            }
            // Any live heartbeat re-requests MarkExecuting until the chain
            // shows the job executing.
            _ if job.status == JobStatus::Assigned && !self.pending.contains_key(job_id) => {
                self.mark_executing(&job, provider).await?;
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Provider delivers its result reference.
    pub async fn report_result(
        &self,
        job_id: &JobId,
        provider: &Address,
        result: ContentRef,
    ) -> EngineResult<TxId> {
        let control = self.control(job_id);
        let _control = control.lock().await;
        self.ensure_not_halted(job_id)?;
        let job = self.job(job_id).ok_or_else(|| EngineError::JobNotFound(job_id.clone()))?;

        if job.status != JobStatus::Executing || job.provider.as_ref() != Some(provider) {
            return Err(EngineError::InvalidTransition {
                job: job_id.clone(),
                from: job.status.to_string(),
                event: "ResultSubmitted".to_string(),
            });
        }
        if !self.lock_monitor().record_result(job_id, provider, &result) {
            return Err(EngineError::InvalidRequest(format!(
                "{provider} holds no open attempt on job {job_id}"
            )));
        }

        let submitted = self
            .submit_intent(
                job_id,
                TxPayload::SubmitResult {
                    job: job_id.clone(),
                    provider: provider.clone(),
                    result_ref: result,
                },
                JobStatus::ResultSubmitted,
            )
            .await;
        if submitted.is_err() {
            self.lock_monitor().discard_result(job_id);
        }
        submitted
    }

    /// Owner cancellation. Refused once a result exists; after assignment
    /// the configured penalty goes to the provider.
    pub async fn cancel_job(&self, job_id: &JobId) -> EngineResult<TxId> {
        let control = self.control(job_id);
        let _control = control.lock().await;
        self.ensure_not_halted(job_id)?;
        let job = self.job(job_id).ok_or_else(|| EngineError::JobNotFound(job_id.clone()))?;

        if !job.status.is_cancellable() {
            return Err(EngineError::CancellationRefused {
                job: job_id.clone(),
                status: job.status,
            });
        }
        let penalty = if job.status.has_provider() {
            self.config.cancellation.penalty_for(job.locked_amount())
        } else {
            0
        };
        info!(job = %job_id.short(), status = %job.status, penalty, "Cancelling job");
        self.submit_intent(
            job_id,
            TxPayload::CancelJob {
                job: job_id.clone(),
                penalty,
            },
            JobStatus::Cancelled,
        )
        .await
    }

    /// Arbitration outcome for a disputed job: pay the provider or refund
    /// the owner.
    pub async fn resolve_dispute(
        &self,
        job_id: &JobId,
        in_favor_of_provider: bool,
    ) -> EngineResult<TxId> {
        let control = self.control(job_id);
        let _control = control.lock().await;
        self.ensure_not_halted(job_id)?;
        let job = self.job(job_id).ok_or_else(|| EngineError::JobNotFound(job_id.clone()))?;

        if job.status != JobStatus::Disputed {
            return Err(EngineError::InvalidTransition {
                job: job_id.clone(),
                from: job.status.to_string(),
                event: "DisputeResolved".to_string(),
            });
        }
        let target = if in_favor_of_provider {
            JobStatus::Settled
        } else {
            JobStatus::Failed
        };
        info!(job = %job_id.short(), in_favor_of_provider, "Resolving dispute");
        self.submit_intent(
            job_id,
            TxPayload::ResolveDispute {
                job: job_id.clone(),
                in_favor_of_provider,
            },
            target,
        )
        .await
    }

    /// Apply one confirmed event and react to it.
    ///
    /// Duplicates are ignored. Events for halted jobs are skipped. An
    /// escrow mismatch halts the job.
    pub async fn handle_event(&self, event: &LedgerEvent) -> EngineResult<()> {
        let control = self.control(&event.job);
        let mut control = control.lock().await;

        if self.halted.contains_key(&event.job) {
            debug!(job = %event.job.short(), event = %event.id, "Job halted, event skipped");
            return Ok(());
        }

        let applied = self.registry_mut().apply(event);
        let status = match applied {
            Ok(Applied::Duplicate) => return Ok(()),
            Ok(Applied::Transitioned(status)) => status,
            Err(err @ EngineError::EscrowMismatch { .. }) => {
                self.halt(&event.job, &err);
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        self.append_to_log(event);
        self.clear_pending(&event.job, &event.tx, status);
        info!(
            job = %event.job.short(),
            event = event.kind.name(),
            status = %status,
            height = event.height,
            "Job advanced"
        );

        let job = self
            .job(&event.job)
            .ok_or_else(|| EngineError::JobNotFound(event.job.clone()))?;
        self.react(&mut control, &job, event).await
    }

    /// Drain finalized events until the subscription is caught up.
    pub async fn pump(&self) -> EngineResult<usize> {
        let mut handled = 0;
        loop {
            let batch = {
                let mut subscription = self.subscription.lock().await;
                subscription.next_batch(self.ledger.as_ref()).await?
            };
            if batch.is_empty() {
                return Ok(handled);
            }
            for event in &batch {
                if let Err(err) = self.handle_event(event).await {
                    self.report(&event.job, &err);
                }
                handled += 1;
            }
        }
    }

    /// Checkpoint: execution timeouts, matching retries, deadline expiry
    /// and any reaction that has to be retried.
    pub async fn tick(&self) -> EngineResult<()> {
        let now = self.clock.now();
        let signals = self.lock_monitor().check_timeouts(now);
        for signal in signals {
            if let Err(err) = self.on_reassignment(&signal).await {
                self.report(&signal.job, &err);
            }
        }

        let open: Vec<JobId> = self
            .registry()
            .jobs()
            .into_iter()
            .filter(|job| !job.is_terminal())
            .map(|job| job.id.clone())
            .collect();
        for id in open {
            if let Err(err) = self.checkpoint(&id, now).await {
                self.report(&id, &err);
            }
        }
        Ok(())
    }

    /// Last confirmed state plus whatever is in flight.
    pub fn status(&self, job_id: &JobId) -> EngineResult<JobView> {
        let job = self
            .job(job_id)
            .ok_or_else(|| EngineError::JobNotFound(job_id.clone()))?;
        Ok(self.view(job))
    }

    pub fn jobs(&self) -> Vec<JobView> {
        let jobs: Vec<Job> = self.registry().jobs().into_iter().cloned().collect();
        jobs.into_iter().map(|job| self.view(job)).collect()
    }

    pub fn audit(&self, job_id: &JobId) -> EngineResult<AuditRecord> {
        self.job(job_id)
            .map(|job| AuditRecord::from_job(&job))
            .ok_or_else(|| EngineError::JobNotFound(job_id.clone()))
    }

    pub fn execution_records(&self, job_id: &JobId) -> Vec<ExecutionRecord> {
        self.lock_monitor().records(job_id).to_vec()
    }

    /// Rebuild the projection from the event log, reconcile the cached
    /// projection, resume the subscription and re-arm open jobs.
    pub async fn recover(&self) -> EngineResult<RecoveryReport> {
        let storage = &self.config.storage;
        let events = EventLog::load(&storage.event_log)?;
        let rebuilt = JobRegistry::rebuild(&events);
        let cache = self.reconcile_cache(&events, &rebuilt);
        let resume_from = EventLog::last_height(&events).max(1);

        *self.registry_mut() = rebuilt;
        *self.subscription.lock().await = subscription_from(&self.config, resume_from);
        *self.lock_log() = Some(EventLog::open(&storage.event_log)?);

        let mut excluded: HashMap<JobId, Vec<Address>> = HashMap::new();
        for event in &events {
            if let EventKind::AssignmentRevoked { provider, .. } = &event.kind {
                excluded.entry(event.job.clone()).or_default().push(provider.clone());
            }
        }

        let open: Vec<Job> = self
            .registry()
            .jobs()
            .into_iter()
            .filter(|job| !job.is_terminal())
            .cloned()
            .collect();
        let now = self.clock.now();
        for job in &open {
            let control = self.control(&job.id);
            let mut control = control.lock().await;
            control
                .excluded
                .extend(excluded.remove(&job.id).unwrap_or_default());
            let mut monitor = self.lock_monitor();
            match (&job.provider, job.status.has_provider()) {
                (Some(provider), true) => {
                    monitor.begin_attempt(&job.id, provider, job.attempt, job.spec.deadline, now)
                }
                _ => monitor.restore_attempts(&job.id, job.attempt),
            }
        }

        self.save_projection()?;
        let report = RecoveryReport {
            events: events.len(),
            jobs: self.registry().jobs().len(),
            active: open.len(),
            resume_from,
            cache,
        };
        info!(
            events = report.events,
            jobs = report.jobs,
            active = report.active,
            resume_from,
            cache = ?report.cache,
            "Recovered from event log"
        );
        Ok(report)
    }

    /// Write the projection cache, if one is configured.
    pub fn save_projection(&self) -> EngineResult<()> {
        if let Some(path) = &self.config.storage.projection_cache {
            let snapshot = self.registry().snapshot();
            snapshot.save(path)?;
        }
        Ok(())
    }

    /// Run until `shutdown` flips to true: one ingestion loop feeding
    /// per-job ordered queues, one worker per job, one ticker.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> EngineResult<()> {
        let subscription = self.subscription.lock().await.clone();
        let mut events = Box::pin(subscription.into_stream(self.ledger.clone()));
        let mut queues: HashMap<JobId, mpsc::UnboundedSender<LedgerEvent>> = HashMap::new();
        let mut workers = JoinSet::new();

        let ticker = {
            let orchestrator = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(orchestrator.config.timeouts.tick_interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = interval.tick() => {
                            if let Err(err) = orchestrator.tick().await {
                                warn!(error = %err, "Checkpoint failed");
                            }
                        }
                    }
                }
            })
        };

        info!(account = %self.config.chain.account, endpoint = %self.config.chain.endpoint, "Orchestrator running");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = events.next() => match next {
                    Some(Ok(event)) => self.route(&mut queues, &mut workers, event),
                    Some(Err(err)) => {
                        let err = EngineError::from(err);
                        warn!(error = %err, "Event subscription error");
                    }
                    None => break,
                },
            }
            while workers.try_join_next().is_some() {}
        }

        drop(queues);
        while workers.join_next().await.is_some() {}
        if let Err(err) = ticker.await {
            warn!(error = %err, "Ticker task ended abnormally");
        }
        self.save_projection()?;
        info!("Orchestrator stopped");
        Ok(())
    }

    /// Deliver `event` to its job's queue, spawning the worker on first use.
    fn route(
        self: &Arc<Self>,
        queues: &mut HashMap<JobId, mpsc::UnboundedSender<LedgerEvent>>,
        workers: &mut JoinSet<()>,
        event: LedgerEvent,
    ) {
        let job = event.job.clone();
        let sender = queues.entry(job.clone()).or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<LedgerEvent>();
            let orchestrator = self.clone();
            let job = job.clone();
            workers.spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(err) = orchestrator.handle_event(&event).await {
                        orchestrator.report(&event.job, &err);
                    }
                    if orchestrator.job(&job).is_some_and(|j| j.is_terminal()) {
                        debug!(job = %job.short(), "Worker finished");
                        break;
                    }
                }
            });
            tx
        });
        if sender.send(event).is_err() {
            // Worker exited after a terminal event; later events are stale.
            queues.remove(&job);
        }
    }

    fn view(&self, job: Job) -> JobView {
        let pending = self.pending.get(&job.id).map(|p| p.value().clone());
        let halted = self.halted.get(&job.id).map(|r| r.value().clone());
        JobView {
            job,
            pending,
            halted,
        }
    }

    fn job(&self, id: &JobId) -> Option<Job> {
        self.registry().query(id).cloned()
    }

    fn control(&self, id: &JobId) -> Arc<AsyncMutex<JobControl>> {
        self.controls.entry(id.clone()).or_default().clone()
    }

    fn ensure_not_halted(&self, id: &JobId) -> EngineResult<()> {
        match self.halted.get(id).map(|r| r.value().clone()) {
            Some(reason) => Err(EngineError::JobHalted {
                job: id.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    fn halt(&self, id: &JobId, err: &EngineError) {
        error!(job = %id.short(), error = %err, "Halting job, operator attention required");
        self.halted.insert(id.clone(), err.to_string());
        self.pending.remove(id);
        self.lock_monitor().close(id);
    }

    fn clear_pending(&self, id: &JobId, tx: &TxId, status: JobStatus) {
        self.pending
            .remove_if(id, |_, p| &p.tx == tx || p.target == status || status.is_terminal());
    }

    fn append_to_log(&self, event: &LedgerEvent) {
        if let Some(log) = self.lock_log().as_mut()
            && let Err(err) = log.append(event)
        {
            error!(event = %event.id, error = %err, "Failed to append to event log");
        }
    }

    fn reconcile_cache(&self, events: &[LedgerEvent], rebuilt: &JobRegistry) -> CacheStatus {
        let Some(path) = &self.config.storage.projection_cache else {
            return CacheStatus::Missing;
        };
        let cached = match RegistrySnapshot::load(path) {
            Ok(Some(cached)) => cached,
            Ok(None) => return CacheStatus::Missing,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Unreadable projection cache, discarding");
                return CacheStatus::Diverged;
            }
        };
        if cached == rebuilt.snapshot() {
            return CacheStatus::Current;
        }
        let prefix: Vec<LedgerEvent> = events
            .iter()
            .filter(|e| e.height <= cached.height)
            .cloned()
            .collect();
        if JobRegistry::rebuild(&prefix).snapshot() == cached {
            debug!(cached_height = cached.height, "Projection cache is behind the log");
            CacheStatus::Stale
        } else {
            warn!(
                path = %path.display(),
                cached_height = cached.height,
                "Projection cache diverges from the event log, discarding"
            );
            CacheStatus::Diverged
        }
    }

    fn report(&self, job: &JobId, err: &EngineError) {
        match err.class() {
            ErrorClass::Fatal => error!(job = %job.short(), class = %err.class(), error = %err, "Job error"),
            ErrorClass::Transient | ErrorClass::Logical => {
                warn!(job = %job.short(), class = %err.class(), error = %err, "Job error")
            }
        }
    }

    fn registry(&self) -> RwLockReadGuard<'_, JobRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, JobRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_monitor(&self) -> MutexGuard<'_, ExecutionMonitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_bids(&self) -> MutexGuard<'_, BidBook> {
        self.bids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_log(&self) -> MutexGuard<'_, Option<EventLog>> {
        self.event_log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn subscription_from(config: &EngineConfig, height: u64) -> EventSubscription {
    EventSubscription::from_height(height, config.chain.finality_depth)
        .with_page_size(config.chain.page_size)
        .with_poll_interval(config.chain.poll_interval())
}
