use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Duration;
use tokio::sync::watch;

use super::*;
use crate::clock::ManualClock;
use crate::ledger::{MemoryLedger, RevocationReason};
use crate::matcher::CapabilityAttestation;
use crate::settlement::tests::ScriptedVerifier;
use crate::state_machine::fixtures::{epoch, spec};
use crate::store::MemoryStore;
use crate::verifier::{DigestVerifier, ResultEnvelope, Verdict};

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.chain.finality_depth = 2;
    config.chain.confirmation_timeout_ms = 200;
    config.chain.max_resubmissions = 2;
    config.chain.poll_interval_ms = 5;
    config.timeouts.heartbeat_timeout_ms = 3_000;
    config.timeouts.execution_deadline_ms = 8_000;
    config.timeouts.tick_interval_ms = 20;
    config.retry.max_assignment_attempts = 3;
    config.retry.max_matching_attempts = 5;
    config.retry.matching_base_delay_ms = 100;
    config.retry.chain_base_delay_ms = 1;
    config.retry.max_delay_ms = 1_000;
    config.verification.max_retries = 3;
    config.verification.base_delay_ms = 1;
    config.verification.call_timeout_ms = 500;
    config
}

struct Harness {
    ledger: Arc<MemoryLedger>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::build(config(), None)
    }

    fn build(config: EngineConfig, verifier: Option<Arc<dyn Verifier>>) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(epoch()));
        let verifier: Arc<dyn Verifier> = match verifier {
            Some(verifier) => verifier,
            None => Arc::new(DigestVerifier::new(store.clone())),
        };
        let orchestrator =
            Orchestrator::new(config, ledger.clone(), store.clone(), verifier, clock.clone());
        Self {
            ledger,
            store,
            clock,
            orchestrator,
        }
    }

    /// Another orchestrator process sharing this chain, store and clock.
    fn restart(&self, config: EngineConfig) -> Orchestrator {
        Orchestrator::new(
            config,
            self.ledger.clone(),
            self.store.clone(),
            Arc::new(DigestVerifier::new(self.store.clone())),
            self.clock.clone(),
        )
    }

    async fn bid(&self, job: &JobId, provider: &str, price: u64) {
        self.orchestrator
            .submit_bid(bid(job, provider, price))
            .await
            .unwrap();
    }

    fn status(&self, job: &JobId) -> JobStatus {
        self.orchestrator.status(job).unwrap().job.status
    }

    async fn sealed_result(&self, spec: &JobSpec) -> ContentRef {
        let envelope = ResultEnvelope::seal(spec, "42").to_bytes().unwrap();
        self.store.put(&envelope).await.unwrap()
    }

    /// Submit, match `provider` and start execution.
    async fn executing(&self, spec: &JobSpec, provider: &Address) -> JobId {
        let job = self.orchestrator.submit_job(spec.clone()).await.unwrap();
        self.bid(&job, provider.as_str(), 50).await;
        self.orchestrator.pump().await.unwrap();
        assert_eq!(self.status(&job), JobStatus::Assigned);
        assert_eq!(
            self.orchestrator
                .heartbeat(&job, provider, Some(0))
                .await
                .unwrap(),
            HeartbeatOutcome::FirstHeartbeat
        );
        self.orchestrator.pump().await.unwrap();
        assert_eq!(self.status(&job), JobStatus::Executing);
        job
    }

    fn calls(&self, name: &str) -> usize {
        self.ledger
            .submitted()
            .iter()
            .filter(|tx| tx.payload.name() == name)
            .count()
    }
}

fn bid(job: &JobId, provider: &str, price: u64) -> Bid {
    Bid {
        provider: Address::from(provider),
        job: job.clone(),
        price,
        capabilities: CapabilityAttestation {
            cpu_cores: 8,
            memory_mb: 16_384,
            gpu: false,
        },
        submitted_at: epoch(),
        expires_at: epoch() + Duration::seconds(120),
    }
}

fn owner() -> Address {
    Address::from("0xowner")
}

#[tokio::test]
async fn silent_provider_is_replaced_and_second_one_is_paid() {
    let h = Harness::new();
    let s = spec(100);
    let p1 = Address::from("0xp1");
    let p2 = Address::from("0xp2");

    let job = h.orchestrator.submit_job(s.clone()).await.unwrap();
    h.bid(&job, "0xp1", 50).await;
    h.bid(&job, "0xp2", 60).await;
    h.orchestrator.pump().await.unwrap();
    let view = h.orchestrator.status(&job).unwrap();
    assert_eq!(view.job.status, JobStatus::Assigned);
    assert_eq!(view.job.provider, Some(p1.clone()));

    // P1 never reports.
    h.clock.advance(Duration::seconds(4));
    h.orchestrator.tick().await.unwrap();
    h.orchestrator.pump().await.unwrap();
    let view = h.orchestrator.status(&job).unwrap();
    assert_eq!(view.job.status, JobStatus::Assigned);
    assert_eq!(view.job.provider, Some(p2.clone()));
    assert_eq!(view.job.attempt, 2);

    h.orchestrator.heartbeat(&job, &p2, Some(20)).await.unwrap();
    h.orchestrator.pump().await.unwrap();
    let result = h.sealed_result(&s).await;
    h.orchestrator.report_result(&job, &p2, result).await.unwrap();
    h.orchestrator.pump().await.unwrap();

    assert_eq!(h.status(&job), JobStatus::Settled);
    assert_eq!(h.ledger.paid_to(&p2), 100);
    assert_eq!(h.ledger.paid_to(&p1), 0);
    assert_eq!(h.calls("ReleasePayment"), 1);

    let audit = h.orchestrator.audit(&job).unwrap();
    assert_eq!(audit.attempts, 2);
    assert_eq!(audit.paid, 100);
    assert_eq!(
        audit.state_transitions,
        vec![
            JobStatus::Submitted,
            JobStatus::Escrowed,
            JobStatus::Assigned,
            JobStatus::Escrowed,
            JobStatus::Assigned,
            JobStatus::Executing,
            JobStatus::ResultSubmitted,
            JobStatus::Verified,
            JobStatus::Settled,
        ]
    );

    let records = h.orchestrator.execution_records(&job);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].timed_out, Some(RevocationReason::HeartbeatTimeout));
    assert_eq!(records[1].verdict, Some(Verdict::Accept));
}

#[tokio::test]
async fn overpriced_bid_never_matches() {
    let h = Harness::new();
    let job = h.orchestrator.submit_job(spec(100)).await.unwrap();
    h.bid(&job, "0xgreedy", 150).await;
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Escrowed);

    let before = h.ledger.submitted_count();
    for _ in 0..3 {
        h.clock.advance(Duration::seconds(1));
        h.orchestrator.tick().await.unwrap();
        h.orchestrator.pump().await.unwrap();
    }
    assert_eq!(h.status(&job), JobStatus::Escrowed);
    assert_eq!(h.ledger.submitted_count(), before);
}

#[tokio::test]
async fn matching_gives_up_after_bounded_rounds() {
    let h = Harness::new();
    let mut s = spec(100);
    s.deadline = epoch() + Duration::minutes(10);
    let job = h.orchestrator.submit_job(s).await.unwrap();
    h.orchestrator.pump().await.unwrap();

    for _ in 0..5 {
        h.clock.advance(Duration::seconds(2));
        h.orchestrator.tick().await.unwrap();
        h.orchestrator.pump().await.unwrap();
    }
    assert_eq!(h.status(&job), JobStatus::Failed);
    assert_eq!(h.ledger.refunded_to(&owner()), 100);
}

#[tokio::test]
async fn inconclusive_twice_then_reject_disputes() {
    let verifier = Arc::new(ScriptedVerifier::new(vec![
        Verdict::Inconclusive("verifier busy".into()),
        Verdict::Inconclusive("verifier busy".into()),
        Verdict::Reject("output mismatch".into()),
    ]));
    let h = Harness::build(config(), Some(verifier.clone() as Arc<dyn Verifier>));
    let s = spec(100);
    let p1 = Address::from("0xp1");
    let job = h.executing(&s, &p1).await;

    h.orchestrator
        .report_result(&job, &p1, ContentRef::of(b"garbage"))
        .await
        .unwrap();
    h.orchestrator.pump().await.unwrap();

    assert_eq!(h.status(&job), JobStatus::Disputed);
    assert!(h.orchestrator.status(&job).unwrap().job.disputed);
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.calls("ReleasePayment"), 0);
    assert_eq!(h.ledger.paid_to(&p1), 0);

    // Arbitration sides with the owner.
    h.orchestrator.resolve_dispute(&job, false).await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Failed);
    assert_eq!(h.ledger.refunded_to(&owner()), 100);
}

#[tokio::test]
async fn duplicate_verification_event_releases_payment_once() {
    let h = Harness::new();
    let s = spec(100);
    let p1 = Address::from("0xp1");
    let job = h.executing(&s, &p1).await;
    let result = h.sealed_result(&s).await;
    h.orchestrator.report_result(&job, &p1, result).await.unwrap();

    // Ingest by hand so the verification event can be delivered twice at once.
    let head = h.ledger.head_height().await.unwrap();
    for event in h.ledger.events_in_range(1, head).await.unwrap() {
        h.orchestrator.handle_event(&event).await.unwrap();
    }
    let head = h.ledger.head_height().await.unwrap();
    let verified = h
        .ledger
        .events_in_range(1, head)
        .await
        .unwrap()
        .into_iter()
        .find(|e| matches!(e.kind, EventKind::ResultVerified { .. }))
        .unwrap();

    let (a, b) = tokio::join!(
        h.orchestrator.handle_event(&verified),
        h.orchestrator.handle_event(&verified)
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(h.calls("ReleasePayment"), 1);

    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Settled);
    assert_eq!(h.calls("ReleasePayment"), 1);
    assert_eq!(h.ledger.paid_to(&p1), 100);
}

#[tokio::test]
async fn repeated_timeouts_fail_the_job_with_refund() {
    let h = Harness::new();
    let mut s = spec(100);
    s.deadline = epoch() + Duration::seconds(60);
    let job = h.orchestrator.submit_job(s).await.unwrap();
    for (provider, price) in [("0xp1", 10), ("0xp2", 20), ("0xp3", 30)] {
        h.bid(&job, provider, price).await;
    }
    h.orchestrator.pump().await.unwrap();

    for _ in 0..3 {
        assert_eq!(h.status(&job), JobStatus::Assigned);
        h.clock.advance(Duration::seconds(4));
        h.orchestrator.tick().await.unwrap();
        h.orchestrator.pump().await.unwrap();
    }

    assert_eq!(h.status(&job), JobStatus::Failed);
    assert_eq!(h.ledger.refunded_to(&owner()), 100);
    let audit = h.orchestrator.audit(&job).unwrap();
    assert_eq!(audit.attempts, 3);
    assert_eq!(audit.refunded, 100);
    assert_eq!(h.calls("RevokeAssignment"), 2);
}

#[tokio::test]
async fn cancel_before_assignment_refunds_everything() {
    let h = Harness::new();
    let job = h.orchestrator.submit_job(spec(100)).await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Escrowed);

    h.orchestrator.cancel_job(&job).await.unwrap();
    h.orchestrator.pump().await.unwrap();
    let view = h.orchestrator.status(&job).unwrap();
    assert_eq!(view.job.status, JobStatus::Cancelled);
    assert_eq!(view.job.refund, 100);
    assert!(view.job.payout.is_none());
    assert_eq!(h.ledger.refunded_to(&owner()), 100);
}

#[tokio::test]
async fn cancel_after_assignment_pays_penalty() {
    let h = Harness::new();
    let job = h.orchestrator.submit_job(spec(100)).await.unwrap();
    h.bid(&job, "0xp1", 50).await;
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Assigned);

    h.orchestrator.cancel_job(&job).await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Cancelled);
    assert_eq!(h.ledger.paid_to(&Address::from("0xp1")), 10);
    assert_eq!(h.ledger.refunded_to(&owner()), 90);
}

#[tokio::test]
async fn cancel_refused_once_result_is_in() {
    let verifier: Arc<dyn Verifier> =
        Arc::new(ScriptedVerifier::new(vec![Verdict::Reject("bad".into())]));
    let h = Harness::build(config(), Some(verifier));
    let p1 = Address::from("0xp1");
    let job = h.executing(&spec(100), &p1).await;
    h.orchestrator
        .report_result(&job, &p1, ContentRef::of(b"out"))
        .await
        .unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Disputed);

    let err = h.orchestrator.cancel_job(&job).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::CancellationRefused {
            status: JobStatus::Disputed,
            ..
        }
    ));
    assert_eq!(h.calls("CancelJob"), 0);
}

#[tokio::test]
async fn escrow_mismatch_halts_the_job() {
    let h = Harness::new();
    let job = h.orchestrator.submit_job(spec(100)).await.unwrap();
    h.ledger
        .inject_event(job.clone(), EventKind::EscrowLocked { amount: 90 })
        .unwrap();
    h.orchestrator.pump().await.unwrap();

    let view = h.orchestrator.status(&job).unwrap();
    assert_eq!(view.job.status, JobStatus::Submitted);
    assert!(view.halted.is_some());
    assert_eq!(view.label(), "SUBMITTED (halted)");

    let err = h.orchestrator.cancel_job(&job).await.unwrap_err();
    assert!(matches!(err, EngineError::JobHalted { .. }));
    assert_eq!(err.class(), ErrorClass::Fatal);

    // Checkpoints leave a halted job alone.
    let before = h.ledger.submitted_count();
    h.orchestrator.tick().await.unwrap();
    assert_eq!(h.ledger.submitted_count(), before);
}

#[tokio::test]
async fn stalled_transaction_is_replaced() {
    let mut config = config();
    config.chain.confirmation_timeout_ms = 50;
    let h = Harness::build(config, None);
    h.ledger.stall_next(1).unwrap();

    let job = h.orchestrator.submit_job(spec(100)).await.unwrap();
    let creates: Vec<_> = h
        .ledger
        .submitted()
        .into_iter()
        .filter(|tx| tx.payload.name() == "CreateJob")
        .collect();
    assert_eq!(creates.len(), 2);
    assert_eq!(creates[1].nonce, 1);

    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Escrowed);
    assert_eq!(h.ledger.escrow_locked(&job), 100);
}

#[tokio::test]
async fn dropped_transactions_give_up_after_resubmissions() {
    let h = Harness::new();
    h.ledger.drop_next(3).unwrap();

    let err = h.orchestrator.submit_job(spec(100)).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::TransactionDropped { attempts: 3, .. }
    ));
    assert!(err.is_transient());
    assert!(h.orchestrator.pending.is_empty());
}

#[tokio::test]
async fn unavailable_chain_surfaces_after_backoff() {
    let h = Harness::new();
    h.ledger.set_unavailable(true).unwrap();
    let err = h.orchestrator.submit_job(spec(100)).await.unwrap_err();
    assert!(matches!(err, EngineError::ChainUnavailable(_)));
    assert_eq!(h.ledger.submitted_count(), 0);

    h.ledger.set_unavailable(false).unwrap();
    let job = h.orchestrator.submit_job(spec(100)).await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Escrowed);
}

#[tokio::test]
async fn unmatched_job_expires_at_deadline() {
    let h = Harness::new();
    let job = h.orchestrator.submit_job(spec(100)).await.unwrap();
    h.orchestrator.pump().await.unwrap();

    h.clock.advance(Duration::seconds(11));
    h.orchestrator.tick().await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Expired);
    assert_eq!(h.ledger.refunded_to(&owner()), 100);
}

#[tokio::test]
async fn rejected_requests() {
    let h = Harness::new();
    let err = h.orchestrator.submit_job(spec(0)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let mut late = spec(100);
    late.deadline = epoch() - Duration::seconds(1);
    assert!(h.orchestrator.submit_job(late).await.is_err());

    let job = h.orchestrator.submit_job(spec(100)).await.unwrap();
    h.orchestrator.pump().await.unwrap();
    let err = h.orchestrator.submit_job(spec(100)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let stranger = Address::from("0xstranger");
    let err = h
        .orchestrator
        .report_result(&job, &stranger, ContentRef::of(b"out"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert_eq!(
        h.orchestrator
            .heartbeat(&job, &stranger, None)
            .await
            .unwrap(),
        HeartbeatOutcome::Stale
    );
    assert!(matches!(
        h.orchestrator.status(&JobId::from("missing")),
        Err(EngineError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn pending_transition_is_visible_until_ingested() {
    let h = Harness::new();
    let job = h.orchestrator.submit_job(spec(100)).await.unwrap();
    // Confirmed on chain, not yet ingested.
    assert!(matches!(
        h.orchestrator.status(&job),
        Err(EngineError::JobNotFound(_))
    ));

    h.orchestrator.pump().await.unwrap();
    h.bid(&job, "0xp1", 50).await;
    h.clock.advance(Duration::seconds(1));
    h.orchestrator.tick().await.unwrap();

    let view = h.orchestrator.status(&job).unwrap();
    assert_eq!(view.job.status, JobStatus::Escrowed);
    assert_eq!(view.pending.as_ref().map(|p| p.target), Some(JobStatus::Assigned));
    assert_eq!(view.label(), "ESCROWED -> ASSIGNED (pending)");

    h.orchestrator.pump().await.unwrap();
    let view = h.orchestrator.status(&job).unwrap();
    assert_eq!(view.job.status, JobStatus::Assigned);
    assert!(view.pending.is_none());
}

fn persistent_config(dir: &Path) -> EngineConfig {
    let mut config = config();
    config.storage.event_log = dir.join("events.jsonl");
    config.storage.projection_cache = Some(dir.join("projection.json"));
    config
}

#[tokio::test]
async fn recovery_rebuilds_and_reconciles_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = persistent_config(dir.path());
    let cache = config.storage.projection_cache.clone().unwrap();
    let mut h = Harness::build(config.clone(), None);
    h.orchestrator = h
        .orchestrator
        .with_event_log(EventLog::open(&config.storage.event_log).unwrap());

    let s = spec(100);
    let p1 = Address::from("0xp1");
    let job = h.orchestrator.submit_job(s.clone()).await.unwrap();
    h.bid(&job, "0xp1", 50).await;
    h.orchestrator.pump().await.unwrap();
    h.orchestrator.save_projection().unwrap();
    h.orchestrator.heartbeat(&job, &p1, None).await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Executing);

    // Cache written at ASSIGNED, log went further.
    let second = h.restart(config.clone());
    let report = second.recover().await.unwrap();
    assert_eq!(report.cache, CacheStatus::Stale);
    assert_eq!(report.jobs, 1);
    assert_eq!(report.active, 1);
    assert_eq!(report.events, 4);
    assert_eq!(second.status(&job).unwrap().job.status, JobStatus::Executing);

    let third = h.restart(config.clone());
    assert_eq!(third.recover().await.unwrap().cache, CacheStatus::Current);

    let mut tampered = RegistrySnapshot::load(&cache).unwrap().unwrap();
    if let Some(job) = tampered.jobs.values_mut().next() {
        job.refund = 7;
    }
    tampered.save(&cache).unwrap();

    let fourth = h.restart(config.clone());
    let report = fourth.recover().await.unwrap();
    assert_eq!(report.cache, CacheStatus::Diverged);
    assert_eq!(fourth.status(&job).unwrap().job.refund, 0);

    // The recovered process finishes the job.
    let result = h.sealed_result(&s).await;
    fourth.report_result(&job, &p1, result).await.unwrap();
    fourth.pump().await.unwrap();
    assert_eq!(fourth.status(&job).unwrap().job.status, JobStatus::Settled);
    assert_eq!(h.ledger.paid_to(&p1), 100);

    let events = EventLog::load(&config.storage.event_log).unwrap();
    let rebuilt = JobRegistry::rebuild(&events);
    assert_eq!(rebuilt.query(&job).unwrap().status, JobStatus::Settled);
}

#[tokio::test]
async fn recovery_restores_excluded_providers() {
    let dir = tempfile::tempdir().unwrap();
    let config = persistent_config(dir.path());
    let mut h = Harness::build(config.clone(), None);
    h.orchestrator = h
        .orchestrator
        .with_event_log(EventLog::open(&config.storage.event_log).unwrap());

    let mut s = spec(100);
    s.deadline = epoch() + Duration::seconds(60);
    let job = h.orchestrator.submit_job(s).await.unwrap();
    h.bid(&job, "0xp1", 10).await;
    h.orchestrator.pump().await.unwrap();
    h.clock.advance(Duration::seconds(4));
    h.orchestrator.tick().await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Escrowed);

    let restarted = h.restart(config);
    restarted.recover().await.unwrap();
    // P1 bids again after the restart; it already timed out once.
    restarted.submit_bid(bid(&job, "0xp1", 5)).await.unwrap();
    restarted.submit_bid(bid(&job, "0xp2", 40)).await.unwrap();
    h.clock.advance(Duration::seconds(1));
    restarted.tick().await.unwrap();
    restarted.pump().await.unwrap();

    let view = restarted.status(&job).unwrap();
    assert_eq!(view.job.status, JobStatus::Assigned);
    assert_eq!(view.job.provider, Some(Address::from("0xp2")));
}

#[tokio::test]
async fn run_drives_jobs_until_shutdown() {
    let h = Harness::new();
    let orchestrator = Arc::new(h.orchestrator);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(orchestrator.clone().run(shutdown_rx));

    let job = orchestrator.submit_job(spec(100)).await.unwrap();
    orchestrator.submit_bid(bid(&job, "0xp1", 50)).await.unwrap();

    let assigned = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if let Ok(view) = orchestrator.status(&job)
                && view.job.status == JobStatus::Assigned
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(assigned.is_ok());

    shutdown_tx.send(true).unwrap();
    running.await.unwrap().unwrap();
    assert_eq!(h.ledger.escrow_locked(&job), 100);
}

#[tokio::test]
async fn failed_revocation_is_retried_once_the_chain_returns() {
    let h = Harness::new();
    let mut s = spec(100);
    s.deadline = epoch() + Duration::seconds(60);
    let job = h.orchestrator.submit_job(s).await.unwrap();
    h.bid(&job, "0xp1", 10).await;
    h.bid(&job, "0xp2", 20).await;
    h.orchestrator.pump().await.unwrap();
    assert_eq!(
        h.orchestrator.status(&job).unwrap().job.provider,
        Some(Address::from("0xp1"))
    );

    // The timeout fires while the node is down; the revocation cannot land.
    h.ledger.set_unavailable(true).unwrap();
    h.clock.advance(Duration::seconds(4));
    h.orchestrator.tick().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Assigned);
    assert_eq!(h.calls("RevokeAssignment"), 0);

    h.ledger.set_unavailable(false).unwrap();
    h.orchestrator.tick().await.unwrap();
    h.orchestrator.pump().await.unwrap();

    let view = h.orchestrator.status(&job).unwrap();
    assert_eq!(view.job.status, JobStatus::Assigned);
    assert_eq!(view.job.provider, Some(Address::from("0xp2")));
    assert_eq!(view.job.attempt, 2);
    assert_eq!(h.calls("RevokeAssignment"), 1);
}

#[tokio::test]
async fn stranded_assignment_expires_at_deadline() {
    let h = Harness::new();
    let job = h.orchestrator.submit_job(spec(100)).await.unwrap();
    h.bid(&job, "0xp1", 10).await;
    h.orchestrator.pump().await.unwrap();

    h.ledger.set_unavailable(true).unwrap();
    h.clock.advance(Duration::seconds(4));
    h.orchestrator.tick().await.unwrap();
    h.ledger.set_unavailable(false).unwrap();

    h.clock.advance(Duration::seconds(7));
    h.orchestrator.tick().await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Expired);
    assert_eq!(h.ledger.refunded_to(&owner()), 100);
}

#[tokio::test]
async fn failed_start_is_requested_again_by_next_heartbeat() {
    let h = Harness::new();
    let s = spec(100);
    let p1 = Address::from("0xp1");
    let job = h.orchestrator.submit_job(s.clone()).await.unwrap();
    h.bid(&job, "0xp1", 50).await;
    h.orchestrator.pump().await.unwrap();

    h.ledger.set_unavailable(true).unwrap();
    let err = h
        .orchestrator
        .heartbeat(&job, &p1, Some(10))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ChainUnavailable(_)));
    h.ledger.set_unavailable(false).unwrap();

    assert_eq!(
        h.orchestrator.heartbeat(&job, &p1, Some(20)).await.unwrap(),
        HeartbeatOutcome::Progress
    );
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Executing);

    let result = h.sealed_result(&s).await;
    h.orchestrator.report_result(&job, &p1, result).await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Settled);
    assert_eq!(h.ledger.paid_to(&p1), 100);
}

#[tokio::test]
async fn checkpoint_marks_execution_after_failed_heartbeat() {
    let h = Harness::new();
    let p1 = Address::from("0xp1");
    let job = h.orchestrator.submit_job(spec(100)).await.unwrap();
    h.bid(&job, "0xp1", 50).await;
    h.orchestrator.pump().await.unwrap();

    h.ledger.set_unavailable(true).unwrap();
    assert!(h.orchestrator.heartbeat(&job, &p1, None).await.is_err());
    h.ledger.set_unavailable(false).unwrap();

    h.orchestrator.tick().await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Executing);
    assert_eq!(h.calls("MarkExecuting"), 1);
}

#[tokio::test]
async fn dropped_verification_is_retried_at_checkpoint() {
    let h = Harness::new();
    let s = spec(100);
    let p1 = Address::from("0xp1");
    let job = h.executing(&s, &p1).await;
    let result = h.sealed_result(&s).await;
    h.orchestrator.report_result(&job, &p1, result).await.unwrap();

    h.ledger.drop_next(3).unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::ResultSubmitted);
    assert_eq!(h.calls("RecordVerification"), 3);
    assert!(h.orchestrator.status(&job).unwrap().pending.is_none());

    h.orchestrator.tick().await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Settled);
    assert_eq!(h.calls("RecordVerification"), 4);
    assert_eq!(h.ledger.paid_to(&p1), 100);
}

#[tokio::test]
async fn dropped_payment_release_is_retried_at_checkpoint() {
    let h = Harness::new();
    let s = spec(100);
    let p1 = Address::from("0xp1");
    let job = h.executing(&s, &p1).await;
    let result = h.sealed_result(&s).await;
    h.orchestrator.report_result(&job, &p1, result).await.unwrap();

    // Ingest up to the verification by hand, then lose the release.
    let head = h.ledger.head_height().await.unwrap();
    for event in h.ledger.events_in_range(1, head).await.unwrap() {
        h.orchestrator.handle_event(&event).await.unwrap();
    }
    let head = h.ledger.head_height().await.unwrap();
    let verified = h
        .ledger
        .events_in_range(1, head)
        .await
        .unwrap()
        .into_iter()
        .find(|e| matches!(e.kind, EventKind::ResultVerified { .. }))
        .unwrap();
    h.ledger.drop_next(3).unwrap();
    let err = h.orchestrator.handle_event(&verified).await.unwrap_err();
    assert!(matches!(err, EngineError::TransactionDropped { attempts: 3, .. }));
    assert_eq!(h.status(&job), JobStatus::Verified);
    assert_eq!(h.ledger.paid_to(&p1), 0);

    h.orchestrator.tick().await.unwrap();
    h.orchestrator.pump().await.unwrap();
    assert_eq!(h.status(&job), JobStatus::Settled);
    assert_eq!(h.calls("ReleasePayment"), 4);
    assert_eq!(h.ledger.paid_to(&p1), 100);
}
