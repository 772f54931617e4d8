mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use ebloc::clock::{Clock, ManualClock, SystemClock};
use ebloc::config::ContentStoreConfig;
use ebloc::ids::Address;
use ebloc::ledger::{EventLog, MemoryLedger};
use ebloc::matcher::{Bid, CapabilityAttestation};
use ebloc::state_machine::{JobSpec, JobView, ResourceRequirements};
use ebloc::store::{ContentStore, HttpStore, MemoryStore};
use ebloc::verifier::{self, DigestVerifier, ResultEnvelope};
use ebloc::{EngineConfig, JobRegistry, Orchestrator, ui};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Demo => demo(config).await,
        Command::Status { job_id, log } => status(&config, job_id.as_deref(), log),
        Command::Replay { log, cache } => replay(config, log, cache).await,
    }
}

fn content_store(config: &ContentStoreConfig) -> Result<Arc<dyn ContentStore>> {
    Ok(match config {
        ContentStoreConfig::Memory => Arc::new(MemoryStore::new()),
        ContentStoreConfig::Http { url } => Arc::new(HttpStore::new(url)?),
    })
}

/// One job whose first provider goes silent: the job is reassigned, the
/// second provider delivers, and payment is released to it.
async fn demo(config: EngineConfig) -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let store = content_store(&config.storage.content)?;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let verifier = verifier::from_policy(
        &config.verification.policy,
        store.clone(),
        config.verification.call_timeout(),
    )?;
    let log = EventLog::open(&config.storage.event_log)
        .with_context(|| format!("opening {}", config.storage.event_log.display()))?;
    let orchestrator = Orchestrator::new(
        config.clone(),
        ledger.clone(),
        store.clone(),
        verifier,
        clock.clone(),
    )
    .with_event_log(log);

    let spec = JobSpec {
        owner: Address::from("0xowner"),
        input_ref: store.put(b"render frames 1-240").await?,
        requirements: ResourceRequirements {
            cpu_cores: 4,
            memory_mb: 8192,
            gpu: false,
        },
        deadline: clock.now() + chrono::Duration::minutes(30),
        escrow: 100,
        salt: u64::from(Utc::now().timestamp_subsec_nanos()),
    };
    let job = orchestrator.submit_job(spec.clone()).await?;
    let progress = ui::JobProgress::start(&job, "render job");

    for (provider, price) in [("0xprovider-a", 50), ("0xprovider-b", 60)] {
        orchestrator
            .submit_bid(Bid {
                provider: Address::from(provider),
                job: job.clone(),
                price,
                capabilities: CapabilityAttestation {
                    cpu_cores: 8,
                    memory_mb: 16_384,
                    gpu: false,
                },
                submitted_at: clock.now(),
                expires_at: clock.now() + chrono::Duration::minutes(10),
            })
            .await?;
    }
    orchestrator.pump().await?;
    progress.update(&orchestrator.status(&job)?);

    let silent = assigned(&orchestrator.status(&job)?)?;
    progress.note(&format!("{silent} stops sending heartbeats"));
    clock.advance(config.timeouts.heartbeat_timeout() + chrono::Duration::seconds(1));
    orchestrator.tick().await?;
    orchestrator.pump().await?;

    let provider = assigned(&orchestrator.status(&job)?)?;
    progress.note(&format!("reassigned to {provider}"));
    orchestrator.heartbeat(&job, &provider, Some(50)).await?;
    orchestrator.pump().await?;
    progress.update(&orchestrator.status(&job)?);

    let envelope = ResultEnvelope::seal(&spec, "240 frames rendered").to_bytes()?;
    let result = store.put(&envelope).await?;
    orchestrator.report_result(&job, &provider, result).await?;
    orchestrator.pump().await?;

    let view = orchestrator.status(&job)?;
    progress.complete(&view);
    ui::print_audit(&orchestrator.audit(&job)?);
    info!(
        provider = %provider,
        paid = ledger.paid_to(&provider),
        refunded = ledger.refunded_to(&spec.owner),
        "Demo finished"
    );
    Ok(())
}

fn assigned(view: &JobView) -> Result<Address> {
    view.job
        .provider
        .clone()
        .with_context(|| format!("job {} has no provider ({})", view.job.id.short(), view.label()))
}

fn status(config: &EngineConfig, job_id: Option<&str>, log: Option<PathBuf>) -> Result<()> {
    let path = log.unwrap_or_else(|| config.storage.event_log.clone());
    let events = EventLog::load(&path).with_context(|| format!("reading {}", path.display()))?;
    let registry = JobRegistry::rebuild(&events);
    let views: Vec<JobView> = registry
        .jobs()
        .into_iter()
        .map(|job| JobView {
            job: job.clone(),
            pending: None,
            halted: None,
        })
        .collect();

    match job_id {
        Some(prefix) => {
            let view = views
                .iter()
                .find(|v| v.job.id.as_str().starts_with(prefix))
                .with_context(|| format!("no job matching {prefix} in {}", path.display()))?;
            ui::print_job(view);
            if view.job.is_terminal() {
                ui::print_audit(&ebloc::state_machine::AuditRecord::from_job(&view.job));
            }
        }
        None => ui::print_jobs(&views),
    }
    Ok(())
}

async fn replay(mut config: EngineConfig, log: Option<PathBuf>, cache: Option<PathBuf>) -> Result<()> {
    if let Some(log) = log {
        config.storage.event_log = log;
    }
    if let Some(cache) = cache {
        config.storage.projection_cache = Some(cache);
    }
    if config.storage.projection_cache.is_none() {
        config.storage.projection_cache = Some(config.storage.event_log.with_extension("projection.json"));
    }

    // Offline: nothing is submitted, the ledger only backs the type.
    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(MemoryLedger::manual()),
        store.clone(),
        Arc::new(DigestVerifier::new(store)),
        Arc::new(SystemClock),
    );
    let report = orchestrator.recover().await?;
    ui::print_recovery(&report);
    ui::print_jobs(&orchestrator.jobs());
    Ok(())
}
