//! ebloc: job lifecycle orchestration for a ledger-backed compute marketplace.
//!
//! Jobs are escrowed on chain, matched with off-chain providers, watched
//! while they run and settled from verified results. The registry of jobs
//! is a projection of confirmed ledger events and can always be rebuilt
//! from the event log.

pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod matcher;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod settlement;
pub mod state_machine;
pub mod store;
pub mod ui;
pub mod verifier;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, ErrorClass};
pub use orchestrator::{CacheStatus, Orchestrator, RecoveryReport};
pub use registry::JobRegistry;
