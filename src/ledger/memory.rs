//! In-process chain with an escrow contract, used by tests and the demo.
//!
//! Blocks are mined on demand (or automatically on every broadcast), and
//! faults can be scripted: unavailability, dropped broadcasts, stalled
//! broadcasts and reorganizations.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    Confirmation, DropReason, EventKind, LedgerClient, LedgerError, LedgerEvent, LedgerResult,
    Transaction, TxPayload,
};
use crate::ids::{Address, EventId, JobId, TxId};
use crate::state_machine::JobSpec;

/// A broadcast seen by the ledger, kept for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTx {
    pub tx: TxId,
    pub job: JobId,
    pub payload: TxPayload,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TxStatus {
    Pending,
    Mined(u64),
    Dropped(DropReason),
}

#[derive(Debug, Clone)]
struct Block {
    height: u64,
    txs: Vec<(TxId, Transaction)>,
    events: Vec<LedgerEvent>,
}

#[derive(Debug, Clone)]
struct EscrowEntry {
    spec: JobSpec,
    locked: u64,
    provider: Option<Address>,
    closed: bool,
}

/// Money rules enforced on chain: one lock per job, one disbursement per job.
#[derive(Debug, Clone, Default)]
struct EscrowContract {
    entries: HashMap<JobId, EscrowEntry>,
    paid: HashMap<Address, u64>,
    refunded: HashMap<Address, u64>,
}

impl EscrowContract {
    fn open_entry(&mut self, job: &JobId) -> Result<&mut EscrowEntry, String> {
        let entry = self
            .entries
            .get_mut(job)
            .ok_or_else(|| format!("unknown job {job}"))?;
        if entry.closed {
            return Err(format!("job {job} already closed"));
        }
        Ok(entry)
    }

    fn execute(&mut self, payload: &TxPayload) -> Result<EventKind, String> {
        match payload {
            TxPayload::CreateJob { spec } => {
                let job = spec.id();
                if self.entries.contains_key(&job) {
                    return Err(format!("job {job} already exists"));
                }
                self.entries.insert(
                    job,
                    EscrowEntry {
                        spec: spec.clone(),
                        locked: 0,
                        provider: None,
                        closed: false,
                    },
                );
                Ok(EventKind::JobCreated { spec: spec.clone() })
            }
            TxPayload::LockEscrow { job, amount } => {
                let entry = self.open_entry(job)?;
                if entry.locked > 0 {
                    return Err("escrow already locked".to_string());
                }
                if *amount != entry.spec.escrow {
                    return Err(format!(
                        "lock of {amount} differs from escrow {}",
                        entry.spec.escrow
                    ));
                }
                entry.locked = *amount;
                Ok(EventKind::EscrowLocked { amount: *amount })
            }
            TxPayload::AssignProvider {
                job,
                provider,
                price,
                attempt,
            } => {
                let entry = self.open_entry(job)?;
                if entry.locked == 0 {
                    return Err("escrow not locked".to_string());
                }
                if entry.provider.is_some() {
                    return Err("job already assigned".to_string());
                }
                entry.provider = Some(provider.clone());
                Ok(EventKind::ProviderAssigned {
                    provider: provider.clone(),
                    price: *price,
                    attempt: *attempt,
                })
            }
            TxPayload::RevokeAssignment {
                job,
                provider,
                reason,
            } => {
                let entry = self.open_entry(job)?;
                if entry.provider.as_ref() != Some(provider) {
                    return Err("provider not assigned".to_string());
                }
                entry.provider = None;
                Ok(EventKind::AssignmentRevoked {
                    provider: provider.clone(),
                    reason: *reason,
                })
            }
            TxPayload::MarkExecuting { job, provider } => {
                ensure_assigned(self.open_entry(job)?, provider)?;
                Ok(EventKind::ExecutionStarted {
                    provider: provider.clone(),
                })
            }
            TxPayload::SubmitResult {
                job,
                provider,
                result_ref,
            } => {
                ensure_assigned(self.open_entry(job)?, provider)?;
                Ok(EventKind::ResultSubmitted {
                    provider: provider.clone(),
                    result_ref: result_ref.clone(),
                })
            }
            TxPayload::RecordVerification {
                job,
                provider,
                evidence_ref,
            } => {
                ensure_assigned(self.open_entry(job)?, provider)?;
                Ok(EventKind::ResultVerified {
                    provider: provider.clone(),
                    evidence_ref: evidence_ref.clone(),
                })
            }
            TxPayload::RaiseDispute {
                job,
                reason,
                evidence_ref,
            } => {
                self.open_entry(job)?;
                Ok(EventKind::DisputeRaised {
                    reason: reason.clone(),
                    evidence_ref: evidence_ref.clone(),
                })
            }
            TxPayload::ReleasePayment { job, provider } => {
                let entry = self.open_entry(job)?;
                ensure_assigned(entry, provider)?;
                let amount = entry.locked;
                entry.closed = true;
                *self.paid.entry(provider.clone()).or_default() += amount;
                Ok(EventKind::PaymentReleased {
                    provider: provider.clone(),
                    amount,
                })
            }
            TxPayload::ResolveDispute {
                job,
                in_favor_of_provider,
            } => {
                let entry = self.open_entry(job)?;
                if *in_favor_of_provider && entry.provider.is_none() {
                    return Err("no provider to pay".to_string());
                }
                let amount = entry.locked;
                entry.closed = true;
                let (owner, provider) = (entry.spec.owner.clone(), entry.provider.clone());
                match provider.filter(|_| *in_favor_of_provider) {
                    Some(provider) => *self.paid.entry(provider).or_default() += amount,
                    None => *self.refunded.entry(owner).or_default() += amount,
                }
                Ok(EventKind::DisputeResolved {
                    in_favor_of_provider: *in_favor_of_provider,
                    amount,
                })
            }
            TxPayload::CancelJob { job, penalty } => {
                let entry = self.open_entry(job)?;
                if *penalty > entry.locked {
                    return Err(format!("penalty {penalty} exceeds escrow {}", entry.locked));
                }
                if *penalty > 0 && entry.provider.is_none() {
                    return Err("penalty without provider".to_string());
                }
                let refund = entry.locked - penalty;
                let provider = entry.provider.clone();
                let owner = entry.spec.owner.clone();
                entry.closed = true;
                if let Some(p) = provider.clone().filter(|_| *penalty > 0) {
                    *self.paid.entry(p).or_default() += penalty;
                }
                *self.refunded.entry(owner).or_default() += refund;
                Ok(EventKind::JobCancelled {
                    refund,
                    penalty: *penalty,
                    provider: provider.filter(|_| *penalty > 0),
                })
            }
            TxPayload::FailJob { job, reason } => {
                let refund = self.refund_all(job)?;
                Ok(EventKind::JobFailed {
                    reason: reason.clone(),
                    refund,
                })
            }
            TxPayload::ExpireJob { job } => {
                let refund = self.refund_all(job)?;
                Ok(EventKind::JobExpired { refund })
            }
        }
    }

    fn refund_all(&mut self, job: &JobId) -> Result<u64, String> {
        let entry = self.open_entry(job)?;
        let refund = entry.locked;
        let owner = entry.spec.owner.clone();
        entry.closed = true;
        *self.refunded.entry(owner).or_default() += refund;
        Ok(refund)
    }
}

fn ensure_assigned(entry: &EscrowEntry, provider: &Address) -> Result<(), String> {
    if entry.provider.as_ref() != Some(provider) {
        return Err(format!("{provider} is not the assigned provider"));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct ChainState {
    blocks: Vec<Block>,
    mempool: Vec<(TxId, Transaction)>,
    stalled: HashSet<TxId>,
    statuses: HashMap<TxId, TxStatus>,
    contract: EscrowContract,
    submitted: Vec<SubmittedTx>,
    drop_next: u32,
    stall_next: u32,
    unavailable: bool,
}

impl ChainState {
    fn head(&self) -> u64 {
        self.blocks.last().map(|b| b.height).unwrap_or(0)
    }

    fn mine(&mut self) -> u64 {
        let height = self.head() + 1;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.mempool)
            .into_iter()
            .partition(|(id, _)| !self.stalled.contains(id));
        self.mempool = waiting;

        let mut block = Block {
            height,
            txs: Vec::new(),
            events: Vec::new(),
        };
        for (id, tx) in ready {
            match self.contract.execute(&tx.payload) {
                Ok(kind) => {
                    block.events.push(LedgerEvent {
                        id: EventId::new(&id, 0),
                        job: tx.payload.job(),
                        height,
                        tx: id.clone(),
                        kind,
                    });
                    self.statuses.insert(id.clone(), TxStatus::Mined(height));
                    block.txs.push((id, tx));
                }
                Err(reason) => {
                    self.statuses
                        .insert(id, TxStatus::Dropped(DropReason::Reverted(reason)));
                }
            }
        }
        self.blocks.push(block);
        height
    }

    /// Rebuild contract state from the surviving blocks.
    fn replay_contract(&mut self) {
        let mut contract = EscrowContract::default();
        for block in &self.blocks {
            for (_, tx) in &block.txs {
                let _ = contract.execute(&tx.payload);
            }
        }
        self.contract = contract;
    }
}

/// In-memory ledger implementing [`LedgerClient`].
#[derive(Debug)]
pub struct MemoryLedger {
    state: Mutex<ChainState>,
    auto_mine: bool,
    poll_interval: Duration,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    /// A ledger that mines a block for every broadcast and keeps mining
    /// empty blocks while someone waits for depth.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState::default()),
            auto_mine: true,
            poll_interval: Duration::from_millis(2),
        }
    }

    /// A ledger that only advances when [`MemoryLedger::mine_block`] is called.
    pub fn manual() -> Self {
        Self {
            auto_mine: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, ChainState>> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Unavailable("ledger state poisoned".to_string()))
    }

    fn lock_live(&self) -> LedgerResult<MutexGuard<'_, ChainState>> {
        let state = self.lock()?;
        if state.unavailable {
            return Err(LedgerError::Unavailable("node not responding".to_string()));
        }
        Ok(state)
    }

    pub fn mine_block(&self) -> LedgerResult<u64> {
        Ok(self.lock()?.mine())
    }

    pub fn mine_blocks(&self, count: u64) -> LedgerResult<u64> {
        let mut state = self.lock()?;
        let mut head = state.head();
        for _ in 0..count {
            head = state.mine();
        }
        Ok(head)
    }

    /// Orphan the last `depth` blocks. Their transactions are dropped and
    /// contract state is recomputed from what remains.
    pub fn reorg(&self, depth: u64) -> LedgerResult<Vec<TxId>> {
        let mut state = self.lock()?;
        let keep = state.blocks.len().saturating_sub(depth as usize);
        let orphaned: Vec<Block> = state.blocks.split_off(keep);
        let mut dropped = Vec::new();
        for block in orphaned {
            for (id, _) in block.txs {
                state
                    .statuses
                    .insert(id.clone(), TxStatus::Dropped(DropReason::Orphaned));
                dropped.push(id);
            }
        }
        state.replay_contract();
        Ok(dropped)
    }

    /// The next `count` broadcasts are accepted but silently discarded.
    pub fn drop_next(&self, count: u32) -> LedgerResult<()> {
        self.lock()?.drop_next = count;
        Ok(())
    }

    /// The next `count` broadcasts sit in the mempool until replaced.
    pub fn stall_next(&self, count: u32) -> LedgerResult<()> {
        self.lock()?.stall_next = count;
        Ok(())
    }

    pub fn set_unavailable(&self, unavailable: bool) -> LedgerResult<()> {
        self.lock()?.unavailable = unavailable;
        Ok(())
    }

    /// Append an event no contract call produced, in a fresh block.
    pub fn inject_event(&self, job: JobId, kind: EventKind) -> LedgerResult<LedgerEvent> {
        let mut state = self.lock()?;
        let height = state.head() + 1;
        let tx = TxId::from(format!("0xinjected{}", Uuid::new_v4().simple()));
        let event = LedgerEvent {
            id: EventId::new(&tx, 0),
            job,
            height,
            tx,
            kind,
        };
        state.blocks.push(Block {
            height,
            txs: Vec::new(),
            events: vec![event.clone()],
        });
        Ok(event)
    }

    pub fn submitted(&self) -> Vec<SubmittedTx> {
        self.lock().map(|s| s.submitted.clone()).unwrap_or_default()
    }

    pub fn submitted_count(&self) -> usize {
        self.lock().map(|s| s.submitted.len()).unwrap_or_default()
    }

    /// Total the contract has paid out to `address`.
    pub fn paid_to(&self, address: &Address) -> u64 {
        self.lock()
            .map(|s| s.contract.paid.get(address).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total the contract has refunded to `address`.
    pub fn refunded_to(&self, address: &Address) -> u64 {
        self.lock()
            .map(|s| s.contract.refunded.get(address).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn escrow_locked(&self, job: &JobId) -> u64 {
        self.lock()
            .ok()
            .and_then(|s| s.contract.entries.get(job).map(|e| e.locked))
            .unwrap_or(0)
    }

    /// Poll once; `None` means keep waiting.
    fn poll_confirmation(&self, tx: &TxId, min_depth: u64) -> LedgerResult<Option<Confirmation>> {
        let mut state = self.lock_live()?;
        let status = state
            .statuses
            .get(tx)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownTransaction(tx.clone()))?;
        match status {
            TxStatus::Dropped(reason) => Ok(Some(Confirmation::Dropped(reason))),
            TxStatus::Mined(height) => {
                let depth = state.head() - height + 1;
                if depth >= min_depth {
                    return Ok(Some(Confirmation::Confirmed { height, depth }));
                }
                if self.auto_mine {
                    state.mine();
                }
                Ok(None)
            }
            TxStatus::Pending => {
                if self.auto_mine && !state.stalled.contains(tx) {
                    state.mine();
                }
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn submit_transaction(&self, tx: Transaction) -> LedgerResult<TxId> {
        let mut state = self.lock_live()?;
        let id = TxId::from(format!("0x{}", Uuid::new_v4().simple()));

        state.submitted.push(SubmittedTx {
            tx: id.clone(),
            job: tx.payload.job(),
            payload: tx.payload.clone(),
            nonce: tx.nonce,
        });

        if let Some(previous) = &tx.replaces {
            let before = state.mempool.len();
            state.mempool.retain(|(pending, _)| pending != previous);
            if state.mempool.len() < before {
                state
                    .statuses
                    .insert(previous.clone(), TxStatus::Dropped(DropReason::Replaced));
            }
        }

        if state.drop_next > 0 {
            state.drop_next -= 1;
            state
                .statuses
                .insert(id.clone(), TxStatus::Dropped(DropReason::Orphaned));
            return Ok(id);
        }

        if state.stall_next > 0 {
            state.stall_next -= 1;
            state.stalled.insert(id.clone());
        }

        state.statuses.insert(id.clone(), TxStatus::Pending);
        state.mempool.push((id.clone(), tx));
        if self.auto_mine {
            state.mine();
        }
        Ok(id)
    }

    async fn await_confirmation(
        &self,
        tx: &TxId,
        min_depth: u64,
        timeout: Duration,
    ) -> LedgerResult<Confirmation> {
        let wait = async {
            loop {
                if let Some(confirmation) = self.poll_confirmation(tx, min_depth.max(1))? {
                    return Ok(confirmation);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Ok(Confirmation::Timeout),
        }
    }

    async fn head_height(&self) -> LedgerResult<u64> {
        Ok(self.lock_live()?.head())
    }

    async fn events_in_range(&self, from: u64, to: u64) -> LedgerResult<Vec<LedgerEvent>> {
        let state = self.lock_live()?;
        Ok(state
            .blocks
            .iter()
            .filter(|b| b.height >= from && b.height <= to)
            .flat_map(|b| b.events.iter().cloned())
            .collect())
    }
}
