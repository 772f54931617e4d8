use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::LedgerEvent;
use crate::error::EngineResult;
use crate::ids::{EventId, JobId};
use crate::state_machine::Job;

/// Append-only JSON-lines file of confirmed events.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: File,
}

impl EventLog {
    /// Open (creating if needed) the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, event: &LedgerEvent) -> EngineResult<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }

    /// Every event in the log, in append order.
    ///
    /// A torn final line (crash mid-write) is skipped.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Vec<LedgerEvent>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let last = lines.len().saturating_sub(1);

        let mut events = Vec::with_capacity(lines.len());
        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) if n == last => {
                    warn!(path = %path.display(), error = %err, "Skipping torn last line of event log");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(events)
    }

    /// Height of the newest logged event, 0 when empty.
    pub fn last_height(events: &[LedgerEvent]) -> u64 {
        events.iter().map(|e| e.height).max().unwrap_or(0)
    }
}

/// Serializable projection, cached so startup can detect divergence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub jobs: BTreeMap<JobId, Job>,
    pub applied: BTreeSet<EventId>,
    pub height: u64,
}

impl RegistrySnapshot {
    pub fn save(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// `None` when no cache exists yet.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::ids::TxId;
    use crate::ledger::EventKind;
    use crate::state_machine::fixtures::spec;

    fn event(height: u64) -> LedgerEvent {
        let s = spec(100);
        let tx = TxId::from(format!("0x{height}"));
        LedgerEvent {
            id: EventId::new(&tx, 0),
            job: s.id(),
            height,
            tx,
            kind: EventKind::EscrowLocked { amount: 100 },
        }
    }

    #[test]
    fn append_then_load_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data/events.jsonl");

        let mut log = EventLog::open(&path).unwrap();
        log.append(&event(1)).unwrap();
        log.append(&event(3)).unwrap();
        drop(log);

        let mut log = EventLog::open(&path).unwrap();
        log.append(&event(4)).unwrap();

        let events = EventLog::load(&path).unwrap();
        let heights: Vec<_> = events.iter().map(|e| e.height).collect();
        assert_eq!(heights, vec![1, 3, 4]);
        assert_eq!(EventLog::last_height(&events), 4);
    }

    #[test]
    fn missing_log_is_empty() {
        let tmp = TempDir::new().unwrap();
        let events = EventLog::load(tmp.path().join("nope.jsonl")).unwrap();
        assert!(events.is_empty());
        assert_eq!(EventLog::last_height(&events), 0);
    }

    #[test]
    fn torn_tail_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.jsonl");
        let good = serde_json::to_string(&event(1)).unwrap();
        fs::write(&path, format!("{good}\n{{\"id\":\"0x2")).unwrap();

        let events = EventLog::load(&path).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.jsonl");
        let good = serde_json::to_string(&event(1)).unwrap();
        fs::write(&path, format!("garbage\n{good}\n")).unwrap();
        assert!(EventLog::load(&path).is_err());
    }

    #[test]
    fn snapshot_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("projection.json");
        assert!(RegistrySnapshot::load(&path).unwrap().is_none());

        let mut snapshot = RegistrySnapshot::default();
        snapshot.applied.insert(EventId::from("0x1:0"));
        snapshot.height = 9;
        snapshot.save(&path).unwrap();

        assert_eq!(RegistrySnapshot::load(&path).unwrap(), Some(snapshot));
    }
}
