use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

use super::{SignalKind, SignalRecord, SignalSource, SignalStore};
use crate::database::EchoDatabase;

/// Process-local store, used when no database is configured and in tests.
pub struct MemorySignalStore {
    kind: SignalKind,
    records: RwLock<Vec<SignalRecord>>,
}

impl MemorySignalStore {
    pub fn new(kind: SignalKind) -> Self {
        Self {
            kind,
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn with_records(kind: SignalKind, records: Vec<SignalRecord>) -> Self {
        Self {
            kind,
            records: RwLock::new(records),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<SignalRecord>>> {
        self.records
            .read()
            .map_err(|e| anyhow::anyhow!("Signal store lock poisoned: {}", e))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<SignalRecord>>> {
        self.records
            .write()
            .map_err(|e| anyhow::anyhow!("Signal store lock poisoned: {}", e))
    }
}

impl SignalSource for MemorySignalStore {
    fn kind(&self) -> SignalKind {
        self.kind
    }

    fn recent_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<SignalRecord>> {
        let mut recent = self
            .read()?
            .iter()
            .filter(|record| record.created_at > cutoff)
            .cloned()
            .collect::<Vec<_>>();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(recent)
    }
}

impl SignalStore for MemorySignalStore {
    fn record(&self, record: SignalRecord) -> Result<()> {
        let mut records = self.write()?;
        records.retain(|existing| existing.id != record.id);
        records.push(record);
        Ok(())
    }

    fn latest(&self) -> Result<Option<SignalRecord>> {
        Ok(self
            .read()?
            .iter()
            .max_by_key(|record| record.created_at)
            .cloned())
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut records = self.write()?;
        let before = records.len();
        records.retain(|record| record.created_at > cutoff);
        Ok(before - records.len())
    }
}

/// One signal kind backed by the shared `signal_records` table.
pub struct SqliteSignalStore {
    kind: SignalKind,
    db: Arc<EchoDatabase>,
}

impl SqliteSignalStore {
    pub fn new(kind: SignalKind, db: Arc<EchoDatabase>) -> Self {
        Self { kind, db }
    }
}

impl SignalSource for SqliteSignalStore {
    fn kind(&self) -> SignalKind {
        self.kind
    }

    fn recent_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<SignalRecord>> {
        self.db.recent_signal_records(self.kind, cutoff)
    }
}

impl SignalStore for SqliteSignalStore {
    fn record(&self, record: SignalRecord) -> Result<()> {
        self.db.add_signal_record(self.kind, &record)
    }

    fn latest(&self) -> Result<Option<SignalRecord>> {
        self.db.latest_signal_record(self.kind)
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.db.purge_signal_records(self.kind, cutoff)
    }
}
