//! Persistence of sponsorship records.
//!
//! [`LedgerStore`] keeps every record in memory, optionally mirrored to a JSON
//! file that is rewritten atomically on each change. Secondary indexes by
//! recipient and by status are rebuilt on load.

use std::{
    cmp::Reverse,
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    StoreError,
    types::{SponsorshipRecord, SponsorshipStatus},
};

/// Document store for [`SponsorshipRecord`]s.
#[async_trait]
pub trait SponsorshipStore: Send + Sync {
    /// Persists a new record. Fails on a duplicate id.
    async fn insert(&self, record: SponsorshipRecord) -> Result<(), StoreError>;

    async fn get(&self, id: B256) -> Result<Option<SponsorshipRecord>, StoreError>;

    /// Records of `recipient`, most recent first.
    async fn by_recipient(
        &self,
        recipient: Address,
        limit: usize,
    ) -> Result<Vec<SponsorshipRecord>, StoreError>;

    /// Records in `status`, oldest first.
    async fn by_status(
        &self,
        status: SponsorshipStatus,
    ) -> Result<Vec<SponsorshipRecord>, StoreError>;

    /// Replaces the stored record with `record` only while the stored copy is
    /// still pending. Returns whether anything was written.
    async fn update_pending(&self, record: SponsorshipRecord) -> Result<bool, StoreError>;

    /// Records created at or after `since` (unix seconds).
    async fn created_since(&self, since: u64) -> Result<Vec<SponsorshipRecord>, StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    records: HashMap<B256, SponsorshipRecord>,
    #[serde(skip)]
    recipients: HashMap<Address, Vec<B256>>,
    #[serde(skip)]
    statuses: HashMap<SponsorshipStatus, BTreeSet<(u64, B256)>>,
}

impl Ledger {
    fn rebuild_indexes(&mut self) {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by_key(|record| (record.created_at, record.id));

        let mut recipients: HashMap<Address, Vec<B256>> = HashMap::new();
        let mut statuses: HashMap<SponsorshipStatus, BTreeSet<(u64, B256)>> = HashMap::new();
        for record in records {
            recipients.entry(record.recipient).or_default().push(record.id);
            statuses
                .entry(record.status)
                .or_default()
                .insert((record.created_at, record.id));
        }
        self.recipients = recipients;
        self.statuses = statuses;
    }

    fn index(&mut self, record: &SponsorshipRecord) {
        self.recipients
            .entry(record.recipient)
            .or_default()
            .push(record.id);
        self.statuses
            .entry(record.status)
            .or_default()
            .insert((record.created_at, record.id));
    }

    fn unindex(&mut self, record: &SponsorshipRecord) {
        if let Some(ids) = self.recipients.get_mut(&record.recipient) {
            ids.retain(|id| *id != record.id);
        }
        if let Some(ids) = self.statuses.get_mut(&record.status) {
            ids.remove(&(record.created_at, record.id));
        }
    }

    fn restatus(&mut self, before: &SponsorshipRecord, after: &SponsorshipRecord) {
        if let Some(ids) = self.statuses.get_mut(&before.status) {
            ids.remove(&(before.created_at, before.id));
        }
        self.statuses
            .entry(after.status)
            .or_default()
            .insert((after.created_at, after.id));
    }
}

/// In-memory record store with optional JSON file persistence.
#[derive(Debug)]
pub struct LedgerStore {
    ledger: RwLock<Ledger>,
    path: Option<PathBuf>,
}

impl LedgerStore {
    pub fn new_in_memory() -> Self {
        Self {
            ledger: RwLock::default(),
            path: None,
        }
    }

    /// Opens the ledger at `path`, starting empty when the file does not exist.
    pub fn new_persistent(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let mut ledger = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str::<Ledger>(&contents)?
        } else {
            Ledger::default()
        };
        ledger.rebuild_indexes();

        info!(path = %path.display(), records = ledger.records.len(), "Opened sponsorship ledger");

        Ok(Self {
            ledger: RwLock::new(ledger),
            path: Some(path),
        })
    }

    /// Writes `ledger` to disk through a temp file and rename.
    async fn save(&self, ledger: &Ledger) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = serde_json::to_vec_pretty(ledger)?;

        let temp_path = path.with_extension("json.tmp");
        let io_err = |source: std::io::Error| StoreError::Io {
            path: path.clone(),
            source,
        };
        tokio::fs::write(&temp_path, contents).await.map_err(io_err)?;
        tokio::fs::rename(&temp_path, path).await.map_err(io_err)?;

        debug!(path = %path.display(), records = ledger.records.len(), "Saved sponsorship ledger");
        Ok(())
    }
}

#[async_trait]
impl SponsorshipStore for LedgerStore {
    async fn insert(&self, record: SponsorshipRecord) -> Result<(), StoreError> {
        let mut ledger = self.ledger.write().await;
        if ledger.records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }

        ledger.index(&record);
        ledger.records.insert(record.id, record.clone());

        if let Err(err) = self.save(&ledger).await {
            ledger.records.remove(&record.id);
            ledger.unindex(&record);
            return Err(err);
        }
        Ok(())
    }

    async fn get(&self, id: B256) -> Result<Option<SponsorshipRecord>, StoreError> {
        Ok(self.ledger.read().await.records.get(&id).cloned())
    }

    async fn by_recipient(
        &self,
        recipient: Address,
        limit: usize,
    ) -> Result<Vec<SponsorshipRecord>, StoreError> {
        let ledger = self.ledger.read().await;
        let mut records: Vec<_> = ledger
            .recipients
            .get(&recipient)
            .into_iter()
            .flatten()
            .rev()
            .filter_map(|id| ledger.records.get(id).cloned())
            .collect();
        records.sort_by_key(|record| Reverse(record.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn by_status(
        &self,
        status: SponsorshipStatus,
    ) -> Result<Vec<SponsorshipRecord>, StoreError> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .statuses
            .get(&status)
            .into_iter()
            .flatten()
            .filter_map(|(_, id)| ledger.records.get(id).cloned())
            .collect())
    }

    async fn update_pending(&self, record: SponsorshipRecord) -> Result<bool, StoreError> {
        let mut ledger = self.ledger.write().await;
        let Some(stored) = ledger.records.get(&record.id).cloned() else {
            return Ok(false);
        };
        if stored.status != SponsorshipStatus::Pending {
            return Ok(false);
        }

        ledger.restatus(&stored, &record);
        ledger.records.insert(record.id, record.clone());

        if let Err(err) = self.save(&ledger).await {
            ledger.restatus(&record, &stored);
            ledger.records.insert(stored.id, stored);
            return Err(err);
        }
        Ok(true)
    }

    async fn created_since(&self, since: u64) -> Result<Vec<SponsorshipRecord>, StoreError> {
        let ledger = self.ledger.read().await;
        let mut records: Vec<_> = ledger
            .records
            .values()
            .filter(|record| record.created_at >= since)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}
