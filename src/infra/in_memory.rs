//! In-memory adapters for every port, used by tests and local experiments.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::app::ports::{
    aggregate_documents, AppendOutcome, Checkpoint, CheckpointStore, Document, DocumentFilter,
    DocumentStore, GroupAverage, GroupStats, RawStore, StagingStore,
};
use crate::domain::{Channel, StagedRecord, StoredRow};
use crate::error::{PipelineError, Result};

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| PipelineError::Store("in-memory store lock poisoned".to_string()))
}

#[derive(Default)]
pub struct InMemoryRawStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryRawStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RawStore for InMemoryRawStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        lock(&self.blobs)?.insert(key.to_string(), bytes.to_vec());
        debug!("Stored raw blob {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        lock(&self.blobs)?
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("raw key '{key}'")))
    }
}

#[derive(Default)]
struct StagingTables {
    tables: HashMap<String, Vec<StoredRow>>,
    batch_keys: HashSet<String>,
    next_offset: u64,
}

#[derive(Default)]
pub struct InMemoryStagingStore {
    inner: Mutex<StagingTables>,
}

impl InMemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StagingStore for InMemoryStagingStore {
    async fn append_rows(
        &self,
        table: &str,
        rows: &[StagedRecord],
        channel: Channel,
        batch_key: Option<&str>,
    ) -> Result<AppendOutcome> {
        let mut inner = lock(&self.inner)?;
        if let Some(key) = batch_key {
            if !inner.batch_keys.insert(key.to_string()) {
                return Ok(AppendOutcome::DuplicateBatch);
            }
        }
        if let Some(bad) = rows.iter().find(|r| r.source_label.trim().is_empty()) {
            if let Some(key) = batch_key {
                inner.batch_keys.remove(key);
            }
            return Err(PipelineError::Write(format!(
                "empty source label on row from '{}'",
                bad.raw_key
            )));
        }

        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            inner.next_offset += 1;
            stored.push(StoredRow {
                offset: inner.next_offset,
                channel,
                record: row.clone(),
            });
        }
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(stored);
        Ok(AppendOutcome::Appended(rows.len()))
    }

    async fn read_all(&self, table: &str) -> Result<Vec<StoredRow>> {
        Ok(lock(&self.inner)?
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_after(
        &self,
        table: &str,
        after: u64,
        channel: Option<Channel>,
    ) -> Result<Vec<StoredRow>> {
        Ok(lock(&self.inner)?
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.offset > after && channel.map_or(true, |c| r.channel == c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn head(&self, table: &str, limit: usize) -> Result<Vec<StoredRow>> {
        Ok(lock(&self.inner)?
            .tables
            .get(table)
            .map(|rows| rows.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<()> {
        lock(&self.collections)?
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let collections = lock(&self.collections)?;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|d| filter.matches(d))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn aggregate(&self, collection: &str, spec: &GroupAverage) -> Result<Vec<GroupStats>> {
        let collections = lock(&self.collections)?;
        Ok(collections
            .get(collection)
            .map(|docs| aggregate_documents(docs, spec))
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    cursors: Mutex<HashMap<String, u64>>,
    checkpoints: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load_cursor(&self, name: &str) -> Result<Option<u64>> {
        Ok(lock(&self.cursors)?.get(name).copied())
    }

    async fn store_cursor(&self, name: &str, value: u64) -> Result<()> {
        lock(&self.cursors)?.insert(name.to_string(), value);
        Ok(())
    }

    async fn delete_cursor(&self, name: &str) -> Result<()> {
        lock(&self.cursors)?.remove(name);
        Ok(())
    }

    async fn last_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        Ok(lock(&self.checkpoints)?
            .get(run_id)
            .and_then(|cps| cps.last().cloned()))
    }

    async fn record_checkpoint(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        lock(&self.checkpoints)?
            .entry(run_id.to_string())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }
}
