use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::domain::{Channel, StagedRecord, StoredRow};
use crate::error::Result;
use crate::pipeline::orchestrator::Stage;

/// A flat curated document.
pub type Document = Map<String, Value>;

/// Blob storage for the raw layer.
#[async_trait]
pub trait RawStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    /// Fails with `NotFound` when the key was never written.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Result of a staging append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(usize),
    /// The batch key was already recorded; nothing was written.
    DuplicateBatch,
}

/// Relational store for the staging layer.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Append `rows` as one unit. With a `batch_key`, the key is recorded in
    /// the same unit and a key seen before appends nothing.
    async fn append_rows(
        &self,
        table: &str,
        rows: &[StagedRecord],
        channel: Channel,
        batch_key: Option<&str>,
    ) -> Result<AppendOutcome>;

    async fn read_all(&self, table: &str) -> Result<Vec<StoredRow>>;

    /// Rows with an offset strictly greater than `after`, optionally limited
    /// to one channel, in offset order.
    async fn read_after(
        &self,
        table: &str,
        after: u64,
        channel: Option<Channel>,
    ) -> Result<Vec<StoredRow>>;

    /// The first `limit` rows in offset order.
    async fn head(&self, table: &str, limit: usize) -> Result<Vec<StoredRow>>;
}

/// Equality filter over top-level document fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    pub equals: Vec<(String, Value)>,
}

impl DocumentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.equals
            .iter()
            .all(|(field, value)| doc.get(field) == Some(value))
    }
}

/// Group documents by `group_by` and average `average_of` per group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAverage {
    pub group_by: String,
    pub average_of: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStats {
    pub group: Value,
    pub count: u64,
    /// `None` when no document in the group has a numeric value.
    pub average: Option<f64>,
}

/// Document store for the curated layer.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<()>;
    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>>;
    async fn aggregate(&self, collection: &str, spec: &GroupAverage) -> Result<Vec<GroupStats>>;
}

/// A completed stage of a named run.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub stage: Stage,
    pub cursor: Option<u64>,
    pub completed_at: DateTime<Utc>,
}

/// Persisted progress: curate cursors and per-run stage checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_cursor(&self, name: &str) -> Result<Option<u64>>;
    async fn store_cursor(&self, name: &str, value: u64) -> Result<()>;
    async fn delete_cursor(&self, name: &str) -> Result<()>;

    /// The latest checkpoint recorded for `run_id`.
    async fn last_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>>;
    async fn record_checkpoint(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<()>;
}

/// Group `docs` and compute count/mean, in first-seen group order.
pub fn aggregate_documents<'a>(
    docs: impl IntoIterator<Item = &'a Document>,
    spec: &GroupAverage,
) -> Vec<GroupStats> {
    let mut groups: Vec<(Value, u64, f64, u64)> = Vec::new();
    for doc in docs {
        let key = doc.get(&spec.group_by).cloned().unwrap_or(Value::Null);
        let idx = match groups.iter().position(|(g, ..)| *g == key) {
            Some(i) => i,
            None => {
                groups.push((key, 0, 0.0, 0));
                groups.len() - 1
            }
        };
        let entry = &mut groups[idx];
        entry.1 += 1;
        if let Some(v) = doc.get(&spec.average_of).and_then(Value::as_f64) {
            entry.2 += v;
            entry.3 += 1;
        }
    }
    groups
        .into_iter()
        .map(|(group, count, sum, numeric)| GroupStats {
            group,
            count,
            average: (numeric > 0).then(|| sum / numeric as f64),
        })
        .collect()
}
