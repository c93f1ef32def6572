use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::app::ports::{Document, DocumentFilter, DocumentStore, GroupAverage, GroupStats};
use crate::domain::CuratedRecord;
use crate::error::{PipelineError, Result};
use crate::observability::metrics;

/// Shape a curated record as a flat document.
pub fn to_document(record: &CuratedRecord) -> Result<Document> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(PipelineError::Write(format!(
            "curated record serialized to non-object {other}"
        ))),
    }
}

/// Bulk-inserts enriched records into the curated collection.
pub struct CuratedWriter {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl CuratedWriter {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn append_curated(&self, records: &[CuratedRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let docs = records.iter().map(to_document).collect::<Result<Vec<_>>>()?;
        let count = docs.len();
        self.store.insert_many(&self.collection, docs).await?;
        metrics::curated::documents_inserted(count);
        debug!("Inserted {} documents into '{}'", count, self.collection);
        Ok(count)
    }

    pub async fn find(&self, filter: &DocumentFilter, limit: Option<usize>) -> Result<Vec<Document>> {
        self.store.find(&self.collection, filter, limit).await
    }

    pub async fn aggregate(&self, spec: &GroupAverage) -> Result<Vec<GroupStats>> {
        self.store.aggregate(&self.collection, spec).await
    }
}
