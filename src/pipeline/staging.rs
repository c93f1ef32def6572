use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::app::ports::{AppendOutcome, StagingStore};
use crate::config::WritePolicy;
use crate::domain::{Channel, StagedRecord, StoredRow};
use crate::error::Result;
use crate::observability::metrics;

/// A row the store refused under the best-effort policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowRejection {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StagingReport {
    pub inserted: usize,
    /// The batch key was already recorded and nothing was appended.
    pub duplicate_batch: bool,
    pub rejected: Vec<RowRejection>,
}

/// Appends normalized records to the configured staging table.
pub struct StagingWriter {
    store: Arc<dyn StagingStore>,
    table: String,
    policy: WritePolicy,
}

impl StagingWriter {
    pub fn new(store: Arc<dyn StagingStore>, table: impl Into<String>, policy: WritePolicy) -> Self {
        Self {
            store,
            table: table.into(),
            policy,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn append_staged(
        &self,
        records: &[StagedRecord],
        channel: Channel,
        batch_key: Option<&str>,
    ) -> Result<StagingReport> {
        let report = match self.policy {
            WritePolicy::FailFast => self.append_bulk(records, channel, batch_key).await?,
            WritePolicy::BestEffort => self.append_each(records, channel, batch_key).await?,
        };

        metrics::staging::rows_appended(report.inserted);
        if report.duplicate_batch {
            metrics::staging::duplicate_batch();
            info!("Batch already staged in '{}', nothing appended", self.table);
        }
        if !report.rejected.is_empty() {
            metrics::staging::rows_rejected(report.rejected.len());
            warn!(
                "{} of {} rows rejected by staging table '{}'",
                report.rejected.len(),
                records.len(),
                self.table
            );
        }
        Ok(report)
    }

    async fn append_bulk(
        &self,
        records: &[StagedRecord],
        channel: Channel,
        batch_key: Option<&str>,
    ) -> Result<StagingReport> {
        let outcome = self
            .store
            .append_rows(&self.table, records, channel, batch_key)
            .await?;
        Ok(match outcome {
            AppendOutcome::Appended(n) => StagingReport {
                inserted: n,
                ..Default::default()
            },
            AppendOutcome::DuplicateBatch => StagingReport {
                duplicate_batch: true,
                ..Default::default()
            },
        })
    }

    /// Row by row; the batch key is recorded with the first accepted row.
    async fn append_each(
        &self,
        records: &[StagedRecord],
        channel: Channel,
        batch_key: Option<&str>,
    ) -> Result<StagingReport> {
        let mut report = StagingReport::default();
        let mut key = batch_key;
        for (index, record) in records.iter().enumerate() {
            match self
                .store
                .append_rows(&self.table, std::slice::from_ref(record), channel, key)
                .await
            {
                Ok(AppendOutcome::Appended(n)) => {
                    report.inserted += n;
                    key = None;
                }
                Ok(AppendOutcome::DuplicateBatch) => {
                    report.duplicate_batch = true;
                    return Ok(report);
                }
                Err(e) => {
                    debug!("Row {} rejected: {}", index, e);
                    report.rejected.push(RowRejection {
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    pub async fn read_all(&self) -> Result<Vec<StoredRow>> {
        self.store.read_all(&self.table).await
    }

    pub async fn read_after(&self, after: u64, channel: Option<Channel>) -> Result<Vec<StoredRow>> {
        self.store.read_after(&self.table, after, channel).await
    }

    pub async fn head(&self, limit: usize) -> Result<Vec<StoredRow>> {
        self.store.head(&self.table, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InMemoryStagingStore;
    use std::collections::BTreeMap;

    fn record(label: &str, quality: i64) -> StagedRecord {
        StagedRecord {
            attributes: BTreeMap::from([("alcohol".to_string(), 10.0)]),
            quality,
            source_label: label.to_string(),
            raw_key: "winequality-white.csv".to_string(),
        }
    }

    fn writer(policy: WritePolicy) -> (StagingWriter, Arc<InMemoryStagingStore>) {
        let store = Arc::new(InMemoryStagingStore::new());
        (StagingWriter::new(store.clone(), "wine_data", policy), store)
    }

    #[tokio::test]
    async fn fail_fast_writes_nothing_when_any_row_is_refused() {
        let (writer, store) = writer(WritePolicy::FailFast);
        let err = writer
            .append_staged(&[record("white", 6), record("", 7)], Channel::Batch, None)
            .await;
        assert!(err.is_err());
        assert!(store.read_all("wine_data").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn best_effort_collects_rejections() {
        let (writer, store) = writer(WritePolicy::BestEffort);
        let report = writer
            .append_staged(
                &[record("white", 6), record("", 7), record("white", 8)],
                Channel::Batch,
                Some("batch-1"),
            )
            .await
            .unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].index, 1);
        assert_eq!(store.read_all("wine_data").await.unwrap().len(), 2);

        let replay = writer
            .append_staged(&[record("white", 6)], Channel::Batch, Some("batch-1"))
            .await
            .unwrap();
        assert!(replay.duplicate_batch);
        assert_eq!(replay.inserted, 0);
    }

    #[tokio::test]
    async fn repeated_appends_without_key_accumulate() {
        let (writer, _) = writer(WritePolicy::FailFast);
        for _ in 0..2 {
            writer
                .append_staged(&[record("white", 6)], Channel::Batch, None)
                .await
                .unwrap();
        }
        assert_eq!(writer.read_all().await.unwrap().len(), 2);
    }
}
