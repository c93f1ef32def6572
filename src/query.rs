//! Read surface over the curated layer, plus the synchronous ingestion
//! entry points the API exposes.

use chrono::Utc;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

use crate::app::ports::{Document, DocumentFilter, GroupAverage};
use crate::config::ApiConfig;
use crate::constants;
use crate::domain::{QualityCategory, RawRecord, StoredRow};
use crate::error::Result;
use crate::observability::metrics;
use crate::pipeline::orchestrator::{InlineReport, Orchestrator};
use crate::pipeline::raw;

/// Query-string values where an empty parameter (`limit=`) means unset.
fn empty_as_none<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => v.parse().map(Some).map_err(de::Error::custom),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WineQuery {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub wine_type: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub quality_category: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitQuery {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub limit: Option<usize>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// `{ count, data }` listing envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Listing<T> {
    pub count: usize,
    pub data: Vec<T>,
}

impl<T> From<Vec<T>> for Listing<T> {
    fn from(data: Vec<T>) -> Self {
        Self {
            count: data.len(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub stats: Vec<Document>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RawResponse {
    pub filename: String,
    pub count: usize,
    pub rows: Vec<RawRecord>,
    /// Text of blobs that are not tabular (e.g. `winequality.names`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

fn is_tabular(key: &str) -> bool {
    key.ends_with(".csv") || key.ends_with(".json")
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub message: String,
    pub ingested: usize,
    pub raw_keys: Vec<String>,
    pub processing_time_seconds: f64,
}

pub struct QueryService {
    orchestrator: Arc<Orchestrator>,
    api: ApiConfig,
    label_field: String,
}

impl QueryService {
    pub fn new(orchestrator: Arc<Orchestrator>, api: ApiConfig, label_field: impl Into<String>) -> Self {
        Self {
            orchestrator,
            api,
            label_field: label_field.into(),
        }
    }

    pub async fn list(&self, query: &WineQuery) -> Result<Listing<Document>> {
        let mut filter = DocumentFilter::new();
        if let Some(wine_type) = non_blank(&query.wine_type) {
            filter = filter.eq(self.label_field.clone(), wine_type);
        }
        if let Some(category) = non_blank(&query.quality_category) {
            // Unknown names still filter, they just match nothing
            let value = category
                .parse::<QualityCategory>()
                .map(|c| c.as_str().to_string())
                .unwrap_or_else(|_| category.to_string());
            filter = filter.eq(constants::CATEGORY_FIELD, value);
        }
        let limit = self.api.effective_limit(query.limit);
        let docs = self.orchestrator.curated().find(&filter, Some(limit)).await?;
        Ok(docs.into())
    }

    /// Count and mean of the stats field per source label.
    pub async fn stats(&self) -> Result<StatsResponse> {
        let spec = GroupAverage {
            group_by: self.label_field.clone(),
            average_of: self.api.stats_field.clone(),
        };
        let groups = self.orchestrator.curated().aggregate(&spec).await?;
        let stats = groups
            .into_iter()
            .map(|g| {
                let mut doc = Map::new();
                doc.insert(self.label_field.clone(), g.group);
                doc.insert("count".to_string(), Value::from(g.count));
                doc.insert("average".to_string(), g.average.map_or(Value::Null, Value::from));
                doc.insert("field".to_string(), Value::from(self.api.stats_field.clone()));
                doc
            })
            .collect();
        Ok(StatsResponse { stats })
    }

    pub async fn raw(&self, filename: &str) -> Result<RawResponse> {
        let bytes = self.orchestrator.raw_store().get(filename).await?;
        if !is_tabular(filename) {
            return Ok(RawResponse {
                filename: filename.to_string(),
                count: 0,
                rows: Vec::new(),
                content: Some(String::from_utf8_lossy(&bytes).into_owned()),
            });
        }
        let rows = raw::decode(filename, &bytes, self.orchestrator.csv_delimiter(), Utc::now())?;
        Ok(RawResponse {
            filename: filename.to_string(),
            count: rows.len(),
            rows,
            content: None,
        })
    }

    pub async fn staging(&self, limit: Option<usize>) -> Result<Listing<StoredRow>> {
        let rows = self
            .orchestrator
            .staging()
            .head(self.api.effective_limit(limit))
            .await?;
        Ok(rows.into())
    }

    pub async fn curated(&self, limit: Option<usize>) -> Result<Listing<Document>> {
        let docs = self
            .orchestrator
            .curated()
            .find(&DocumentFilter::new(), Some(self.api.effective_limit(limit)))
            .await?;
        Ok(docs.into())
    }

    #[instrument(skip(self, payload))]
    pub async fn ingest(&self, payload: &Value) -> Result<IngestResponse> {
        let started = Instant::now();
        let report = self.orchestrator.ingest_inline(payload).await?;
        Ok(self.ingest_response(vec![report], started))
    }

    /// Ingest each payload in order, stopping at the first failure.
    /// Payloads before the failing one stay stored.
    #[instrument(skip(self, payloads), fields(payloads = payloads.len()))]
    pub async fn ingest_batch(&self, payloads: &[Value]) -> Result<IngestResponse> {
        let started = Instant::now();
        let mut reports = Vec::with_capacity(payloads.len());
        for payload in payloads {
            reports.push(self.orchestrator.ingest_inline(payload).await?);
        }
        Ok(self.ingest_response(reports, started))
    }

    fn ingest_response(&self, reports: Vec<InlineReport>, started: Instant) -> IngestResponse {
        let elapsed = started.elapsed().as_secs_f64();
        metrics::api::ingest_duration(elapsed);
        let ingested = reports.iter().map(|r| r.curated).sum();
        info!("Ingested {} records in {:.3}s", ingested, elapsed);
        IngestResponse {
            message: format!("{ingested} records ingested"),
            ingested,
            raw_keys: reports.into_iter().map(|r| r.raw_key).collect(),
            processing_time_seconds: elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::Stores;
    use crate::config::Config;
    use crate::error::PipelineError;
    use serde_json::json;

    fn service() -> QueryService {
        let config = Config::default_with_sources();
        let orch = Arc::new(Orchestrator::new(&Stores::in_memory(), &config));
        QueryService::new(orch, config.api.clone(), config.schema.label_field.clone())
    }

    fn wine(label: &str, quality: i64, alcohol: f64) -> Value {
        json!({
            "wine_type": label, "fixed acidity": 7.0, "volatile acidity": 0.5,
            "citric acid": 0.3, "residual sugar": 2.0, "chlorides": 0.07,
            "free sulfur dioxide": 11.0, "total sulfur dioxide": 34.0,
            "density": 0.99, "pH": 3.4, "sulphates": 0.6,
            "alcohol": alcohol, "quality": quality
        })
    }

    #[tokio::test]
    async fn list_filters_and_clamps() {
        let svc = service();
        let batch: Vec<Value> = (0..12).map(|i| wine("white", 3 + i % 6, 10.0)).collect();
        let resp = svc.ingest_batch(&batch).await.unwrap();
        assert_eq!(resp.ingested, 12);

        let all = svc.list(&WineQuery::default()).await.unwrap();
        assert_eq!(all.count, 10);

        let good = svc
            .list(&WineQuery {
                quality_category: Some("Good".into()),
                limit: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(good.count <= 5);
        assert!(good.data.iter().all(|d| d["quality_category"] == "good"));

        let unknown = svc
            .list(&WineQuery {
                quality_category: Some("excellent".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unknown.count, 0);
    }

    #[tokio::test]
    async fn blank_filters_mean_no_filter() {
        let svc = service();
        svc.ingest(&wine("red", 5, 9.0)).await.unwrap();
        let listed = svc
            .list(&WineQuery {
                wine_type: Some("".into()),
                quality_category: Some("  ".into()),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(listed.count, 1);
    }

    #[test]
    fn empty_query_parameters_deserialize_as_unset() {
        let q: WineQuery = serde_json::from_value(json!({
            "wine_type": "", "quality_category": "", "limit": ""
        }))
        .unwrap();
        assert!(q.wine_type.is_none() && q.quality_category.is_none() && q.limit.is_none());

        let q: LimitQuery = serde_json::from_value(json!({ "limit": "25" })).unwrap();
        assert_eq!(q.limit, Some(25));
        assert!(serde_json::from_value::<LimitQuery>(json!({ "limit": "abc" })).is_err());
    }

    #[tokio::test]
    async fn concurrent_identical_ingestions_both_land() {
        let svc = service();
        let payload = wine("white", 7, 11.0);
        let (a, b) = tokio::join!(svc.ingest(&payload), svc.ingest(&payload));
        assert_ne!(a.unwrap().raw_keys, b.unwrap().raw_keys);
        assert_eq!(svc.staging(None).await.unwrap().count, 2);
        assert_eq!(svc.curated(None).await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn non_tabular_raw_blob_is_returned_as_text() {
        let config = Config::default_with_sources();
        let stores = Stores::in_memory();
        stores
            .raw
            .put("winequality.names", b"Citation Request:\n  P. Cortez")
            .await
            .unwrap();
        let orch = Arc::new(Orchestrator::new(&stores, &config));
        let svc = QueryService::new(orch, config.api.clone(), config.schema.label_field.clone());

        let raw = svc.raw("winequality.names").await.unwrap();
        assert_eq!(raw.count, 0);
        assert!(raw.content.unwrap().starts_with("Citation Request"));
    }

    #[tokio::test]
    async fn stats_group_by_label() {
        let svc = service();
        svc.ingest(&wine("red", 5, 9.0)).await.unwrap();
        svc.ingest(&wine("red", 6, 11.0)).await.unwrap();
        svc.ingest(&wine("white", 8, 12.0)).await.unwrap();

        let stats = svc.stats().await.unwrap().stats;
        assert_eq!(stats.len(), 2);
        let red = stats.iter().find(|s| s["wine_type"] == "red").unwrap();
        assert_eq!(red["count"], 2);
        assert_eq!(red["average"], 10.0);
        assert_eq!(red["field"], "alcohol");
    }

    #[tokio::test]
    async fn batch_stops_at_first_failure_keeping_earlier_rows() {
        let svc = service();
        let batch = vec![wine("red", 5, 9.0), wine("red", 11, 9.0), wine("red", 6, 9.0)];
        let err = svc.ingest_batch(&batch).await.unwrap_err();
        assert!(matches!(err, PipelineError::Domain(_)));
        assert_eq!(svc.curated(None).await.unwrap().count, 1);
        assert_eq!(svc.staging(None).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn raw_decodes_inline_payload_and_misses_are_not_found() {
        let svc = service();
        let resp = svc.ingest(&wine("red", 5, 9.0)).await.unwrap();
        let key = &resp.raw_keys[0];
        assert!(key.starts_with("api/"));
        let raw = svc.raw(key).await.unwrap();
        assert_eq!(raw.count, 1);
        assert_eq!(raw.rows[0].fields["wine_type"], "red");

        let err = svc.raw("winequality-red.csv").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }
}
