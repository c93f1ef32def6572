use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::app::ports::{
    aggregate_documents, Document, DocumentFilter, DocumentStore, GroupAverage, GroupStats,
};
use crate::error::{PipelineError, Result};

static COLLECTION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("valid collection regex"));

/// Curated documents as one append-only NDJSON file per collection.
pub struct NdjsonDocumentStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl NdjsonDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, collection: &str) -> Result<PathBuf> {
        if !COLLECTION_NAME.is_match(collection) {
            return Err(PipelineError::Config(format!(
                "invalid collection name '{collection}'"
            )));
        }
        Ok(self.root.join(format!("{collection}.ndjson")))
    }

    /// Stream documents through `visit` until it returns false.
    fn scan(&self, collection: &str, mut visit: impl FnMut(Document) -> bool) -> Result<()> {
        let path = self.path_for(collection)?;
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(PipelineError::Store(format!("open {}: {e}", path.display()))),
        };
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| PipelineError::Store(format!("read {collection}: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let doc: Document = serde_json::from_str(&line)?;
            if !visit(doc) {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for NdjsonDocumentStore {
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let path = self.path_for(collection)?;

        // Serialize everything first so a bad document writes nothing
        let mut buf = String::new();
        for doc in &docs {
            buf.push_str(&serde_json::to_string(doc)?);
            buf.push('\n');
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| PipelineError::Store("curated write lock poisoned".to_string()))?;
        fs::create_dir_all(&self.root)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PipelineError::Write(format!("open {}: {e}", path.display())))?;
        file.write_all(buf.as_bytes())
            .map_err(|e| PipelineError::Write(format!("append {collection}: {e}")))?;
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        if limit == Some(0) {
            return Ok(out);
        }
        self.scan(collection, |doc| {
            if filter.matches(&doc) {
                out.push(doc);
            }
            limit.map_or(true, |l| out.len() < l)
        })?;
        Ok(out)
    }

    async fn aggregate(&self, collection: &str, spec: &GroupAverage) -> Result<Vec<GroupStats>> {
        let mut docs = Vec::new();
        self.scan(collection, |doc| {
            docs.push(doc);
            true
        })?;
        Ok(aggregate_documents(&docs, spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn appends_accumulate_across_calls() {
        let dir = tempdir().unwrap();
        let store = NdjsonDocumentStore::new(dir.path());
        let docs = vec![doc(json!({"wine_type": "red", "quality_category": "good"}))];
        store.insert_many("wine_collection", docs.clone()).await.unwrap();
        store.insert_many("wine_collection", docs).await.unwrap();

        let all = store
            .find("wine_collection", &DocumentFilter::new(), None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn find_filters_and_limits() {
        let dir = tempdir().unwrap();
        let store = NdjsonDocumentStore::new(dir.path());
        let docs = (0..6)
            .map(|i| {
                let cat = if i % 2 == 0 { "good" } else { "poor" };
                doc(json!({"wine_type": "white", "quality_category": cat, "n": i}))
            })
            .collect();
        store.insert_many("c", docs).await.unwrap();

        let good = store
            .find("c", &DocumentFilter::new().eq("quality_category", "good"), Some(2))
            .await
            .unwrap();
        assert_eq!(good.len(), 2);
        assert!(good.iter().all(|d| d["quality_category"] == "good"));
    }

    #[tokio::test]
    async fn missing_collection_reads_empty() {
        let dir = tempdir().unwrap();
        let store = NdjsonDocumentStore::new(dir.path().join("curated"));
        let found = store.find("absent", &DocumentFilter::new(), None).await.unwrap();
        assert!(found.is_empty());
        let spec = GroupAverage {
            group_by: "wine_type".into(),
            average_of: "alcohol".into(),
        };
        assert!(store.aggregate("absent", &spec).await.unwrap().is_empty());
    }
}
