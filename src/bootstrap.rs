use std::sync::Arc;
use tracing::info;

use crate::app::ports::{CheckpointStore, DocumentStore, RawStore, StagingStore};
use crate::config::Config;
use crate::error::Result;
use crate::infra::{
    FsRawStore, InMemoryCheckpointStore, InMemoryDocumentStore, InMemoryRawStore,
    InMemoryStagingStore, NdjsonDocumentStore, SqliteStagingStore,
};

/// The store handles every pipeline component is built from.
#[derive(Clone)]
pub struct Stores {
    pub raw: Arc<dyn RawStore>,
    pub staging: Arc<dyn StagingStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl Stores {
    /// Open the on-disk layers under `storage.data_root`.
    ///
    /// The staging database also holds cursors and stage checkpoints, so one
    /// SQLite handle backs both ports.
    pub fn open(config: &Config) -> Result<Self> {
        let storage = &config.storage;
        let sqlite = Arc::new(SqliteStagingStore::open(storage.staging_db())?);
        info!(
            "Stores opened: raw={} staging={} curated={}",
            storage.raw_dir().display(),
            storage.staging_db().display(),
            storage.curated_dir().display()
        );
        Ok(Self {
            raw: Arc::new(FsRawStore::new(storage.raw_dir())),
            staging: sqlite.clone(),
            documents: Arc::new(NdjsonDocumentStore::new(storage.curated_dir())),
            checkpoints: sqlite,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            raw: Arc::new(InMemoryRawStore::new()),
            staging: Arc::new(InMemoryStagingStore::new()),
            documents: Arc::new(InMemoryDocumentStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
        }
    }
}
