use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::app::ports::RawStore;
use crate::error::{PipelineError, Result};

/// Raw blobs as plain files under `root`, one file per key.
pub struct FsRawStore {
    root: PathBuf,
}

impl FsRawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `key` under the root; keys are relative, `/`-separated and
    /// may not escape the root.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(PipelineError::NotFound(format!("invalid raw key '{key}'")));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl RawStore for FsRawStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Store(format!("raw store mkdir: {e}")))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::Store(format!("raw store write '{key}': {e}")))?;
        debug!("Stored raw blob {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PipelineError::NotFound(format!("raw key '{key}'")))
            }
            Err(e) => Err(PipelineError::Store(format!("raw store read '{key}': {e}"))),
        }
    }
}
