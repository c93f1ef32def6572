use std::sync::Arc;
use tracing::{info, warn};

use crate::app::ports::CheckpointStore;
use crate::error::Result;

/// A named, persisted, monotonically increasing staging offset.
///
/// Offset 0 means nothing has been processed yet.
pub struct Watermark {
    store: Arc<dyn CheckpointStore>,
    name: String,
}

impl Watermark {
    pub fn new(store: Arc<dyn CheckpointStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the cursor at 0 if it does not exist; returns its position.
    pub async fn init(&self) -> Result<u64> {
        match self.store.load_cursor(&self.name).await? {
            Some(pos) => Ok(pos),
            None => {
                self.store.store_cursor(&self.name, 0).await?;
                Ok(0)
            }
        }
    }

    pub async fn current(&self) -> Result<u64> {
        Ok(self.store.load_cursor(&self.name).await?.unwrap_or(0))
    }

    /// Move forward to `to`. Never moves backwards.
    pub async fn advance(&self, to: u64) -> Result<u64> {
        let current = self.current().await?;
        if to < current {
            warn!(
                "Ignoring backwards move of cursor '{}' from {} to {}",
                self.name, current, to
            );
            return Ok(current);
        }
        if to > current {
            self.store.store_cursor(&self.name, to).await?;
        }
        Ok(to)
    }

    /// Drop the cursor so the next incremental load re-reads everything.
    pub async fn reset(&self) -> Result<()> {
        self.store.delete_cursor(&self.name).await?;
        info!("Cursor '{}' reset", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InMemoryCheckpointStore;

    #[tokio::test]
    async fn init_advance_reset() {
        let wm = Watermark::new(Arc::new(InMemoryCheckpointStore::new()), "curate");
        assert_eq!(wm.init().await.unwrap(), 0);
        assert_eq!(wm.advance(5).await.unwrap(), 5);
        assert_eq!(wm.init().await.unwrap(), 5);
        assert_eq!(wm.advance(3).await.unwrap(), 5);
        assert_eq!(wm.current().await.unwrap(), 5);
        wm.reset().await.unwrap();
        assert_eq!(wm.current().await.unwrap(), 0);
    }
}
