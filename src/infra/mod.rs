// Store adapters behind the ports in crate::app::ports

pub mod fs_raw_store;
pub mod in_memory;
pub mod ndjson_documents;
pub mod sqlite_staging;

pub use fs_raw_store::FsRawStore;
pub use in_memory::{
    InMemoryCheckpointStore, InMemoryDocumentStore, InMemoryRawStore, InMemoryStagingStore,
};
pub use ndjson_documents::NdjsonDocumentStore;
pub use sqlite_staging::SqliteStagingStore;
