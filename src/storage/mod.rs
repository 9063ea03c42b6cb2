//! Storage engine core
//!
//! Submodules:
//! - [`error`]: status codes used across the engine
//! - [`meta`]: SQLite-backed metadata store (dictionary, rescue points,
//!   volume catalog, parameters)
//! - [`blockstore`]: paged volume set behind the `BlockStore` seam
//! - [`column`]: per-series column store with tail buffers
//! - [`engine`]: the `Storage` facade, sync worker, recovery
//! - [`session`]: per-writer sessions

pub mod blockstore;
pub mod column;
pub mod engine;
pub mod error;
pub mod meta;
pub mod session;

pub use blockstore::{BlockStore, LogicAddr, MemoryBlockStore, VolumeStore};
pub use column::{CStoreSession, ColumnStore, WriteOutcome};
pub use engine::{Storage, StorageConfig, DEFAULT_PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use meta::MetadataStore;
pub use session::Session;
