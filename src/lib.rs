//! # strata
//!
//! A time-series storage engine: tagged numeric samples are ingested at
//! high rate through per-writer sessions, persisted durably through a
//! sharded input log, and served back through streaming range,
//! aggregation, and metadata queries.
//!
//! ## Modules
//!
//! - [`series`]: sample model and canonical series names
//! - [`registry`]: global and per-session name interning
//! - [`inputlog`]: sharded append-only durability log and recovery
//! - [`storage`]: the engine facade, column store, metadata store,
//!   block storage, and sessions
//! - [`query`]: JSON query parsing and the streaming operator pipeline
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use strata::{Storage, VecCursor};
//!
//! fn main() -> strata::StorageResult<()> {
//!     let storage = Storage::open("/var/lib/strata/metrics.strata")?;
//!     let session = storage.create_write_session()?;
//!
//!     session.write_named("cpu host=a", 1000, 0.42)?;
//!
//!     let mut cursor = VecCursor::new();
//!     session.query(
//!         &mut cursor,
//!         r#"{"select": "cpu", "range": {"from": 0, "to": 2000}, "order-by": "time"}"#,
//!     )?;
//!     println!("{} samples", cursor.data().len());
//!
//!     drop(session);
//!     storage.close()
//! }
//! ```

pub mod inputlog;
pub mod query;
pub mod registry;
pub mod series;
pub mod storage;

// Re-export top-level types for convenience
pub use query::{InternalCursor, OrderBy, QueryError, VecCursor};
pub use registry::{LocalRegistry, SearchPredicate, SeriesRegistry, TransientMatcher};
pub use series::{canonicalize, expand_joined, ParamId, Sample, SeriesName, Timestamp};
pub use storage::{
    Session, Storage, StorageConfig, StorageError, StorageResult,
};
