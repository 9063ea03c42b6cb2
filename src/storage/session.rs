//! Write session
//!
//! The per-writer handle onto the engine. A session owns a local name
//! cache, a lazily pinned input-log shard, and a column-store writer
//! handle. Sessions share ownership of the engine internals; the facade
//! only counts live sessions for the close barrier.
//!
//! Contract: a session represents one logical writer. The engine
//! guarantees per-series ordering only when the hosting application
//! does not drive a single session from multiple threads concurrently;
//! the shard pinning (one shard per session, for life) encodes that
//! intent. Concurrent writes to the same series from *different*
//! sessions have no defined order; after recovery the write from the
//! later shard wins.

use crate::inputlog::{LogRecord, LogShard};
use crate::query::ast::ParsedQuery;
use crate::query::cursor::InternalCursor;
use crate::query::{parser, pipeline};
use crate::registry::{LocalRegistry, TransientMatcher};
use crate::series::{canonicalize, expand_joined, ParamId, Sample};
use crate::storage::column::{CStoreSession, WriteOutcome};
use crate::storage::engine::StorageInner;
use crate::storage::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

pub struct Session {
    inner: Arc<StorageInner>,
    local: Mutex<LocalRegistry>,
    /// Pinned on first write, held for the session's lifetime. None in
    /// the in-memory construction mode.
    shard: OnceLock<Option<Arc<LogShard>>>,
    cs: CStoreSession,
    /// Scoped matcher overrides, LIFO. The top entry shadows the local
    /// and global registries during name resolution.
    matcher_stack: Mutex<Vec<Arc<TransientMatcher>>>,
}

impl Session {
    pub(crate) fn new(inner: Arc<StorageInner>) -> Session {
        let cs = CStoreSession::new(Arc::clone(&inner.cstore));
        Session {
            inner,
            local: Mutex::new(LocalRegistry::new()),
            shard: OnceLock::new(),
            cs,
            matcher_stack: Mutex::new(Vec::new()),
        }
    }

    fn shard(&self) -> Option<&Arc<LogShard>> {
        self.shard
            .get_or_init(|| self.inner.bind_shard())
            .as_ref()
    }

    /// Resolve a raw series name, allocating an id on first
    /// observation. Newly allocated ids are declared to the input log
    /// before the call returns; under log backpressure the declaration
    /// is retried on the next resolve of the same name.
    pub fn init_series_id(&self, raw: &str) -> StorageResult<ParamId> {
        self.inner.check_writable()?;
        let canonical = canonicalize(raw)?;
        let (id, outcome) = {
            let mut local = self.local.lock();
            local.resolve(&canonical, &self.inner.registry)
        };
        use crate::registry::ResolveOutcome::*;
        let needs_decl = match outcome {
            Created => true,
            Global | Local => self.inner.is_undeclared(id),
        };
        if needs_decl {
            self.declare(id, &canonical)?;
        }
        Ok(id)
    }

    fn declare(&self, id: ParamId, canonical: &str) -> StorageResult<()> {
        let Some(shard) = self.shard() else {
            return Ok(());
        };
        self.inner.mark_undeclared(id);
        shard.append(&LogRecord::SeriesDecl {
            id,
            name: canonical.to_string(),
        })?;
        self.inner.clear_undeclared(id);
        Ok(())
    }

    /// Expand a joined name (`a:b:c tag=v`) and resolve every component
    /// in input order, allocating ids where needed.
    pub fn get_series_ids(&self, joined: &str) -> StorageResult<Vec<ParamId>> {
        self.inner.check_writable()?;
        let names = expand_joined(joined)?;
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            ids.push(self.init_series_id(&name)?);
        }
        Ok(ids)
    }

    /// Canonical name of a series. A transient matcher installed for a
    /// running query shadows the persistent registries.
    pub fn get_series_name(&self, id: ParamId) -> StorageResult<String> {
        self.inner.check_running()?;
        {
            let stack = self.matcher_stack.lock();
            for matcher in stack.iter().rev() {
                if let Some(name) = matcher.name_of(id) {
                    return Ok(name.to_string());
                }
            }
        }
        if let Some(name) = self.local.lock().name_of(id) {
            return Ok(name.to_string());
        }
        self.inner
            .registry
            .name_of(id)
            .ok_or_else(|| StorageError::NotFound(format!("series id {}", id)))
    }

    /// Ingest one sample. Pipeline, in order: the id must be known, the
    /// write is appended to this session's log shard (backpressure
    /// surfaces as `Overflow`; retry with backoff), then handed to the
    /// column store. A tail rotation forwards the fresh rescue points
    /// to the sync worker.
    pub fn write(&self, sample: &Sample) -> StorageResult<()> {
        self.inner.check_writable()?;
        if !sample.is_data() {
            return Err(StorageError::BadInput(
                "control samples cannot be written".into(),
            ));
        }
        self.ensure_known(sample.param_id)?;

        if let Some(shard) = self.shard() {
            shard.append(&LogRecord::Write {
                id: sample.param_id,
                timestamp: sample.timestamp,
                value: sample.value,
            })?;
        }

        match self.cs.write(sample)? {
            WriteOutcome::Appended => {}
            WriteOutcome::TailRotated(addrs) => {
                self.inner.enqueue_rescue(sample.param_id, addrs);
            }
        }
        self.inner.note_write();
        Ok(())
    }

    /// Resolve a raw name and write in one step.
    pub fn write_named(&self, raw: &str, timestamp: u64, value: f64) -> StorageResult<ParamId> {
        let id = self.init_series_id(raw)?;
        self.write(&Sample::new(id, timestamp, value))?;
        Ok(id)
    }

    fn ensure_known(&self, id: ParamId) -> StorageResult<()> {
        {
            let local = self.local.lock();
            if local.name_of(id).is_some() {
                return Ok(());
            }
        }
        match self.inner.registry.name_of(id) {
            Some(name) => {
                self.local.lock().insert(id, &name);
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "series id {} was never initialized",
                id
            ))),
        }
    }

    /// Run a range/aggregation query and pump results into `cursor`.
    /// Parse failures are both returned and forwarded to the cursor.
    pub fn query(&self, cursor: &mut dyn InternalCursor, text: &str) -> StorageResult<()> {
        if let Err(e) = self.inner.check_running() {
            cursor.set_error(e.duplicate());
            return Err(e);
        }
        let parsed = match parser::parse_query(&self.inner.registry, text) {
            Ok(parsed) => parsed,
            Err(e) => {
                let status: StorageError = e.into();
                cursor.set_error(status.duplicate());
                return Err(status);
            }
        };

        // Pull the transient matcher out and install it for the
        // duration of the pipeline run.
        let (parsed, matcher) = match parsed {
            ParsedQuery::Scan {
                request,
                ops,
                matcher,
            } => (
                ParsedQuery::Scan {
                    request,
                    ops,
                    matcher: None,
                },
                matcher,
            ),
            other => (other, None),
        };
        let _scope = matcher.map(|m| MatcherScope::install(self, Arc::new(m)));

        pipeline::execute(
            &self.inner.cstore,
            |pred| self.inner.metadata_entries(pred),
            &parsed,
            cursor,
        )
    }

    /// Metric-name suggestion query (metadata only).
    pub fn suggest(&self, cursor: &mut dyn InternalCursor, text: &str) -> StorageResult<()> {
        self.metadata_query(cursor, text)
    }

    /// Series search query (metadata only).
    pub fn search(&self, cursor: &mut dyn InternalCursor, text: &str) -> StorageResult<()> {
        self.metadata_query(cursor, text)
    }

    fn metadata_query(&self, cursor: &mut dyn InternalCursor, text: &str) -> StorageResult<()> {
        if let Err(e) = self.inner.check_running() {
            cursor.set_error(e.duplicate());
            return Err(e);
        }
        let parsed = match parser::parse_metadata_query(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                let status: StorageError = e.into();
                cursor.set_error(status.duplicate());
                return Err(status);
            }
        };
        pipeline::execute(
            &self.inner.cstore,
            |pred| self.inner.metadata_entries(pred),
            &parsed,
            cursor,
        )
    }

    /// Install a temporary matcher. Must be paired with
    /// `clear_series_matcher`; nested installs behave as a LIFO stack.
    pub fn set_series_matcher(&self, matcher: Arc<TransientMatcher>) {
        self.matcher_stack.lock().push(matcher);
    }

    /// Remove the most recently installed matcher.
    pub fn clear_series_matcher(&self) {
        self.matcher_stack.lock().pop();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Drain pending writes on the bound shard; losing the race with
        // close is fine, the shard just reports Closed.
        if let Some(Some(shard)) = self.shard.get() {
            if let Err(e) = shard.sync() {
                tracing::debug!(error = %e, "shard flush on session drop");
            }
        }
        self.inner.release_session();
    }
}

/// Scoped matcher override: installs on construction, restores the
/// previous matcher on drop.
struct MatcherScope<'a> {
    session: &'a Session,
}

impl<'a> MatcherScope<'a> {
    fn install(session: &'a Session, matcher: Arc<TransientMatcher>) -> Self {
        session.set_series_matcher(matcher);
        Self { session }
    }
}

impl Drop for MatcherScope<'_> {
    fn drop(&mut self) {
        self.session.clear_series_matcher();
    }
}
