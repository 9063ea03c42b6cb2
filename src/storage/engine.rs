//! Storage facade
//!
//! Binds the subsystems together: block storage, the numeric column
//! store, the series name registry, the metadata store, and the sharded
//! input log. Owns the background sync worker and the recovery path.
//!
//! Write path:  Session -> registry resolve -> input log -> column store
//! Read path:   query text -> parser -> operator chain -> cursor
//!
//! Lifecycle: `Initializing -> Recovering -> Running -> Closing ->
//! Closed`. Recovery runs once at open, before any session exists.
//! `close` waits for live sessions to drain (the close barrier), stops
//! the sync worker, flushes everything, and is idempotent.

use crate::inputlog::recovery::{self, RecoveryReport, ShardScan};
use crate::inputlog::{InputLogConfig, LogShard, ShardedInputLog};
use crate::registry::{SearchPredicate, SeriesRegistry};
use crate::series::{ParamId, Timestamp};
use crate::storage::blockstore::{BlockStore, LogicAddr, MemoryBlockStore, VolumeStore};
use crate::storage::column::ColumnStore;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::meta::MetadataStore;
use crate::storage::session::Session;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default page size for new databases.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Default pages per volume for new databases.
pub const DEFAULT_PAGES_PER_VOLUME: u32 = 4096;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Samples buffered per column tail before a commit is forced.
    pub tail_limit: usize,
    /// Background sync worker period.
    pub sync_interval: Duration,
    /// Input-log shape.
    pub input_log: InputLogConfig,
    /// Depth of the rescue-point queue feeding the sync worker.
    pub rescue_queue_depth: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tail_limit: 128,
            sync_interval: Duration::from_millis(1000),
            input_log: InputLogConfig::default(),
            rescue_queue_depth: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Initializing = 0,
    Recovering = 1,
    Running = 2,
    Closing = 3,
    Closed = 4,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Initializing,
            1 => State::Recovering,
            2 => State::Running,
            3 => State::Closing,
            _ => State::Closed,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            State::Initializing => "initializing",
            State::Recovering => "recovering",
            State::Running => "running",
            State::Closing => "closing",
            State::Closed => "closed",
        }
    }
}

type RescueUpdate = (ParamId, Vec<LogicAddr>);

pub(crate) struct StorageInner {
    config: StorageConfig,
    state: AtomicU8,
    degraded: AtomicBool,
    pub(crate) registry: SeriesRegistry,
    meta: MetadataStore,
    pub(crate) cstore: Arc<ColumnStore>,
    inputlog: Option<ShardedInputLog>,

    rescue_tx: Sender<RescueUpdate>,
    /// Receiver parked here until the worker takes it (or close drains
    /// it when no worker was started).
    rescue_rx: Mutex<Option<Receiver<RescueUpdate>>>,
    /// Spill for updates that found the queue full; merged by the next
    /// sync cycle.
    rescue_spill: Mutex<HashMap<ParamId, Vec<LogicAddr>>>,

    /// Ids allocated whose `SeriesDecl` has not yet reached the input
    /// log (backpressure hit during declaration).
    undeclared: Mutex<HashSet<ParamId>>,
    undeclared_len: AtomicUsize,

    sessions: AtomicUsize,
    close_mx: Mutex<()>,
    close_cv: Condvar,

    worker_stop: Mutex<bool>,
    worker_cv: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,

    recovery: Mutex<Option<RecoveryReport>>,
    /// Watermark captured by the previous sync cycle. Reclamation lags
    /// one cycle behind the capture so a record whose log append won
    /// the race against its column-store write is never deleted before
    /// a commit has covered it.
    pending_watermark: Mutex<Option<Vec<u64>>>,
    writes: AtomicU64,
}

/// The engine facade. Construct with [`Storage::open`] for a database
/// on disk, [`Storage::memory`] for an empty in-memory instance, or
/// [`Storage::with_parts`] with injected collaborators.
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Empty in-memory storage: no input log, no volumes. Writes are
    /// not durable; intended for tests and tooling.
    pub fn memory() -> StorageResult<Storage> {
        let config = StorageConfig::default();
        let meta = MetadataStore::memory()?;
        let bstore: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let cstore = Arc::new(ColumnStore::new(
            bstore,
            config.tail_limit,
            DEFAULT_PAGE_SIZE as usize - 64,
        ));
        Self::assemble(config, meta, cstore, None, true)
    }

    /// Injected-dependency constructor for tests; optionally without
    /// the background worker.
    pub fn with_parts(
        meta: MetadataStore,
        cstore: Arc<ColumnStore>,
        start_worker: bool,
    ) -> StorageResult<Storage> {
        Self::assemble(StorageConfig::default(), meta, cstore, None, start_worker)
    }

    /// Open an existing database by its metadata path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Storage> {
        Self::open_with_config(path, StorageConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, mut config: StorageConfig) -> StorageResult<Storage> {
        let meta = MetadataStore::open(path.as_ref())?;

        let page_size = meta
            .get_param_u64("page_size")?
            .ok_or_else(|| StorageError::Corruption("missing page_size parameter".into()))?;
        let pages_per_volume = meta
            .get_param_u64("pages_per_volume")?
            .unwrap_or(DEFAULT_PAGES_PER_VOLUME as u64) as u32;
        if let Some(shards) = meta.get_param_u64("num_shards")? {
            config.input_log.num_shards = shards as usize;
        }
        let wal_root = meta
            .get_param("input_log_path")?
            .map(PathBuf::from)
            .ok_or_else(|| StorageError::Corruption("missing input_log_path parameter".into()))?;

        let volumes = meta.volumes()?;
        if volumes.is_empty() {
            return Err(StorageError::Corruption("empty volume catalog".into()));
        }
        let bstore: Arc<dyn BlockStore> =
            Arc::new(VolumeStore::open(&volumes, page_size, pages_per_volume)?);
        let cstore = Arc::new(ColumnStore::new(
            bstore,
            config.tail_limit,
            page_size as usize - 64,
        ));

        Self::assemble(config, meta, cstore, Some(wal_root), true)
    }

    fn assemble(
        config: StorageConfig,
        meta: MetadataStore,
        cstore: Arc<ColumnStore>,
        wal_root: Option<PathBuf>,
        start_worker: bool,
    ) -> StorageResult<Storage> {
        let registry = SeriesRegistry::new();
        for (id, name) in meta.load_series()? {
            registry.insert_known(id, &name);
        }
        for (id, addrs) in meta.load_rescue_points()? {
            cstore.open_column(id, &addrs)?;
        }

        // The recovery scan happens before the shard workers come up,
        // so torn tails are truncated while the files are quiet.
        let mut scans = None;
        if let Some(root) = &wal_root {
            let scanned = recovery::scan_all(root, config.input_log.num_shards, true)?;
            if scanned
                .iter()
                .any(|s| !s.records.is_empty() || s.torn_tails > 0)
            {
                scans = Some(scanned);
            }
        }

        let inputlog = match wal_root {
            Some(root) => Some(ShardedInputLog::open(root, &config.input_log)?),
            None => None,
        };

        let (rescue_tx, rescue_rx) = bounded(config.rescue_queue_depth);
        let inner = Arc::new(StorageInner {
            config,
            state: AtomicU8::new(State::Initializing as u8),
            degraded: AtomicBool::new(false),
            registry,
            meta,
            cstore,
            inputlog,
            rescue_tx,
            rescue_rx: Mutex::new(Some(rescue_rx)),
            rescue_spill: Mutex::new(HashMap::new()),
            undeclared: Mutex::new(HashSet::new()),
            undeclared_len: AtomicUsize::new(0),
            sessions: AtomicUsize::new(0),
            close_mx: Mutex::new(()),
            close_cv: Condvar::new(),
            worker_stop: Mutex::new(false),
            worker_cv: Condvar::new(),
            worker: Mutex::new(None),
            recovery: Mutex::new(None),
            pending_watermark: Mutex::new(None),
            writes: AtomicU64::new(0),
        });

        if let Some(scans) = scans {
            inner.state.store(State::Recovering as u8, Ordering::Release);
            let report = replay_scans(&scans, &inner.registry, &inner.cstore);
            *inner.recovery.lock() = Some(report);
            // Persist what recovery brought back before going live.
            inner.meta.upsert_series(&inner.registry.snapshot())?;
            inner.meta.sync()?;
        }

        if start_worker {
            inner.start_sync_worker()?;
        }
        inner.state.store(State::Running as u8, Ordering::Release);
        Ok(Storage { inner })
    }

    /// Create an empty database from scratch: metadata store, volume
    /// files, input-log location.
    pub fn new_database(
        base_name: &str,
        metadata_path: &Path,
        volumes_path: &Path,
        num_volumes: u32,
        page_size: u64,
        allocate: bool,
    ) -> StorageResult<()> {
        if base_name.is_empty() || num_volumes == 0 {
            return Err(StorageError::BadInput(
                "database needs a name and at least one volume".into(),
            ));
        }
        let meta_path = metadata_path.join(format!("{}.strata", base_name));
        let volume_paths: Vec<PathBuf> = (0..num_volumes)
            .map(|i| volumes_path.join(format!("{}_{}.vol", base_name, i)))
            .collect();

        VolumeStore::create(
            &volume_paths,
            page_size,
            DEFAULT_PAGES_PER_VOLUME,
            allocate,
        )?;

        let meta = MetadataStore::create(&meta_path)?;
        meta.add_volumes(&volume_paths)?;
        meta.set_param("page_size", &page_size.to_string())?;
        meta.set_param("pages_per_volume", &DEFAULT_PAGES_PER_VOLUME.to_string())?;
        meta.set_param(
            "num_shards",
            &InputLogConfig::default().num_shards.to_string(),
        )?;
        meta.set_param(
            "input_log_path",
            &volumes_path
                .join(format!("{}.ilog", base_name))
                .display()
                .to_string(),
        )?;
        meta.set_param("created_at", &chrono::Utc::now().to_rfc3339())?;
        meta.sync()?;
        tracing::info!(base = base_name, volumes = num_volumes, "created database");
        Ok(())
    }

    /// Remove a database. Refuses a non-empty database unless `force`
    /// is set; permission failures surface as `Access`.
    pub fn remove_storage(
        meta_path: &Path,
        wal_path: Option<&Path>,
        force: bool,
    ) -> StorageResult<()> {
        let meta = MetadataStore::open_read_only(meta_path)?;
        let series = meta.load_series()?;
        if !series.is_empty() && !force {
            return Err(StorageError::NotPermitted(format!(
                "database holds {} series; pass force to remove",
                series.len()
            )));
        }
        let volumes = meta.volumes()?;
        let wal_root = match wal_path {
            Some(p) => Some(p.to_path_buf()),
            None => meta.get_param("input_log_path")?.map(PathBuf::from),
        };
        drop(meta);

        let access = |e: std::io::Error, path: &Path| match e.kind() {
            std::io::ErrorKind::PermissionDenied => StorageError::Access(path.display().to_string()),
            _ => StorageError::Io(e),
        };
        for volume in &volumes {
            if volume.exists() {
                std::fs::remove_file(volume).map_err(|e| access(e, volume))?;
            }
        }
        if let Some(root) = wal_root {
            if root.exists() {
                std::fs::remove_dir_all(&root).map_err(|e| access(e, &root))?;
            }
        }
        std::fs::remove_file(meta_path).map_err(|e| access(e, meta_path))?;
        Ok(())
    }

    /// Open metadata read-only and emit a JSON report. Modifies
    /// nothing.
    pub fn generate_report(meta_path: &Path, output: &Path) -> StorageResult<()> {
        let meta = MetadataStore::open_read_only(meta_path)?;
        let report = meta.report()?;
        std::fs::write(output, serde_json::to_string_pretty(&report)?)?;
        Ok(())
    }

    /// Dry-run the input-log scan and report what recovery would do.
    pub fn generate_recovery_report(meta_path: &Path, output: &Path) -> StorageResult<()> {
        let meta = MetadataStore::open_read_only(meta_path)?;
        let declared: HashSet<ParamId> = meta.load_series()?.into_iter().map(|(id, _)| id).collect();
        let wal_root = meta
            .get_param("input_log_path")?
            .map(PathBuf::from)
            .ok_or_else(|| StorageError::Corruption("missing input_log_path parameter".into()))?;
        let num_shards = meta.get_param_u64("num_shards")?.unwrap_or(4) as usize;
        drop(meta);

        let scans = recovery::scan_all(&wal_root, num_shards, false)?;
        let mut log_declared: HashSet<ParamId> = HashSet::new();
        let mut writes = 0u64;
        let mut orphans = 0u64;
        for scan in &scans {
            for rec in &scan.records {
                match rec {
                    crate::inputlog::LogRecord::SeriesDecl { id, .. } => {
                        log_declared.insert(*id);
                    }
                    crate::inputlog::LogRecord::Write { id, .. } => {
                        if declared.contains(id) || log_declared.contains(id) {
                            writes += 1;
                        } else {
                            orphans += 1;
                        }
                    }
                }
            }
        }

        let report = serde_json::json!({
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "shards": scans.iter().map(|s| serde_json::to_value(s.counters()).unwrap_or_default()).collect::<Vec<_>>(),
            "recoverable_writes": writes,
            "orphan_writes": orphans,
            "declared_in_log": log_declared.len(),
        });
        std::fs::write(output, serde_json::to_string_pretty(&report)?)?;
        Ok(())
    }

    /// Create a new write session. Only valid while Running.
    pub fn create_write_session(&self) -> StorageResult<Session> {
        self.inner.check_running()?;
        self.inner.sessions.fetch_add(1, Ordering::AcqRel);
        Ok(Session::new(Arc::clone(&self.inner)))
    }

    /// Flush and close a subset of columns without closing the engine.
    pub fn close_specific_columns(&self, ids: &[ParamId]) -> StorageResult<()> {
        self.inner.check_running()?;
        let updates = self.inner.cstore.commit_columns(ids)?;
        for (id, addrs) in updates {
            self.inner.meta.set_rescue_points(id, &addrs)?;
        }
        self.inner.meta.sync()?;
        Ok(())
    }

    /// Forward fresh rescue-point addresses for a series to the sync
    /// worker. Coalesced through a bounded queue; on overflow the update
    /// is spilled and merged on the next cycle.
    pub fn update_rescue_points(&self, id: ParamId, addrs: Vec<LogicAddr>) {
        self.inner.enqueue_rescue(id, addrs);
    }

    /// Engine statistics as a JSON tree.
    pub fn get_stats(&self) -> StorageResult<serde_json::Value> {
        self.inner.check_running()?;
        let inner = &self.inner;
        let recovery = inner
            .recovery
            .lock()
            .as_ref()
            .map(|r| serde_json::to_value(r).unwrap_or_default());
        let (shard_count, segments) = match &inner.inputlog {
            Some(log) => (log.num_shards(), Some(log.segment_counts()?)),
            None => (0, None),
        };
        let tails = inner.cstore.tail_sizes();
        Ok(serde_json::json!({
            "state": State::from_u8(inner.state.load(Ordering::Acquire)).name(),
            "degraded": inner.degraded.load(Ordering::Acquire),
            "series_count": inner.registry.len(),
            "column_count": inner.cstore.num_columns(),
            "buffered_samples": tails.iter().map(|(_, n)| *n as u64).sum::<u64>(),
            "writes_accepted": inner.writes.load(Ordering::Relaxed),
            "sessions": inner.sessions.load(Ordering::Relaxed),
            "input_log": {
                "shards": shard_count,
                "segments": segments,
            },
            "recovery": recovery,
        }))
    }

    /// The most recent recovery report, if this open replayed the log.
    pub fn recovery_report(&self) -> Option<RecoveryReport> {
        self.inner.recovery.lock().clone()
    }

    /// Stop ingestion and flush everything. Blocks until all sessions
    /// are dropped (the close barrier). Idempotent: second and later
    /// calls return immediately.
    pub fn close(&self) -> StorageResult<()> {
        self.inner.close()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let state = State::from_u8(self.inner.state.load(Ordering::Acquire));
        if state == State::Running {
            if self.inner.sessions.load(Ordering::Acquire) == 0 {
                if let Err(e) = self.inner.close() {
                    tracing::error!(error = %e, "implicit close on drop failed");
                }
            } else {
                tracing::warn!("storage dropped while sessions are alive; skipping close");
            }
        }
    }
}

impl StorageInner {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn check_running(&self) -> StorageResult<()> {
        match self.state() {
            State::Running => Ok(()),
            State::Closing | State::Closed => Err(StorageError::Closed),
            other => Err(StorageError::Internal(format!(
                "storage is {}",
                other.name()
            ))),
        }
    }

    /// Like `check_running`, but also refuses writes once the engine
    /// has latched into the degraded state.
    pub(crate) fn check_writable(&self) -> StorageResult<()> {
        self.check_running()?;
        if self.degraded.load(Ordering::Acquire) {
            return Err(StorageError::Io(std::io::Error::other(
                "engine is degraded after an unrecoverable I/O failure",
            )));
        }
        Ok(())
    }

    pub(crate) fn bind_shard(&self) -> Option<Arc<LogShard>> {
        self.inputlog.as_ref().map(|log| log.bind())
    }

    pub(crate) fn note_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn metadata_entries(&self, predicate: &SearchPredicate) -> Vec<(ParamId, String)> {
        self.registry.search(predicate)
    }

    pub(crate) fn enqueue_rescue(&self, id: ParamId, addrs: Vec<LogicAddr>) {
        match self.rescue_tx.try_send((id, addrs)) {
            Ok(()) => {}
            Err(TrySendError::Full((id, addrs))) => {
                let mut spill = self.rescue_spill.lock();
                merge_longest(&mut spill, id, addrs);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    // ---- undeclared-series tracking ----

    pub(crate) fn mark_undeclared(&self, id: ParamId) {
        if self.undeclared.lock().insert(id) {
            self.undeclared_len.fetch_add(1, Ordering::Release);
        }
    }

    pub(crate) fn clear_undeclared(&self, id: ParamId) {
        if self.undeclared.lock().remove(&id) {
            self.undeclared_len.fetch_sub(1, Ordering::Release);
        }
    }

    pub(crate) fn is_undeclared(&self, id: ParamId) -> bool {
        if self.undeclared_len.load(Ordering::Acquire) == 0 {
            return false;
        }
        self.undeclared.lock().contains(&id)
    }

    // ---- sessions / close barrier ----

    pub(crate) fn release_session(&self) {
        if self.sessions.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.close_mx.lock();
            self.close_cv.notify_all();
        }
    }

    // ---- sync worker ----

    fn start_sync_worker(self: &Arc<Self>) -> StorageResult<()> {
        let rx = self
            .rescue_rx
            .lock()
            .take()
            .ok_or_else(|| StorageError::Internal("sync worker already started".into()))?;
        let inner = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("strata-sync".into())
            .spawn(move || {
                loop {
                    {
                        let mut stop = inner.worker_stop.lock();
                        if !*stop {
                            inner
                                .worker_cv
                                .wait_for(&mut stop, inner.config.sync_interval);
                        }
                        if *stop {
                            break;
                        }
                    }
                    if let Err(e) = inner.run_sync_cycle(&rx) {
                        tracing::error!(error = %e, "sync cycle failed");
                        if matches!(e, StorageError::Io(_)) {
                            inner.degraded.store(true, Ordering::Release);
                        }
                    }
                }
                // One last cycle so close has little left to do.
                if let Err(e) = inner.run_sync_cycle(&rx) {
                    tracing::error!(error = %e, "final sync cycle failed");
                }
            })
            .map_err(StorageError::Io)?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// One pass of the background worker: commit column tails, persist
    /// the dictionary and rescue points, advance the input-log
    /// watermark, reclaim dead segments.
    fn run_sync_cycle(&self, rx: &Receiver<RescueUpdate>) -> StorageResult<()> {
        // Capture before the commit: segments that fill up during the
        // commit still hold records the commit covers.
        let watermark = self.inputlog.as_ref().map(|log| log.capture_seqs());

        let mut updates: HashMap<ParamId, Vec<LogicAddr>> = HashMap::new();
        for (id, addrs) in self.cstore.commit_all()? {
            merge_longest(&mut updates, id, addrs);
        }
        for (id, addrs) in rx.try_iter() {
            merge_longest(&mut updates, id, addrs);
        }
        for (id, addrs) in self.rescue_spill.lock().drain() {
            merge_longest(&mut updates, id, addrs);
        }

        self.meta.upsert_series(&self.registry.snapshot())?;
        for (id, addrs) in &updates {
            self.meta.set_rescue_points(*id, addrs)?;
        }
        self.meta.sync()?;

        // Reclaim against the previous cycle's capture. A write whose
        // log append narrowly preceded that capture has long since
        // reached its column tail, so this cycle's commit covered it.
        if let Some(log) = self.inputlog.as_ref() {
            let previous = self.pending_watermark.lock().replace(
                watermark.unwrap_or_default(),
            );
            if let Some(wm) = previous {
                log.reclaim_below(&wm)?;
            }
        }
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        // Only the caller that wins the Running -> Closing transition
        // performs shutdown work.
        if self
            .state
            .compare_exchange(
                State::Running as u8,
                State::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        // Close barrier: wait for every live session to drop.
        {
            let mut guard = self.close_mx.lock();
            while self.sessions.load(Ordering::Acquire) > 0 {
                self.close_cv.wait(&mut guard);
            }
        }

        // Stop the sync worker.
        {
            let mut stop = self.worker_stop.lock();
            *stop = true;
        }
        self.worker_cv.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }

        // Whatever happens below, the engine ends up Closed.
        self.state.store(State::Closed as u8, Ordering::Release);

        let mut first_err: Option<StorageError> = None;
        let mut note = |r: StorageResult<()>| {
            if let Err(e) = r {
                tracing::error!(error = %e, "close step failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        if let Some(log) = &self.inputlog {
            note(log.sync_all());
        }
        note(self.cstore.commit_all().map(|_| ()));
        note(self.meta.upsert_series(&self.registry.snapshot()));
        // Persist the authoritative rescue-point sets for every column.
        match self.cstore.all_rescue_points() {
            Ok(all) => {
                for (id, addrs) in all {
                    note(self.meta.set_rescue_points(id, &addrs));
                }
            }
            Err(e) => note(Err(e)),
        }
        note(self.meta.sync());
        if let Some(log) = &self.inputlog {
            note(log.close());
        }

        tracing::info!("storage closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn merge_longest(map: &mut HashMap<ParamId, Vec<LogicAddr>>, id: ParamId, addrs: Vec<LogicAddr>) {
    // Rescue lists only grow, so the longest list is the newest.
    match map.get(&id) {
        Some(existing) if existing.len() >= addrs.len() => {}
        _ => {
            map.insert(id, addrs);
        }
    }
}

/// Replay surviving input-log records: declarations first (idempotent
/// by id), then writes in shard order. A later shard's write to the
/// same `(series, timestamp)` overwrites and counts as a collision;
/// writes referencing an undeclared id are dropped and counted.
fn replay_scans(
    scans: &[ShardScan],
    registry: &SeriesRegistry,
    cstore: &ColumnStore,
) -> RecoveryReport {
    use crate::inputlog::LogRecord;

    let mut report = RecoveryReport::default();
    for scan in scans {
        report.shards.push(scan.counters());
    }

    for scan in scans {
        for rec in &scan.records {
            if let LogRecord::SeriesDecl { id, name } = rec {
                registry.insert_known(*id, name);
                report.series_declared += 1;
            }
        }
    }

    let mut seen: HashMap<(ParamId, Timestamp), usize> = HashMap::new();
    for scan in scans {
        for rec in &scan.records {
            if let LogRecord::Write {
                id,
                timestamp,
                value,
            } = rec
            {
                if registry.name_of(*id).is_none() {
                    report.orphan_writes += 1;
                    continue;
                }
                if let Some(prev_shard) = seen.insert((*id, *timestamp), scan.shard) {
                    if prev_shard != scan.shard {
                        report.collisions += 1;
                    }
                }
                cstore.replay(*id, *timestamp, *value);
                report.writes_replayed += 1;
            }
        }
    }

    tracing::info!(
        series = report.series_declared,
        writes = report.writes_replayed,
        orphans = report.orphan_writes,
        collisions = report.collisions,
        "input log recovery complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::TRANSIENT_ID_BASE;
    use crate::query::VecCursor;
    use crate::registry::TransientMatcher;
    use crate::series::Sample;
    use tempfile::tempdir;

    /// Route engine logs through the test harness; repeated calls are
    /// fine, only the first subscriber wins.
    fn trace_init() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn create_db(dir: &Path) -> PathBuf {
        Storage::new_database("test", dir, dir, 2, DEFAULT_PAGE_SIZE, false).unwrap();
        dir.join("test.strata")
    }

    /// Long sync interval keeps the background worker quiet, so tests
    /// control exactly what is committed.
    fn quiet_config() -> StorageConfig {
        StorageConfig {
            sync_interval: Duration::from_secs(3600),
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_memory_write_and_query() {
        let storage = Storage::memory().unwrap();
        let session = storage.create_write_session().unwrap();

        let id = session.write_named("cpu host=a", 10, 1.5).unwrap();
        session.write(&Sample::new(id, 20, 2.5)).unwrap();

        let mut cursor = VecCursor::new();
        session
            .query(
                &mut cursor,
                r#"{"select": "cpu", "range": {"from": 0, "to": 100}, "order-by": "time"}"#,
            )
            .unwrap();
        assert_eq!(cursor.data().len(), 2);
        assert!(cursor.completed);

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_write_close_reopen_scan() {
        let dir = tempdir().unwrap();
        let meta_path = create_db(dir.path());

        let (id_a, id_b) = {
            let storage = Storage::open(&meta_path).unwrap();
            let session = storage.create_write_session().unwrap();
            let id_a = session.write_named("cpu host=a", 10, 1.0).unwrap();
            let id_b = session.write_named("cpu host=b", 11, 2.0).unwrap();
            drop(session);
            storage.close().unwrap();
            (id_a, id_b)
        };

        let storage = Storage::open(&meta_path).unwrap();
        let session = storage.create_write_session().unwrap();

        // The bijection survives the cycle.
        assert_eq!(session.init_series_id("cpu host=a").unwrap(), id_a);
        assert_eq!(session.get_series_name(id_b).unwrap(), "cpu host=b");

        let mut cursor = VecCursor::new();
        session
            .query(
                &mut cursor,
                r#"{"select": "cpu", "range": {"from": 0, "to": 100}, "order-by": "time"}"#,
            )
            .unwrap();
        let data = cursor.data();
        assert_eq!(data.len(), 2);
        assert_eq!((data[0].param_id, data[0].timestamp, data[0].value), (id_a, 10, 1.0));
        assert_eq!((data[1].param_id, data[1].timestamp, data[1].value), (id_b, 11, 2.0));

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_joined_series_ids() {
        let storage = Storage::memory().unwrap();
        let session = storage.create_write_session().unwrap();

        let ids = session.get_series_ids("cpu:mem host=a").unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(session.get_series_name(ids[0]).unwrap(), "cpu host=a");
        assert_eq!(session.get_series_name(ids[1]).unwrap(), "mem host=a");

        assert!(matches!(
            session.get_series_ids("cpu:mem=x host=a"),
            Err(StorageError::BadInput(_))
        ));

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_name_round_trip() {
        let storage = Storage::memory().unwrap();
        let session = storage.create_write_session().unwrap();
        for raw in ["cpu host=a zone=eu", "mem  zone=us host=b", "disk"] {
            let id = session.init_series_id(raw).unwrap();
            assert_eq!(
                session.get_series_name(id).unwrap(),
                crate::series::canonicalize(raw).unwrap()
            );
        }
        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_crash_recovery_from_input_log() {
        trace_init();
        let dir = tempdir().unwrap();
        let meta_path = create_db(dir.path());

        {
            let storage = Storage::open_with_config(&meta_path, quiet_config()).unwrap();
            let session = storage.create_write_session().unwrap();
            let id = session.init_series_id("cpu host=a").unwrap();
            for ts in 0..100u64 {
                session.write(&Sample::new(id, ts, ts as f64)).unwrap();
            }
            // Session drop flushes the shard; forgetting the storage
            // skips close, like a crash after the log fsync.
            drop(session);
            std::mem::forget(storage);
        }

        let storage = Storage::open_with_config(&meta_path, quiet_config()).unwrap();
        let report = storage.recovery_report().expect("recovery must have run");
        assert_eq!(report.orphan_writes, 0);
        assert!(report.writes_replayed >= 100);
        assert_eq!(report.series_declared, 1);

        let session = storage.create_write_session().unwrap();
        let mut cursor = VecCursor::new();
        session
            .query(
                &mut cursor,
                r#"{"select": "cpu", "range": {"from": 0, "to": 1000}, "order-by": "time"}"#,
            )
            .unwrap();
        assert_eq!(cursor.data().len(), 100);

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_cross_shard_collision_later_shard_wins() {
        trace_init();
        let dir = tempdir().unwrap();
        let meta_path = create_db(dir.path());

        {
            let storage = Storage::open_with_config(&meta_path, quiet_config()).unwrap();
            // Sessions bind shards round-robin, so these two land on
            // shard 0 and shard 1.
            let a = storage.create_write_session().unwrap();
            let b = storage.create_write_session().unwrap();

            let id = a.init_series_id("dup host=x").unwrap();
            a.write(&Sample::new(id, 5, 1.0)).unwrap();
            let id_b = b.init_series_id("dup host=x").unwrap();
            assert_eq!(id, id_b);
            b.write(&Sample::new(id_b, 5, 2.0)).unwrap();

            drop(a);
            drop(b);
            std::mem::forget(storage);
        }

        let storage = Storage::open_with_config(&meta_path, quiet_config()).unwrap();
        let report = storage.recovery_report().unwrap();
        assert_eq!(report.collisions, 1);

        let session = storage.create_write_session().unwrap();
        let mut cursor = VecCursor::new();
        session
            .query(
                &mut cursor,
                r#"{"select": "dup", "range": {"from": 0, "to": 10}}"#,
            )
            .unwrap();
        let data = cursor.data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].value, 2.0);

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let storage = Storage::memory().unwrap();
        {
            let session = storage.create_write_session().unwrap();
            session.write_named("cpu host=a", 1, 1.0).unwrap();
        }
        storage.close().unwrap();
        storage.close().unwrap();

        assert!(matches!(
            storage.create_write_session(),
            Err(StorageError::Closed)
        ));
        assert!(matches!(storage.get_stats(), Err(StorageError::Closed)));
        assert!(matches!(
            storage.close_specific_columns(&[1]),
            Err(StorageError::Closed)
        ));
    }

    #[test]
    fn test_group_by_tag_query_rewrites_to_transient_ids() {
        let storage = Storage::memory().unwrap();
        let session = storage.create_write_session().unwrap();
        session.write_named("cpu host=a", 10, 1.0).unwrap();
        session.write_named("cpu host=b", 11, 3.0).unwrap();

        let mut cursor = VecCursor::new();
        session
            .query(
                &mut cursor,
                r#"{"select": "cpu", "group-by": {"tag": ["zone"]}, "order-by": "time"}"#,
            )
            .unwrap();
        let data = cursor.data();
        assert_eq!(data.len(), 2);
        // Neither series carries a zone tag, so both collapse onto one
        // transient series labeled by the bare metric.
        assert!(data.iter().all(|s| s.param_id >= TRANSIENT_ID_BASE));
        assert_eq!(data[0].param_id, data[1].param_id);

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_matcher_stack_is_lifo() {
        let storage = Storage::memory().unwrap();
        let session = storage.create_write_session().unwrap();
        let id = session.init_series_id("cpu host=a").unwrap();

        let mut outer = TransientMatcher::new();
        outer.insert(id, "outer".into());
        let mut inner_m = TransientMatcher::new();
        inner_m.insert(id, "inner".into());

        session.set_series_matcher(Arc::new(outer));
        session.set_series_matcher(Arc::new(inner_m));
        assert_eq!(session.get_series_name(id).unwrap(), "inner");
        session.clear_series_matcher();
        assert_eq!(session.get_series_name(id).unwrap(), "outer");
        session.clear_series_matcher();
        assert_eq!(session.get_series_name(id).unwrap(), "cpu host=a");

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_suggest_and_search() {
        let storage = Storage::memory().unwrap();
        let session = storage.create_write_session().unwrap();
        session.init_series_id("cpu host=a zone=eu").unwrap();
        session.init_series_id("cpu host=b zone=us").unwrap();
        session.init_series_id("mem host=a").unwrap();

        let mut cursor = VecCursor::new();
        session
            .suggest(&mut cursor, r#"{"select": "metric-names", "starts-with": "cp"}"#)
            .unwrap();
        assert_eq!(cursor.samples.len(), 2);

        let mut cursor = VecCursor::new();
        session
            .search(
                &mut cursor,
                r#"{"select": "series", "where": {"zone": {"regex": "^e"}}}"#,
            )
            .unwrap();
        assert_eq!(cursor.samples.len(), 1);
        assert_eq!(
            session.get_series_name(cursor.samples[0].param_id).unwrap(),
            "cpu host=a zone=eu"
        );

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_query_parse_error_reaches_cursor() {
        let storage = Storage::memory().unwrap();
        let session = storage.create_write_session().unwrap();
        session.write_named("cpu host=a", 1, 1.0).unwrap();

        let mut cursor = VecCursor::new();
        let err = session
            .query(&mut cursor, r#"{"select": "cpu", "bogus": 1}"#)
            .unwrap_err();
        assert!(matches!(err, StorageError::QueryParse(_)));
        assert!(matches!(cursor.error, Some(StorageError::QueryParse(_))));
        assert!(!cursor.completed);

        // The session is still usable afterwards.
        let mut cursor = VecCursor::new();
        session.query(&mut cursor, r#"{"select": "cpu"}"#).unwrap();
        assert_eq!(cursor.data().len(), 1);

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_backpressured_cursor_halts_pipeline() {
        let storage = Storage::memory().unwrap();
        let session = storage.create_write_session().unwrap();
        let id = session.init_series_id("cpu host=a").unwrap();
        for ts in 0..10u64 {
            session.write(&Sample::new(id, ts, ts as f64)).unwrap();
        }

        let mut cursor = VecCursor::with_limit(3);
        session
            .query(&mut cursor, r#"{"select": "cpu", "order-by": "time"}"#)
            .unwrap();
        assert_eq!(cursor.samples.len(), 3);
        assert!(!cursor.completed);

        // Subsequent queries succeed.
        let mut cursor = VecCursor::new();
        session
            .query(&mut cursor, r#"{"select": "cpu", "order-by": "time"}"#)
            .unwrap();
        assert_eq!(cursor.data().len(), 10);

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_with_parts_without_worker() {
        let meta = MetadataStore::memory().unwrap();
        let bstore: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let cstore = Arc::new(ColumnStore::new(bstore, 4, 4096));
        let storage = Storage::with_parts(meta, cstore, false).unwrap();

        let session = storage.create_write_session().unwrap();
        let id = session.init_series_id("cpu host=a").unwrap();
        // Enough writes to force a tail rotation with no worker around.
        for ts in 0..10u64 {
            session.write(&Sample::new(id, ts, ts as f64)).unwrap();
        }
        let mut cursor = VecCursor::new();
        session.query(&mut cursor, r#"{"select": "cpu"}"#).unwrap();
        assert_eq!(cursor.data().len(), 10);

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_stats_tree() {
        let storage = Storage::memory().unwrap();
        let session = storage.create_write_session().unwrap();
        session.write_named("cpu host=a", 1, 1.0).unwrap();

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats["state"], "running");
        assert_eq!(stats["series_count"], 1);
        assert_eq!(stats["writes_accepted"], 1);
        assert_eq!(stats["sessions"], 1);
        assert_eq!(stats["degraded"], false);

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_new_database_and_remove() {
        let dir = tempdir().unwrap();
        let meta_path = create_db(dir.path());
        assert!(meta_path.exists());
        assert!(dir.path().join("test_0.vol").exists());

        // Creating over an existing database is refused.
        assert!(Storage::new_database("test", dir.path(), dir.path(), 2, 4096, false).is_err());

        {
            let storage = Storage::open(&meta_path).unwrap();
            let session = storage.create_write_session().unwrap();
            session.write_named("cpu host=a", 1, 1.0).unwrap();
            drop(session);
            storage.close().unwrap();
        }

        // Non-empty database needs force.
        assert!(matches!(
            Storage::remove_storage(&meta_path, None, false),
            Err(StorageError::NotPermitted(_))
        ));
        Storage::remove_storage(&meta_path, None, true).unwrap();
        assert!(!meta_path.exists());
        assert!(!dir.path().join("test_0.vol").exists());
    }

    #[test]
    fn test_generate_reports() {
        let dir = tempdir().unwrap();
        let meta_path = create_db(dir.path());
        {
            let storage = Storage::open_with_config(&meta_path, quiet_config()).unwrap();
            let session = storage.create_write_session().unwrap();
            session.write_named("cpu host=a", 1, 1.0).unwrap();
            drop(session);
            storage.close().unwrap();
        }

        let out = dir.path().join("report.json");
        Storage::generate_report(&meta_path, &out).unwrap();
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(report["series_count"], 1);

        let out = dir.path().join("recovery.json");
        Storage::generate_recovery_report(&meta_path, &out).unwrap();
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(report["orphan_writes"], 0);
    }

    #[test]
    fn test_sync_worker_persists_and_reclaims() {
        trace_init();
        let dir = tempdir().unwrap();
        let meta_path = create_db(dir.path());

        let config = StorageConfig {
            sync_interval: Duration::from_millis(50),
            tail_limit: 8,
            ..StorageConfig::default()
        };
        {
            let storage = Storage::open_with_config(&meta_path, config).unwrap();
            let session = storage.create_write_session().unwrap();
            let id = session.init_series_id("cpu host=a").unwrap();
            for ts in 0..64u64 {
                session.write(&Sample::new(id, ts, ts as f64)).unwrap();
            }
            std::thread::sleep(Duration::from_millis(300));
            drop(session);
            storage.close().unwrap();
        }

        // A clean reopen finds the data via metadata + blocks even
        // though the log may have been reclaimed.
        let storage = Storage::open(&meta_path).unwrap();
        let session = storage.create_write_session().unwrap();
        let mut cursor = VecCursor::new();
        session
            .query(&mut cursor, r#"{"select": "cpu", "order-by": "time"}"#)
            .unwrap();
        assert_eq!(cursor.data().len(), 64);

        drop(session);
        storage.close().unwrap();
    }

    #[test]
    fn test_unknown_series_write_is_rejected() {
        let storage = Storage::memory().unwrap();
        let session = storage.create_write_session().unwrap();
        assert!(matches!(
            session.write(&Sample::new(999, 1, 1.0)),
            Err(StorageError::NotFound(_))
        ));
        drop(session);
        storage.close().unwrap();
    }
}
