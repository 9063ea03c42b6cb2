//! Sharded durable input log
//!
//! Append-only, crash-consistent record of every id allocation and every
//! write, partitioned into N independent shards. Each write session is
//! pinned to exactly one shard for its lifetime, so records within a
//! shard are totally ordered; across shards no order is promised.
//!
//! Format per record (the engine's standard framing):
//! - length: u32 (4 bytes)
//! - data: [u8; length] (bincode-serialized `LogRecord`)
//! - crc: u32 (4 bytes, CRC32 of length + data)
//!
//! A shard is a directory of rolling segment files `<seq>.log`, each
//! starting with an 8-byte header (magic, version). Appends go into an
//! in-memory buffer; full buffers are handed to the shard's fsync worker
//! over a bounded channel. When the channel is full the append fails
//! with `Overflow`, which callers treat as backpressure. A record is
//! durable once its buffer has been fsynced by the worker.

pub mod recovery;

use crate::series::{ParamId, Timestamp};
use crate::storage::error::{StorageError, StorageResult};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Segment file magic bytes.
const SEGMENT_MAGIC: [u8; 4] = *b"SLOG";

/// Segment format version.
const SEGMENT_VERSION: u16 = 1;

/// Segment header: magic (4) + version (2) + reserved (2).
pub(crate) const SEGMENT_HEADER_SIZE: usize = 8;

/// Largest record frame accepted on read; guards against scanning
/// garbage lengths in a torn tail.
pub(crate) const MAX_RECORD_SIZE: usize = 1 << 20;

/// A single input-log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// First observation of a series: id allocation plus canonical name.
    SeriesDecl { id: ParamId, name: String },
    /// One numeric write.
    Write {
        id: ParamId,
        timestamp: Timestamp,
        value: f64,
    },
}

/// Input-log tuning knobs.
#[derive(Debug, Clone)]
pub struct InputLogConfig {
    /// Number of independent shards.
    pub num_shards: usize,
    /// Append buffer capacity in bytes; a full buffer is rotated to the
    /// fsync worker.
    pub buffer_size: usize,
    /// How many rotated buffers may be in flight per shard before
    /// appends report backpressure.
    pub buffers_in_flight: usize,
    /// Segment rotation threshold in bytes.
    pub max_segment_size: u64,
}

impl Default for InputLogConfig {
    fn default() -> Self {
        Self {
            num_shards: 4,
            buffer_size: 64 * 1024,
            buffers_in_flight: 4,
            max_segment_size: 16 * 1024 * 1024,
        }
    }
}

/// Encode a record into its framed wire form.
pub(crate) fn encode_record(record: &LogRecord) -> StorageResult<Vec<u8>> {
    let data = bincode::serialize(record)?;
    let mut frame = Vec::with_capacity(8 + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&data);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&(data.len() as u32).to_le_bytes());
    hasher.update(&data);
    frame.extend_from_slice(&hasher.finalize().to_le_bytes());
    Ok(frame)
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{:08}.log", seq))
}

pub(crate) fn parse_segment_seq(path: &Path) -> Option<u64> {
    if path.extension().map(|e| e == "log").unwrap_or(false) {
        path.file_stem()?.to_str()?.parse().ok()
    } else {
        None
    }
}

enum WorkerMsg {
    Data(Vec<u8>),
    Sync(Sender<()>),
    Shutdown,
}

/// One append-only log partition with a dedicated fsync worker.
pub struct LogShard {
    id: usize,
    dir: PathBuf,
    buf: Mutex<Vec<u8>>,
    tx: Sender<WorkerMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Sequence number of the segment currently being written.
    current_seq: Arc<AtomicU64>,
    io_failed: Arc<AtomicBool>,
    closed: AtomicBool,
    buffer_size: usize,
}

impl LogShard {
    fn open(id: usize, dir: PathBuf, config: &InputLogConfig) -> StorageResult<Arc<Self>> {
        std::fs::create_dir_all(&dir)?;

        // Never append to a pre-existing segment: a torn tail from a
        // previous run stays untouched for recovery to truncate.
        let mut start_seq = 0u64;
        for entry in std::fs::read_dir(&dir)? {
            if let Some(seq) = parse_segment_seq(&entry?.path()) {
                start_seq = start_seq.max(seq + 1);
            }
        }

        let (tx, rx) = bounded(config.buffers_in_flight);
        let current_seq = Arc::new(AtomicU64::new(start_seq));
        let io_failed = Arc::new(AtomicBool::new(false));

        let worker = {
            let dir = dir.clone();
            let current_seq = Arc::clone(&current_seq);
            let io_failed = Arc::clone(&io_failed);
            let max_segment_size = config.max_segment_size;
            std::thread::Builder::new()
                .name(format!("strata-log-{}", id))
                .spawn(move || {
                    shard_worker(id, dir, rx, current_seq, io_failed, max_segment_size)
                })
                .map_err(StorageError::Io)?
        };

        Ok(Arc::new(Self {
            id,
            dir,
            buf: Mutex::new(Vec::with_capacity(config.buffer_size)),
            tx,
            worker: Mutex::new(Some(worker)),
            current_seq,
            io_failed,
            closed: AtomicBool::new(false),
            buffer_size: config.buffer_size,
        }))
    }

    pub fn shard_id(&self) -> usize {
        self.id
    }

    /// Append a record. Non-blocking: the record lands in the shard
    /// buffer; a full buffer is rotated to the fsync worker. Returns
    /// `Overflow` when every buffer slot is in flight.
    pub fn append(&self, record: &LogRecord) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        if self.io_failed.load(Ordering::Acquire) {
            return Err(StorageError::Io(std::io::Error::other(
                "input log shard failed",
            )));
        }
        let frame = encode_record(record)?;

        let mut buf = self.buf.lock();
        if !buf.is_empty() && buf.len() + frame.len() > self.buffer_size {
            let full = std::mem::replace(&mut *buf, Vec::with_capacity(self.buffer_size));
            match self.tx.try_send(WorkerMsg::Data(full)) {
                Ok(()) => {}
                Err(TrySendError::Full(WorkerMsg::Data(full))) => {
                    *buf = full;
                    return Err(StorageError::Overflow);
                }
                Err(_) => return Err(StorageError::Closed),
            }
        }
        buf.extend_from_slice(&frame);
        Ok(())
    }

    /// Flush the append buffer and wait for everything in flight to hit
    /// disk.
    pub fn sync(&self) -> StorageResult<()> {
        {
            let mut buf = self.buf.lock();
            if !buf.is_empty() {
                let full = std::mem::replace(&mut *buf, Vec::with_capacity(self.buffer_size));
                self.tx
                    .send(WorkerMsg::Data(full))
                    .map_err(|_| StorageError::Closed)?;
            }
        }
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(WorkerMsg::Sync(ack_tx))
            .map_err(|_| StorageError::Closed)?;
        ack_rx.recv().map_err(|_| StorageError::Closed)?;
        if self.io_failed.load(Ordering::Acquire) {
            return Err(StorageError::Io(std::io::Error::other(
                "input log shard failed",
            )));
        }
        Ok(())
    }

    /// Sequence number of the segment currently open for writing.
    /// Everything strictly below it is closed and durable.
    pub fn current_seq(&self) -> u64 {
        self.current_seq.load(Ordering::Acquire)
    }

    /// Delete closed segments with sequence numbers below `seq`.
    pub fn reclaim_below(&self, seq: u64) -> StorageResult<usize> {
        let bound = seq.min(self.current_seq());
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(s) = parse_segment_seq(&path) {
                if s < bound {
                    std::fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::debug!(shard = self.id, removed, "reclaimed input log segments");
        }
        Ok(removed)
    }

    fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Push out whatever is buffered, then stop the worker.
        {
            let mut buf = self.buf.lock();
            if !buf.is_empty() {
                let full = std::mem::take(&mut *buf);
                let _ = self.tx.send(WorkerMsg::Data(full));
            }
        }
        let _ = self.tx.send(WorkerMsg::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn shard_worker(
    id: usize,
    dir: PathBuf,
    rx: Receiver<WorkerMsg>,
    current_seq: Arc<AtomicU64>,
    io_failed: Arc<AtomicBool>,
    max_segment_size: u64,
) {
    let mut segment: Option<(BufWriter<File>, u64)> = None;

    let open_segment = |seq: u64| -> std::io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(segment_path(&dir, seq))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&SEGMENT_MAGIC)?;
        writer.write_all(&SEGMENT_VERSION.to_le_bytes())?;
        writer.write_all(&[0u8; 2])?;
        Ok(writer)
    };

    let mut fail = |err: std::io::Error| {
        tracing::error!(shard = id, error = %err, "input log worker I/O failure");
        io_failed.store(true, Ordering::Release);
    };

    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Data(bytes) => {
                if io_failed.load(Ordering::Acquire) {
                    continue;
                }
                let seq = current_seq.load(Ordering::Acquire);
                if segment.is_none() {
                    match open_segment(seq) {
                        Ok(w) => segment = Some((w, SEGMENT_HEADER_SIZE as u64)),
                        Err(e) => {
                            fail(e);
                            continue;
                        }
                    }
                }
                let (writer, written) = segment.as_mut().unwrap();
                let result = writer
                    .write_all(&bytes)
                    .and_then(|_| writer.flush())
                    .and_then(|_| writer.get_ref().sync_data());
                match result {
                    Ok(()) => {
                        *written += bytes.len() as u64;
                        if *written >= max_segment_size {
                            segment = None;
                            current_seq.store(seq + 1, Ordering::Release);
                        }
                    }
                    Err(e) => fail(e),
                }
            }
            WorkerMsg::Sync(ack) => {
                if let Some((writer, _)) = segment.as_mut() {
                    if let Err(e) = writer.flush().and_then(|_| writer.get_ref().sync_data()) {
                        fail(e);
                    }
                }
                let _ = ack.send(());
            }
            WorkerMsg::Shutdown => break,
        }
    }

    if let Some((mut writer, _)) = segment.take() {
        if let Err(e) = writer.flush().and_then(|_| writer.get_ref().sync_data()) {
            fail(e);
        }
    }
}

/// The full shard set. Sessions bind to a shard round-robin on first
/// write and keep the binding for life; the assignment state is scoped
/// here (one registry per Storage, no process globals).
pub struct ShardedInputLog {
    root: PathBuf,
    shards: Vec<Arc<LogShard>>,
    next_bind: AtomicUsize,
}

impl ShardedInputLog {
    /// Open (or create) the shard set rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, config: &InputLogConfig) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let mut shards = Vec::with_capacity(config.num_shards);
        for i in 0..config.num_shards {
            shards.push(LogShard::open(i, root.join(format!("shard_{}", i)), config)?);
        }
        Ok(Self {
            root,
            shards,
            next_bind: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Pin the caller to a shard. Called once per session, on its first
    /// write.
    pub fn bind(&self) -> Arc<LogShard> {
        let idx = self.next_bind.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        Arc::clone(&self.shards[idx])
    }

    /// Current open-segment sequence per shard; the reclamation
    /// watermark is captured from this before a column-store commit.
    pub fn capture_seqs(&self) -> Vec<u64> {
        self.shards.iter().map(|s| s.current_seq()).collect()
    }

    /// Delete segments strictly below the captured watermark.
    pub fn reclaim_below(&self, watermark: &[u64]) -> StorageResult<usize> {
        let mut removed = 0;
        for (shard, &seq) in self.shards.iter().zip(watermark) {
            removed += shard.reclaim_below(seq)?;
        }
        Ok(removed)
    }

    /// Flush every shard and wait for durability.
    pub fn sync_all(&self) -> StorageResult<()> {
        for shard in &self.shards {
            shard.sync()?;
        }
        Ok(())
    }

    /// True if any shard still holds segment files (uncommitted records
    /// survive on disk and recovery must run).
    pub fn has_pending_segments(&self) -> StorageResult<bool> {
        for shard in &self.shards {
            for entry in std::fs::read_dir(&shard.dir)? {
                if parse_segment_seq(&entry?.path()).is_some() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Segment counts per shard, for stats.
    pub fn segment_counts(&self) -> StorageResult<Vec<usize>> {
        let mut out = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let mut count = 0;
            for entry in std::fs::read_dir(&shard.dir)? {
                if parse_segment_seq(&entry?.path()).is_some() {
                    count += 1;
                }
            }
            out.push(count);
        }
        Ok(out)
    }

    /// Stop all fsync workers, flushing first. Idempotent.
    pub fn close(&self) -> StorageResult<()> {
        for shard in &self.shards {
            shard.close()?;
        }
        Ok(())
    }
}

impl Drop for ShardedInputLog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
