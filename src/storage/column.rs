//! Numeric column store
//!
//! One column per series: an in-memory tail of recent writes plus a list
//! of committed blocks in the block store. Writes upsert into the tail
//! (a later write to the same timestamp wins); when the tail reaches its
//! limit it is committed and the column's rescue points (the full list
//! of its block addresses) are handed back so the facade can persist
//! them. On recovery a column re-opens from exactly those addresses.
//!
//! Read path: committed blocks are overlaid with the tail, so an
//! uncommitted overwrite shadows the block copy of the same timestamp.

use crate::series::{ParamId, Sample, Timestamp};
use crate::storage::blockstore::{BlockStore, LogicAddr};
use crate::storage::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Committed block payload: a sorted run of one series' samples.
#[derive(Debug, Serialize, Deserialize)]
struct BlockPayload {
    id: ParamId,
    samples: Vec<(Timestamp, f64)>,
}

#[derive(Debug, Clone)]
struct BlockInfo {
    addr: LogicAddr,
    min_ts: Timestamp,
    max_ts: Timestamp,
    count: u32,
}

#[derive(Debug, Default)]
struct Column {
    /// Sorted by timestamp; at most `tail_limit` entries.
    tail: Vec<(Timestamp, f64)>,
    blocks: Vec<BlockInfo>,
}

impl Column {
    /// Insert or overwrite. Returns true when an existing tail entry was
    /// replaced.
    fn upsert(&mut self, ts: Timestamp, value: f64) -> bool {
        match self.tail.binary_search_by_key(&ts, |(t, _)| *t) {
            Ok(pos) => {
                self.tail[pos].1 = value;
                true
            }
            Err(pos) => {
                self.tail.insert(pos, (ts, value));
                false
            }
        }
    }

    fn rescue_points(&self) -> Vec<LogicAddr> {
        self.blocks.iter().map(|b| b.addr).collect()
    }
}

/// Outcome of a single write.
#[derive(Debug)]
pub enum WriteOutcome {
    /// Sample landed in the tail.
    Appended,
    /// The tail was committed; the new rescue-point set must be
    /// persisted by the caller.
    TailRotated(Vec<LogicAddr>),
}

/// Tree-per-series column store over a block store.
pub struct ColumnStore {
    columns: RwLock<HashMap<ParamId, Arc<Mutex<Column>>>>,
    bstore: Arc<dyn BlockStore>,
    /// Samples per tail before rotation.
    tail_limit: usize,
    /// Upper bound on a serialized block, dictated by the block store's
    /// page size.
    max_block_bytes: usize,
}

impl ColumnStore {
    pub fn new(bstore: Arc<dyn BlockStore>, tail_limit: usize, max_block_bytes: usize) -> Self {
        Self {
            columns: RwLock::new(HashMap::new()),
            bstore,
            tail_limit: tail_limit.max(1),
            max_block_bytes,
        }
    }

    /// Largest sample run that fits one block: bincode lays a payload
    /// out as id (8) + length (8) + 16 bytes per sample.
    fn samples_per_block(&self) -> usize {
        ((self.max_block_bytes.saturating_sub(16)) / 16).max(1)
    }

    fn column(&self, id: ParamId) -> Arc<Mutex<Column>> {
        if let Some(col) = self.columns.read().get(&id) {
            return Arc::clone(col);
        }
        let mut columns = self.columns.write();
        Arc::clone(columns.entry(id).or_default())
    }

    /// Re-open a series from its persisted rescue points.
    pub fn open_column(&self, id: ParamId, rescue: &[LogicAddr]) -> StorageResult<()> {
        let mut blocks = Vec::with_capacity(rescue.len());
        for &addr in rescue {
            let payload = self.read_payload(addr)?;
            if payload.id != id {
                return Err(StorageError::Corruption(format!(
                    "rescue point {:#x} belongs to series {}, not {}",
                    addr, payload.id, id
                )));
            }
            let min_ts = payload.samples.first().map(|(t, _)| *t).unwrap_or(0);
            let max_ts = payload.samples.last().map(|(t, _)| *t).unwrap_or(0);
            blocks.push(BlockInfo {
                addr,
                min_ts,
                max_ts,
                count: payload.samples.len() as u32,
            });
        }
        let col = self.column(id);
        let mut col = col.lock();
        col.blocks = blocks;
        Ok(())
    }

    fn read_payload(&self, addr: LogicAddr) -> StorageResult<BlockPayload> {
        let bytes = self.bstore.read_block(addr)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Write one data sample. The caller holds no ordering obligations
    /// beyond its own program order; contention on one series is
    /// resolved by the per-column lock.
    pub fn write(&self, sample: &Sample) -> StorageResult<WriteOutcome> {
        let col = self.column(sample.param_id);
        let mut col = col.lock();
        col.upsert(sample.timestamp, sample.value);
        if col.tail.len() >= self.tail_limit {
            let rescue = self.commit_locked(sample.param_id, &mut col)?;
            return Ok(WriteOutcome::TailRotated(rescue));
        }
        Ok(WriteOutcome::Appended)
    }

    /// Upsert used by input-log replay. Returns true if the timestamp
    /// was already present in the tail (a replay collision candidate).
    pub fn replay(&self, id: ParamId, ts: Timestamp, value: f64) -> bool {
        let col = self.column(id);
        let mut col = col.lock();
        col.upsert(ts, value)
    }

    /// Commit one column's tail to the block store and return the
    /// column's full rescue-point list.
    fn commit_locked(&self, id: ParamId, col: &mut Column) -> StorageResult<Vec<LogicAddr>> {
        if col.tail.is_empty() {
            return Ok(col.rescue_points());
        }
        let tail = std::mem::take(&mut col.tail);
        for chunk in tail.chunks(self.samples_per_block()) {
            let payload = BlockPayload {
                id,
                samples: chunk.to_vec(),
            };
            let bytes = bincode::serialize(&payload)?;
            let addr = self.bstore.append_block(&bytes)?;
            col.blocks.push(BlockInfo {
                addr,
                min_ts: chunk[0].0,
                max_ts: chunk[chunk.len() - 1].0,
                count: chunk.len() as u32,
            });
        }
        Ok(col.rescue_points())
    }

    /// Commit a specific set of columns; used by
    /// `close_specific_columns`.
    pub fn commit_columns(&self, ids: &[ParamId]) -> StorageResult<Vec<(ParamId, Vec<LogicAddr>)>> {
        let mut out = Vec::new();
        for &id in ids {
            let col = match self.columns.read().get(&id) {
                Some(col) => Arc::clone(col),
                None => continue,
            };
            let mut col = col.lock();
            if col.tail.is_empty() {
                continue;
            }
            let rescue = self.commit_locked(id, &mut col)?;
            out.push((id, rescue));
        }
        Ok(out)
    }

    /// Commit every dirty tail. Returns the rescue updates to persist.
    pub fn commit_all(&self) -> StorageResult<Vec<(ParamId, Vec<LogicAddr>)>> {
        let ids: Vec<ParamId> = self.columns.read().keys().copied().collect();
        let updates = self.commit_columns(&ids)?;
        self.bstore.flush()?;
        Ok(updates)
    }

    /// Materialize one series over the inclusive range `[min, max]`,
    /// ascending. Blocks are overlaid with the tail so uncommitted
    /// overwrites win.
    fn collect_series(
        &self,
        id: ParamId,
        min: Timestamp,
        max: Timestamp,
    ) -> StorageResult<BTreeMap<Timestamp, f64>> {
        let col = self.column(id);
        let (blocks, tail) = {
            let col = col.lock();
            (col.blocks.clone(), col.tail.clone())
        };

        let mut merged = BTreeMap::new();
        for block in &blocks {
            if block.max_ts < min || block.min_ts > max {
                continue;
            }
            let payload = self.read_payload(block.addr)?;
            for (ts, value) in payload.samples {
                if ts >= min && ts <= max {
                    merged.insert(ts, value);
                }
            }
        }
        for (ts, value) in tail {
            if ts >= min && ts <= max {
                merged.insert(ts, value);
            }
        }
        Ok(merged)
    }

    /// Read one series over `[begin, end]`. Direction follows the bound
    /// order: `begin <= end` is forward, otherwise reversed.
    pub fn read_series(
        &self,
        id: ParamId,
        begin: Timestamp,
        end: Timestamp,
    ) -> StorageResult<Vec<Sample>> {
        let (min, max, forward) = if begin <= end {
            (begin, end, true)
        } else {
            (end, begin, false)
        };
        let merged = self.collect_series(id, min, max)?;
        let mut out: Vec<Sample> = merged
            .into_iter()
            .map(|(ts, value)| Sample::new(id, ts, value))
            .collect();
        if !forward {
            out.reverse();
        }
        Ok(out)
    }

    /// The authoritative rescue-point set for every column that has
    /// committed blocks. Used at close, where the persisted sets must
    /// be complete.
    pub fn all_rescue_points(&self) -> StorageResult<Vec<(ParamId, Vec<LogicAddr>)>> {
        Ok(self
            .columns
            .read()
            .iter()
            .filter_map(|(&id, col)| {
                let rescue = col.lock().rescue_points();
                if rescue.is_empty() {
                    None
                } else {
                    Some((id, rescue))
                }
            })
            .collect())
    }

    /// Tail occupancy per series, for stats.
    pub fn tail_sizes(&self) -> Vec<(ParamId, usize)> {
        self.columns
            .read()
            .iter()
            .map(|(&id, col)| (id, col.lock().tail.len()))
            .collect()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.read().len()
    }
}

/// Per-writer handle onto the column store. Sessions own one; it keeps
/// the facade's write path free of registry-wide locking.
pub struct CStoreSession {
    cstore: Arc<ColumnStore>,
}

impl CStoreSession {
    pub fn new(cstore: Arc<ColumnStore>) -> Self {
        Self { cstore }
    }

    pub fn write(&self, sample: &Sample) -> StorageResult<WriteOutcome> {
        self.cstore.write(sample)
    }
}
