//! Operator pipeline
//!
//! A query executes as a linear chain of `Node`s built bottom-up from
//! the parsed operator list; the root is the node closest to the data
//! source and ownership runs top-down (each node owns the next). The
//! terminal node writes into the caller's `InternalCursor`.
//!
//! Three processor flavors drive the chain:
//! - scan: iterates the column store over `ids x [begin, end]`
//! - metadata: iterates the name registry, never touching the column
//!   store
//! - aggregate/derivative: a scan with extra operator nodes inserted
//!   before the terminal

use crate::query::ast::{OpDescriptor, OrderBy, ParsedQuery, ReshapeRequest};
use crate::query::cursor::InternalCursor;
use crate::query::operators::{
    AggregateNode, DerivativeNode, FilterNode, GroupByTagNode, GroupByTimeNode,
};
use crate::registry::SearchPredicate;
use crate::series::{flags, ParamId, Sample};
use crate::storage::column::ColumnStore;
use crate::storage::error::{StorageError, StorageResult};

/// Capability flags a node declares; the builder validates the chain
/// against them.
pub mod requirements {
    pub const EMPTY: u32 = 0;
    /// Node only makes sense when the request carries a group-by map.
    pub const GROUP_BY_REQUIRED: u32 = 1;
    /// Node sits at the end of the chain.
    pub const TERMINAL: u32 = 2;
}

/// One stage of the operator chain.
pub trait Node {
    /// Process a sample; false interrupts the stream (downstream full or
    /// cancelled).
    fn put(&mut self, sample: Sample) -> bool;

    /// Complete adding values; drains residual operator state.
    fn complete(&mut self);

    /// Short-circuit the chain with an error, forwarded to the cursor.
    fn set_error(&mut self, error: StorageError);

    /// Capability flags for chain validation.
    fn requirements(&self) -> u32;
}

/// Terminal node: hands samples to the caller-supplied cursor. Once the
/// cursor refuses a sample, nothing further is delivered to it.
pub struct CursorNode<'a> {
    cursor: &'a mut dyn InternalCursor,
    halted: bool,
}

impl<'a> CursorNode<'a> {
    pub fn new(cursor: &'a mut dyn InternalCursor) -> Self {
        Self {
            cursor,
            halted: false,
        }
    }
}

impl Node for CursorNode<'_> {
    fn put(&mut self, sample: Sample) -> bool {
        if self.halted {
            return false;
        }
        if !self.cursor.put(sample) {
            self.halted = true;
            return false;
        }
        true
    }

    fn complete(&mut self) {
        if !self.halted {
            self.cursor.complete();
        }
    }

    fn set_error(&mut self, error: StorageError) {
        self.cursor.set_error(error);
    }

    fn requirements(&self) -> u32 {
        requirements::TERMINAL
    }
}

/// Build the node chain for a scan request, bottom-up. Each node's
/// declared requirements are checked as it is constructed: an operator
/// that demands a group-by (the tag rewrite) is rejected when the
/// request carries none.
pub fn build_chain<'a>(
    request: &ReshapeRequest,
    ops: &[OpDescriptor],
    cursor: &'a mut dyn InternalCursor,
) -> StorageResult<Box<dyn Node + 'a>> {
    let mut node: Box<dyn Node + 'a> = Box::new(CursorNode::new(cursor));

    for op in ops.iter().rev() {
        node = match op {
            OpDescriptor::GroupByTag => Box::new(GroupByTagNode::new(
                request.group_by.transient_map.clone(),
                node,
            )),
            OpDescriptor::GroupByTime { step } => Box::new(GroupByTimeNode::new(*step, node)),
            OpDescriptor::Filter { op, value } => Box::new(FilterNode::new(*op, *value, node)),
            OpDescriptor::Aggregate { func } => Box::new(AggregateNode::new(*func, node)),
            OpDescriptor::Derivative => Box::new(DerivativeNode::new(node)),
        };
        if node.requirements() & requirements::GROUP_BY_REQUIRED != 0 && !request.group_by.enabled {
            return Err(StorageError::BadInput(
                "operator requires a group-by clause".into(),
            ));
        }
    }
    Ok(node)
}

/// Pump one scan through the chain. Stops at the first refusal from
/// downstream (cancellation, not an error: `complete` is skipped and
/// the call succeeds). Read failures short-circuit via `set_error`.
pub fn run_scan(
    cstore: &ColumnStore,
    request: &ReshapeRequest,
    root: &mut dyn Node,
) -> StorageResult<()> {
    let sel = &request.select;
    let forward = sel.begin <= sel.end;

    let mut runs: Vec<Vec<Sample>> = Vec::with_capacity(sel.ids.len());
    for &id in &sel.ids {
        match cstore.read_series(id, sel.begin, sel.end) {
            Ok(samples) => runs.push(samples),
            Err(e) => {
                root.set_error(e.duplicate());
                return Err(e);
            }
        }
    }

    match request.order_by {
        OrderBy::Series => {
            for run in runs {
                for sample in run {
                    if !root.put(sample) {
                        return Ok(());
                    }
                }
            }
        }
        OrderBy::Time => {
            let mut merged: Vec<Sample> = runs.into_iter().flatten().collect();
            // Stable sort keeps series order for equal timestamps.
            if forward {
                merged.sort_by_key(|s| s.timestamp);
            } else {
                merged.sort_by_key(|s| std::cmp::Reverse(s.timestamp));
            }
            for sample in merged {
                if !root.put(sample) {
                    return Ok(());
                }
            }
        }
    }

    root.complete();
    Ok(())
}

/// Pump a metadata query: one synthetic sample per matching series,
/// carrying the series id. Consumers resolve names through the session,
/// where any transient matcher applies.
pub fn run_metadata(entries: &[(ParamId, String)], root: &mut dyn Node) -> StorageResult<()> {
    for (id, _) in entries {
        let sample = Sample {
            param_id: *id,
            timestamp: 0,
            value: 0.0,
            flags: flags::EMPTY,
        };
        if !root.put(sample) {
            return Ok(());
        }
    }
    root.complete();
    Ok(())
}

/// Dispatch a parsed query against the column store and registry view.
/// The session layer owns matcher installation; this function only
/// builds and drives the chain.
pub fn execute(
    cstore: &ColumnStore,
    metadata_entries: impl FnOnce(&SearchPredicate) -> Vec<(ParamId, String)>,
    parsed: &ParsedQuery,
    cursor: &mut dyn InternalCursor,
) -> StorageResult<()> {
    match parsed {
        ParsedQuery::Scan { request, ops, .. } => {
            let mut root = build_chain(request, ops, cursor)?;
            run_scan(cstore, request, root.as_mut())
        }
        ParsedQuery::Metadata { predicate } => {
            let entries = metadata_entries(predicate);
            let mut root: Box<dyn Node + '_> = Box::new(CursorNode::new(cursor));
            run_metadata(&entries, root.as_mut())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{GroupBy, Selection};
    use crate::query::cursor::VecCursor;
    use crate::storage::blockstore::MemoryBlockStore;
    use std::sync::Arc;

    fn scan_request(ids: Vec<ParamId>, begin: u64, end: u64, order_by: OrderBy) -> ReshapeRequest {
        ReshapeRequest {
            select: Selection { ids, begin, end },
            group_by: GroupBy::default(),
            order_by,
        }
    }

    fn seeded_store() -> ColumnStore {
        let store = ColumnStore::new(Arc::new(MemoryBlockStore::new()), 100, 4096);
        for (id, ts, v) in [(1u64, 10u64, 1.0), (2, 11, 2.0), (1, 20, 3.0), (2, 5, 4.0)] {
            store.write(&Sample::new(id, ts, v)).unwrap();
        }
        store
    }

    #[test]
    fn test_scan_order_by_time_merges_series() {
        let store = seeded_store();
        let mut cursor = VecCursor::new();
        let request = scan_request(vec![1, 2], 0, 100, OrderBy::Time);
        let mut root = build_chain(&request, &[], &mut cursor).unwrap();
        run_scan(&store, &request, root.as_mut()).unwrap();
        drop(root);

        let ts: Vec<u64> = cursor.data().iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![5, 10, 11, 20]);
        assert!(cursor.completed);
    }

    #[test]
    fn test_scan_order_by_series_is_contiguous() {
        let store = seeded_store();
        let mut cursor = VecCursor::new();
        let request = scan_request(vec![1, 2], 0, 100, OrderBy::Series);
        let mut root = build_chain(&request, &[], &mut cursor).unwrap();
        run_scan(&store, &request, root.as_mut()).unwrap();
        drop(root);

        let ids: Vec<ParamId> = cursor.data().iter().map(|s| s.param_id).collect();
        assert_eq!(ids, vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_scan_backward_direction() {
        let store = seeded_store();
        let mut cursor = VecCursor::new();
        let request = scan_request(vec![1, 2], 100, 0, OrderBy::Time);
        let mut root = build_chain(&request, &[], &mut cursor).unwrap();
        run_scan(&store, &request, root.as_mut()).unwrap();
        drop(root);

        let ts: Vec<u64> = cursor.data().iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![20, 11, 10, 5]);
    }

    #[test]
    fn test_backpressure_halts_without_complete() {
        let store = seeded_store();
        let mut cursor = VecCursor::with_limit(3);
        let request = scan_request(vec![1, 2], 0, 100, OrderBy::Time);
        let mut root = build_chain(&request, &[], &mut cursor).unwrap();
        run_scan(&store, &request, root.as_mut()).unwrap();
        drop(root);

        assert_eq!(cursor.samples.len(), 3);
        assert!(!cursor.completed);
        assert!(cursor.error.is_none());
    }

    #[test]
    fn test_group_by_chain_rewrites_ids() {
        let store = seeded_store();
        let mut cursor = VecCursor::new();
        let mut request = scan_request(vec![1, 2], 0, 100, OrderBy::Time);
        request.group_by.enabled = true;
        request.group_by.transient_map = [(1, 500), (2, 500)].into_iter().collect();

        let mut root =
            build_chain(&request, &[OpDescriptor::GroupByTag], &mut cursor).unwrap();
        run_scan(&store, &request, root.as_mut()).unwrap();
        drop(root);

        let data = cursor.data();
        assert_eq!(data.len(), 4);
        assert!(data.iter().all(|s| s.param_id == 500));
    }

    #[test]
    fn test_group_by_required_rejected_without_map() {
        // The tag rewrite declares GROUP_BY_REQUIRED; a request without
        // an enabled group-by must not build.
        let request = scan_request(vec![1], 0, 100, OrderBy::Series);
        let mut cursor = VecCursor::new();
        let err = match build_chain(&request, &[OpDescriptor::GroupByTag], &mut cursor) {
            Err(e) => e,
            Ok(_) => panic!("expected build_chain to fail"),
        };
        assert!(matches!(err, StorageError::BadInput(_)));
    }

    #[test]
    fn test_metadata_query_emits_ids() {
        let mut cursor = VecCursor::new();
        let entries = vec![(1, "cpu host=a".to_string()), (2, "cpu host=b".to_string())];
        let mut root: Box<dyn Node + '_> = Box::new(CursorNode::new(&mut cursor));
        run_metadata(&entries, root.as_mut()).unwrap();
        drop(root);

        assert_eq!(cursor.samples.len(), 2);
        assert_eq!(cursor.samples[0].param_id, 1);
        assert_eq!(cursor.samples[1].param_id, 2);
        assert!(cursor.completed);
    }
}
