//! Streaming operator nodes
//!
//! Each operator wraps the next node in the chain and conforms to the
//! `Node` capability set. Every `put` propagates the downstream boolean:
//! false means the consumer is full or cancelled and the source must
//! stop pulling.

use crate::query::ast::{AggregateFunc, FilterOp};
use crate::query::pipeline::{requirements, Node};
use crate::series::{flags, ParamId, Sample, Timestamp};
use crate::storage::error::StorageError;
use std::collections::HashMap;

/// Group-by-time: buckets the stream into `[lower, upper)` windows of
/// `step` and emits margin markers at every boundary crossed. The first
/// non-empty sample aligns the window to `ts / step * step`. Markers
/// carry the (old) upper bound as their timestamp; `complete` closes
/// the final open bucket with a trailing `HI_MARGIN`.
pub struct GroupByTimeNode<'a> {
    step: Timestamp,
    first_hit: bool,
    lower: Timestamp,
    upper: Timestamp,
    next: Box<dyn Node + 'a>,
}

impl<'a> GroupByTimeNode<'a> {
    pub fn new(step: Timestamp, next: Box<dyn Node + 'a>) -> Self {
        Self {
            step,
            first_hit: true,
            lower: 0,
            upper: 0,
            next,
        }
    }
}

impl Node for GroupByTimeNode<'_> {
    fn put(&mut self, sample: Sample) -> bool {
        if self.step == 0 || sample.is_empty() {
            return self.next.put(sample);
        }
        let ts = sample.timestamp;
        if self.first_hit {
            self.first_hit = false;
            let aligned = ts / self.step * self.step;
            self.lower = aligned;
            self.upper = aligned + self.step;
        }
        while ts >= self.upper {
            if !self.next.put(Sample::hi_margin(self.upper)) {
                return false;
            }
            self.lower += self.step;
            self.upper += self.step;
        }
        while ts < self.lower {
            if !self.next.put(Sample::lo_margin(self.upper)) {
                return false;
            }
            self.lower -= self.step;
            self.upper -= self.step;
        }
        self.next.put(sample)
    }

    fn complete(&mut self) {
        if self.step != 0 && !self.first_hit {
            let _ = self.next.put(Sample::hi_margin(self.upper));
        }
        self.next.complete();
    }

    fn set_error(&mut self, error: StorageError) {
        self.next.set_error(error);
    }

    fn requirements(&self) -> u32 {
        requirements::EMPTY
    }
}

/// Group-by-tag: rewrites each data sample's id through the transient
/// map built from the query's tag predicates. Unmapped samples are
/// dropped and counted. Control samples pass through untouched.
pub struct GroupByTagNode<'a> {
    map: HashMap<ParamId, ParamId>,
    dropped: u64,
    next: Box<dyn Node + 'a>,
}

impl<'a> GroupByTagNode<'a> {
    pub fn new(map: HashMap<ParamId, ParamId>, next: Box<dyn Node + 'a>) -> Self {
        Self {
            map,
            dropped: 0,
            next,
        }
    }
}

impl Node for GroupByTagNode<'_> {
    fn put(&mut self, sample: Sample) -> bool {
        if !sample.is_data() {
            return self.next.put(sample);
        }
        match self.map.get(&sample.param_id) {
            Some(&transient) => {
                let mut rewritten = sample;
                rewritten.param_id = transient;
                self.next.put(rewritten)
            }
            None => {
                self.dropped += 1;
                true
            }
        }
    }

    fn complete(&mut self) {
        if self.dropped > 0 {
            tracing::debug!(dropped = self.dropped, "group-by-tag dropped unmapped samples");
        }
        self.next.complete();
    }

    fn set_error(&mut self, error: StorageError) {
        self.next.set_error(error);
    }

    fn requirements(&self) -> u32 {
        requirements::GROUP_BY_REQUIRED
    }
}

/// Value filter: data samples failing the comparison are dropped.
pub struct FilterNode<'a> {
    op: FilterOp,
    value: f64,
    next: Box<dyn Node + 'a>,
}

impl<'a> FilterNode<'a> {
    pub fn new(op: FilterOp, value: f64, next: Box<dyn Node + 'a>) -> Self {
        Self { op, value, next }
    }
}

impl Node for FilterNode<'_> {
    fn put(&mut self, sample: Sample) -> bool {
        if sample.is_data() && !self.op.apply(sample.value, self.value) {
            return true;
        }
        self.next.put(sample)
    }

    fn complete(&mut self) {
        self.next.complete();
    }

    fn set_error(&mut self, error: StorageError) {
        self.next.set_error(error);
    }

    fn requirements(&self) -> u32 {
        requirements::EMPTY
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct AggState {
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
    last_ts: Timestamp,
}

impl AggState {
    fn accumulate(&mut self, sample: &Sample) {
        if self.count == 0 {
            self.min = sample.value;
            self.max = sample.value;
        } else {
            self.min = self.min.min(sample.value);
            self.max = self.max.max(sample.value);
        }
        self.sum += sample.value;
        self.count += 1;
        self.last_ts = sample.timestamp;
    }

    fn finalize(&self, func: AggregateFunc) -> f64 {
        match func {
            AggregateFunc::Sum => self.sum,
            AggregateFunc::Mean => self.sum / self.count as f64,
            AggregateFunc::Min => self.min,
            AggregateFunc::Max => self.max,
            AggregateFunc::Count => self.count as f64,
        }
    }
}

/// Per-series fold. Margin markers finalize the running bucket: one
/// aggregate sample per series is emitted, stamped with the bucket
/// boundary, and the marker itself is swallowed. Without time grouping
/// the whole stream is one bucket, flushed on `complete` and stamped
/// with each series' last contributing timestamp.
pub struct AggregateNode<'a> {
    func: AggregateFunc,
    state: HashMap<ParamId, AggState>,
    next: Box<dyn Node + 'a>,
}

impl<'a> AggregateNode<'a> {
    pub fn new(func: AggregateFunc, next: Box<dyn Node + 'a>) -> Self {
        Self {
            func,
            state: HashMap::new(),
            next,
        }
    }

    fn flush(&mut self, boundary: Option<Timestamp>) -> bool {
        let mut ids: Vec<ParamId> = self.state.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let agg = self.state.remove(&id).unwrap();
            let ts = boundary.unwrap_or(agg.last_ts);
            if !self.next.put(Sample::new(id, ts, agg.finalize(self.func))) {
                return false;
            }
        }
        true
    }
}

impl Node for AggregateNode<'_> {
    fn put(&mut self, sample: Sample) -> bool {
        if sample.is_data() {
            self.state.entry(sample.param_id).or_default().accumulate(&sample);
            return true;
        }
        if sample.is_margin() {
            return self.flush(Some(sample.timestamp));
        }
        // Empty flush marker: drain state, then forward it.
        if !self.flush(None) {
            return false;
        }
        self.next.put(sample)
    }

    fn complete(&mut self) {
        let _ = self.flush(None);
        self.next.complete();
    }

    fn set_error(&mut self, error: StorageError) {
        self.next.set_error(error);
    }

    fn requirements(&self) -> u32 {
        requirements::EMPTY
    }
}

/// Rate of change between consecutive samples of a series. The first
/// sample of each series is absorbed; control samples pass through.
pub struct DerivativeNode<'a> {
    prev: HashMap<ParamId, (Timestamp, f64)>,
    next: Box<dyn Node + 'a>,
}

impl<'a> DerivativeNode<'a> {
    pub fn new(next: Box<dyn Node + 'a>) -> Self {
        Self {
            prev: HashMap::new(),
            next,
        }
    }
}

impl Node for DerivativeNode<'_> {
    fn put(&mut self, sample: Sample) -> bool {
        if !sample.is_data() {
            return self.next.put(sample);
        }
        match self.prev.insert(sample.param_id, (sample.timestamp, sample.value)) {
            Some((prev_ts, prev_value)) if sample.timestamp != prev_ts => {
                let dt = sample.timestamp.abs_diff(prev_ts) as f64;
                let rate = (sample.value - prev_value) / dt;
                self.next.put(Sample::new(sample.param_id, sample.timestamp, rate))
            }
            _ => true,
        }
    }

    fn complete(&mut self) {
        self.next.complete();
    }

    fn set_error(&mut self, error: StorageError) {
        self.next.set_error(error);
    }

    fn requirements(&self) -> u32 {
        requirements::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::cursor::VecCursor;
    use crate::query::pipeline::CursorNode;

    fn drive(root: &mut dyn Node, input: &[Sample]) {
        for &s in input {
            if !root.put(s) {
                return;
            }
        }
        root.complete();
    }

    fn hi_margins(cursor: &VecCursor) -> Vec<Timestamp> {
        cursor
            .samples
            .iter()
            .filter(|s| s.flags & flags::HI_MARGIN != 0)
            .map(|s| s.timestamp)
            .collect()
    }

    #[test]
    fn test_group_by_time_margins() {
        let mut cursor = VecCursor::new();
        let input: Vec<Sample> = [3u64, 7, 12, 19, 23]
            .iter()
            .map(|&ts| Sample::new(1, ts, 1.0))
            .collect();
        {
            let mut root = GroupByTimeNode::new(10, Box::new(CursorNode::new(&mut cursor)));
            drive(&mut root, &input);
        }

        assert_eq!(hi_margins(&cursor), vec![10, 20, 30]);
        assert_eq!(cursor.data().len(), 5);
        assert!(cursor.completed);
    }

    #[test]
    fn test_group_by_time_sparse_stream_emits_marker_per_step() {
        let mut cursor = VecCursor::new();
        let input = [Sample::new(1, 5, 1.0), Sample::new(1, 35, 2.0)];
        {
            let mut root = GroupByTimeNode::new(10, Box::new(CursorNode::new(&mut cursor)));
            drive(&mut root, &input);
        }
        // Window walks 10, 20, 30 before admitting ts=35; complete closes
        // at 40.
        assert_eq!(hi_margins(&cursor), vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_group_by_time_backward_stream() {
        let mut cursor = VecCursor::new();
        let input = [Sample::new(1, 25, 1.0), Sample::new(1, 12, 2.0)];
        {
            let mut root = GroupByTimeNode::new(10, Box::new(CursorNode::new(&mut cursor)));
            drive(&mut root, &input);
        }

        let lo: Vec<Timestamp> = cursor
            .samples
            .iter()
            .filter(|s| s.flags & flags::LO_MARGIN != 0)
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(lo, vec![30]);
    }

    #[test]
    fn test_group_by_time_bucket_partition_law() {
        // Markers partition output into contiguous segments whose
        // timestamps lie in [lower, upper).
        let mut cursor = VecCursor::new();
        let input: Vec<Sample> = (0..50u64).map(|ts| Sample::new(1, ts * 3, 1.0)).collect();
        {
            let mut root = GroupByTimeNode::new(30, Box::new(CursorNode::new(&mut cursor)));
            drive(&mut root, &input);
        }

        let mut upper = None;
        for s in cursor.samples.iter().rev() {
            if s.flags & flags::HI_MARGIN != 0 {
                upper = Some(s.timestamp);
            } else if let Some(u) = upper {
                assert!(s.timestamp < u, "ts {} not below bucket upper {}", s.timestamp, u);
                assert!(s.timestamp >= u - 30);
            }
        }
    }

    #[test]
    fn test_group_by_tag_rewrites_and_drops() {
        let mut cursor = VecCursor::new();
        let map: HashMap<ParamId, ParamId> = [(1, 100), (2, 100)].into_iter().collect();
        let input = [
            Sample::new(1, 10, 1.0),
            Sample::new(2, 11, 2.0),
            Sample::new(3, 12, 3.0), // unmapped
        ];
        {
            let mut root = GroupByTagNode::new(map, Box::new(CursorNode::new(&mut cursor)));
            drive(&mut root, &input);
        }

        assert_eq!(cursor.data().len(), 2);
        assert!(cursor.data().iter().all(|s| s.param_id == 100));
    }

    #[test]
    fn test_filter_drops_failing_values() {
        let mut cursor = VecCursor::new();
        let input = [
            Sample::new(1, 1, 1.0),
            Sample::new(1, 2, 5.0),
            Sample::new(1, 3, 9.0),
        ];
        {
            let mut root =
                FilterNode::new(FilterOp::Gt, 4.0, Box::new(CursorNode::new(&mut cursor)));
            drive(&mut root, &input);
        }
        let values: Vec<f64> = cursor.data().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![5.0, 9.0]);
    }

    #[test]
    fn test_aggregate_per_bucket() {
        let mut cursor = VecCursor::new();
        let input: Vec<Sample> = [(3u64, 1.0), (7, 3.0), (12, 10.0), (19, 20.0)]
            .iter()
            .map(|&(ts, v)| Sample::new(1, ts, v))
            .collect();
        {
            let agg = AggregateNode::new(AggregateFunc::Sum, Box::new(CursorNode::new(&mut cursor)));
            let mut root = GroupByTimeNode::new(10, Box::new(agg));
            drive(&mut root, &input);
        }

        // Bucket [0,10) sums to 4, [10,20) sums to 30; markers swallowed.
        let out = cursor.data();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value, 4.0);
        assert_eq!(out[0].timestamp, 10);
        assert_eq!(out[1].value, 30.0);
        assert_eq!(out[1].timestamp, 20);
    }

    #[test]
    fn test_aggregate_whole_stream_without_buckets() {
        let mut cursor = VecCursor::new();
        let input = [
            Sample::new(1, 1, 2.0),
            Sample::new(1, 2, 4.0),
            Sample::new(2, 3, 10.0),
        ];
        {
            let mut root =
                AggregateNode::new(AggregateFunc::Mean, Box::new(CursorNode::new(&mut cursor)));
            drive(&mut root, &input);
        }
        let out = cursor.data();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].param_id, 1);
        assert_eq!(out[0].value, 3.0);
        assert_eq!(out[0].timestamp, 2);
        assert_eq!(out[1].param_id, 2);
        assert_eq!(out[1].value, 10.0);
    }

    #[test]
    fn test_derivative() {
        let mut cursor = VecCursor::new();
        let input = [
            Sample::new(1, 10, 100.0),
            Sample::new(1, 20, 150.0),
            Sample::new(1, 30, 130.0),
        ];
        {
            let mut root = DerivativeNode::new(Box::new(CursorNode::new(&mut cursor)));
            drive(&mut root, &input);
        }
        let out = cursor.data();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value, 5.0);
        assert_eq!(out[1].value, -2.0);
    }

    #[test]
    fn test_backpressure_propagates_through_operators() {
        let mut cursor = VecCursor::with_limit(2);
        {
            let terminal: Box<dyn Node + '_> = Box::new(CursorNode::new(&mut cursor));
            let mut root = GroupByTimeNode::new(10, terminal);
            let mut delivered = 0;
            for ts in 0..100u64 {
                if !root.put(Sample::new(1, ts, 1.0)) {
                    break;
                }
                delivered += 1;
            }
            assert!(delivered < 100);
        }
        assert_eq!(cursor.samples.len(), 2);
        assert!(!cursor.completed);
    }
}
