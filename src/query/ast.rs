//! Query request model
//!
//! A parsed query is reshaped into a `ReshapeRequest` (the selection of
//! series ids and time bounds plus grouping and ordering) and a linear
//! list of operator descriptors that the pipeline builder turns into a
//! node chain.

use crate::registry::{SearchPredicate, TransientMatcher};
use crate::series::{ParamId, Timestamp};
use std::collections::HashMap;

/// Base of the transient id space used by group-by. Real ids are
/// allocated monotonically from 1, so the two ranges never meet.
pub const TRANSIENT_ID_BASE: ParamId = 1 << 63;

/// Set of ids returned by the query, defined by select and where
/// clauses. Direction follows the bound order: `begin <= end` scans
/// forward.
#[derive(Debug, Clone)]
pub struct Selection {
    pub ids: Vec<ParamId>,
    pub begin: Timestamp,
    pub end: Timestamp,
}

/// Mapping from persistent series ids to transient (grouped) ids.
#[derive(Debug, Clone, Default)]
pub struct GroupBy {
    pub enabled: bool,
    pub transient_map: HashMap<ParamId, ParamId>,
}

/// Output order of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    /// Each series emitted contiguously.
    Series,
    /// All series merged by timestamp.
    Time,
}

/// What should be sent to the query processor.
#[derive(Debug, Clone)]
pub struct ReshapeRequest {
    pub select: Selection,
    pub group_by: GroupBy,
    pub order_by: OrderBy,
}

/// Aggregation flavors applied per time bucket (or whole range when no
/// time grouping is present).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Sum,
    Mean,
    Min,
    Max,
    Count,
}

impl AggregateFunc {
    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            "sum" => Some(Self::Sum),
            "mean" | "avg" => Some(Self::Mean),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "count" => Some(Self::Count),
            _ => None,
        }
    }
}

/// Value-filter comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl FilterOp {
    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            ">" | "gt" => Some(Self::Gt),
            ">=" | "ge" => Some(Self::Ge),
            "<" | "lt" => Some(Self::Lt),
            "<=" | "le" => Some(Self::Le),
            "==" | "=" | "eq" => Some(Self::Eq),
            _ => None,
        }
    }

    pub fn apply(&self, a: f64, b: f64) -> bool {
        match self {
            Self::Gt => a > b,
            Self::Ge => a >= b,
            Self::Lt => a < b,
            Self::Le => a <= b,
            Self::Eq => (a - b).abs() < f64::EPSILON,
        }
    }
}

/// One operator in the processing chain, outermost last.
#[derive(Debug, Clone)]
pub enum OpDescriptor {
    /// Rewrite series ids through the request's transient map. Requires
    /// the request to carry a group-by; the builder rejects the chain
    /// otherwise.
    GroupByTag,
    /// Bucket the stream by time step, emitting margin markers.
    GroupByTime { step: Timestamp },
    /// Drop data samples whose value fails the comparison.
    Filter { op: FilterOp, value: f64 },
    /// Fold each bucket (or the whole stream) per series.
    Aggregate { func: AggregateFunc },
    /// Rate of change between consecutive samples of a series.
    Derivative,
}

/// A fully parsed query, ready for dispatch.
#[derive(Debug)]
pub enum ParsedQuery {
    /// Column-store scan with an operator chain.
    Scan {
        request: ReshapeRequest,
        ops: Vec<OpDescriptor>,
        /// Present when group-by-tag is active: names for the transient
        /// ids, installed on the session for the query's duration.
        matcher: Option<TransientMatcher>,
    },
    /// Registry-only query (suggest/search); never touches the column
    /// store.
    Metadata { predicate: SearchPredicate },
}
