//! Core sample model and series-name handling
//!
//! This module defines the fundamental types used throughout the engine:
//! - `Sample`: a single tagged numeric measurement
//! - `SeriesName`: parsed `(metric, tags)` form of a series
//! - canonicalization and joined-name expansion
//!
//! A series is identified by its canonical string: the metric name followed
//! by `key=value` tag pairs sorted lexicographically by key, separated by
//! single spaces. The canonical string maps 1:1 to a `ParamId` for the
//! lifetime of the database.

use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};

/// Dense integer identity of a series.
pub type ParamId = u64;

/// Timestamp in engine units (nanoseconds by convention; the engine is
/// agnostic as long as callers are consistent).
pub type Timestamp = u64;

/// Payload flag bits carried by in-band control samples.
pub mod flags {
    /// Sample carries no data; used to flush pending operator state.
    pub const EMPTY: u16 = 0x01;
    /// Time-bucket boundary marker emitted when a window moves backward.
    pub const LO_MARGIN: u16 = 0x02;
    /// Time-bucket boundary marker emitted when a window moves forward.
    pub const HI_MARGIN: u16 = 0x04;
}

/// A single time-series measurement
///
/// `param_id` refers to a series registered in the name registry. Control
/// samples (margins, empty) travel the same channel as data samples and
/// are distinguished by `flags`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub param_id: ParamId,
    pub timestamp: Timestamp,
    pub value: f64,
    #[serde(default)]
    pub flags: u16,
}

impl Sample {
    /// Create a data sample.
    pub fn new(param_id: ParamId, timestamp: Timestamp, value: f64) -> Self {
        Self {
            param_id,
            timestamp,
            value,
            flags: 0,
        }
    }

    /// Create an empty (flush) sample.
    pub fn empty() -> Self {
        Self {
            param_id: 0,
            timestamp: 0,
            value: 0.0,
            flags: flags::EMPTY,
        }
    }

    /// Bucket-boundary marker for a forward window advance.
    pub fn hi_margin(timestamp: Timestamp) -> Self {
        Self {
            param_id: 0,
            timestamp,
            value: 0.0,
            flags: flags::HI_MARGIN,
        }
    }

    /// Bucket-boundary marker for a backward window advance.
    pub fn lo_margin(timestamp: Timestamp) -> Self {
        Self {
            param_id: 0,
            timestamp,
            value: 0.0,
            flags: flags::LO_MARGIN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flags & flags::EMPTY != 0
    }

    pub fn is_margin(&self) -> bool {
        self.flags & (flags::LO_MARGIN | flags::HI_MARGIN) != 0
    }

    /// True for ordinary measurements (no control bits set).
    pub fn is_data(&self) -> bool {
        self.flags == 0
    }
}

/// Parsed series name: metric plus tag set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesName {
    pub metric: String,
    /// Sorted lexicographically by key.
    pub tags: Vec<(String, String)>,
}

impl SeriesName {
    /// Parse a raw series name into its canonical components.
    ///
    /// Accepts arbitrary interior whitespace between tokens. The metric
    /// token must not contain `=`; every subsequent token must be a
    /// `key=value` pair with non-empty key and value.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let mut tokens = raw.split_whitespace();
        let metric = tokens
            .next()
            .ok_or_else(|| StorageError::BadInput("empty series name".into()))?;
        if metric.contains('=') {
            return Err(StorageError::BadInput(format!(
                "series name starts with a tag, no metric: '{}'",
                raw
            )));
        }

        let mut tags = Vec::new();
        for tok in tokens {
            let (key, value) = tok.split_once('=').ok_or_else(|| {
                StorageError::BadInput(format!("malformed tag '{}' in '{}'", tok, raw))
            })?;
            if key.is_empty() || value.is_empty() {
                return Err(StorageError::BadInput(format!(
                    "empty tag key or value in '{}'",
                    raw
                )));
            }
            tags.push((key.to_string(), value.to_string()));
        }
        tags.sort();

        Ok(Self {
            metric: metric.to_string(),
            tags,
        })
    }

    /// Render the canonical string form: `metric tag1=v1 tag2=v2`.
    pub fn canonical(&self) -> String {
        let mut out = self.metric.clone();
        for (k, v) in &self.tags {
            out.push(' ');
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    /// Value of a tag, if present.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse and canonicalize a raw series name in one step.
pub fn canonicalize(raw: &str) -> StorageResult<String> {
    Ok(SeriesName::parse(raw)?.canonical())
}

/// Expand a joined series name into its component canonical names.
///
/// `a:b:c tag=v` denotes the cross product `{a tag=v, b tag=v, c tag=v}`;
/// the result preserves input order. Fails with `BadInput` if any sub-name
/// carries its own tags.
pub fn expand_joined(raw: &str) -> StorageResult<Vec<String>> {
    let trimmed = raw.trim();
    let (head, rest) = match trimmed.find(char::is_whitespace) {
        Some(pos) => (&trimmed[..pos], &trimmed[pos..]),
        None => (trimmed, ""),
    };
    if head.is_empty() {
        return Err(StorageError::BadInput("empty series name".into()));
    }

    let mut out = Vec::new();
    for sub in head.split(':') {
        if sub.is_empty() || sub.contains('=') {
            return Err(StorageError::BadInput(format!(
                "invalid metric '{}' in joined name '{}'",
                sub, raw
            )));
        }
        out.push(canonicalize(&format!("{}{}", sub, rest))?);
    }
    Ok(out)
}
