//! Series name registry
//!
//! Process-wide interning of canonical series names:
//! - `SeriesRegistry`: the authoritative global table, read-mostly, with
//!   monotonic `ParamId` allocation. Writers serialize on the table's
//!   write lock; readers share.
//! - `LocalRegistry`: a per-session cache of ids the session has already
//!   observed. Populated lazily, never allocates.
//! - `TransientMatcher`: a scoped override installed during query
//!   execution so that consumers resolving ids see query-local names
//!   (e.g. tag-grouped labels).
//!
//! Invariant: canonical string and id map 1:1 for the lifetime of the
//! database; ids are never reused.

use crate::series::{ParamId, SeriesName};
use crate::storage::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;

/// Where a resolved id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Already present in the session-local cache.
    Local,
    /// Found in the global table; the local cache was updated.
    Global,
    /// Newly allocated; the caller must emit a series declaration to the
    /// input log before acknowledging the write.
    Created,
}

/// Predicate used by suggest/search queries.
///
/// This enum is the extensibility point for the metadata query surface;
/// new predicate shapes are added here and mapped from the query grammar.
#[derive(Debug, Clone)]
pub enum SearchPredicate {
    /// Metric name starts with the given prefix.
    MetricStartsWith(String),
    /// Series carries the tag with exactly this value.
    TagEquals { key: String, value: String },
    /// Series carries the tag and its value matches the regex.
    TagRegex { key: String, pattern: Regex },
    /// All of the inner predicates hold.
    All(Vec<SearchPredicate>),
}

impl SearchPredicate {
    pub fn matches(&self, name: &SeriesName) -> bool {
        match self {
            SearchPredicate::MetricStartsWith(prefix) => name.metric.starts_with(prefix.as_str()),
            SearchPredicate::TagEquals { key, value } => name.tag(key) == Some(value.as_str()),
            SearchPredicate::TagRegex { key, pattern } => {
                name.tag(key).map(|v| pattern.is_match(v)).unwrap_or(false)
            }
            SearchPredicate::All(preds) => preds.iter().all(|p| p.matches(name)),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    by_name: HashMap<String, ParamId>,
    by_id: HashMap<ParamId, String>,
    next_id: ParamId,
}

/// Authoritative global series table.
#[derive(Debug)]
pub struct SeriesRegistry {
    inner: RwLock<Inner>,
}

impl Default for SeriesRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_name: HashMap::new(),
                by_id: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Install a known `(id, name)` pair, used when loading the metadata
    /// snapshot and when replaying series declarations from the input
    /// log. Idempotent by id; keeps id allocation monotonic.
    pub fn insert_known(&self, id: ParamId, canonical: &str) {
        let mut inner = self.inner.write();
        inner.by_name.entry(canonical.to_string()).or_insert(id);
        inner.by_id.entry(id).or_insert_with(|| canonical.to_string());
        if id >= inner.next_id {
            inner.next_id = id + 1;
        }
    }

    /// Look up an id without allocating.
    pub fn get_id(&self, canonical: &str) -> Option<ParamId> {
        self.inner.read().by_name.get(canonical).copied()
    }

    /// Look up or allocate. Returns the id and whether it was created.
    pub fn get_or_create(&self, canonical: &str) -> (ParamId, bool) {
        if let Some(id) = self.get_id(canonical) {
            return (id, false);
        }
        let mut inner = self.inner.write();
        // Racing writer may have inserted between the read and the write
        // lock; re-check under the exclusive guard.
        if let Some(&id) = inner.by_name.get(canonical) {
            return (id, false);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.by_name.insert(canonical.to_string(), id);
        inner.by_id.insert(id, canonical.to_string());
        (id, true)
    }

    /// Canonical name of a series.
    pub fn name_of(&self, id: ParamId) -> Option<String> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the whole dictionary, sorted by id. Used by the sync
    /// worker to persist newly created series.
    pub fn snapshot(&self) -> Vec<(ParamId, String)> {
        let inner = self.inner.read();
        let mut out: Vec<_> = inner.by_id.iter().map(|(&id, n)| (id, n.clone())).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Series whose metric starts with `prefix`, sorted by name.
    pub fn suggest(&self, prefix: &str) -> Vec<(ParamId, String)> {
        self.search(&SearchPredicate::MetricStartsWith(prefix.to_string()))
    }

    /// Series matching `predicate`, sorted by name.
    pub fn search(&self, predicate: &SearchPredicate) -> Vec<(ParamId, String)> {
        let inner = self.inner.read();
        let mut out: Vec<(ParamId, String)> = inner
            .by_name
            .iter()
            .filter(|(name, _)| {
                SeriesName::parse(name)
                    .map(|parsed| predicate.matches(&parsed))
                    .unwrap_or(false)
            })
            .map(|(name, &id)| (id, name.clone()))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1));
        out
    }
}

/// Per-session cache of observed series. Never allocates ids.
#[derive(Debug, Default)]
pub struct LocalRegistry {
    by_name: HashMap<String, ParamId>,
    by_id: HashMap<ParamId, String>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_id(&self, canonical: &str) -> Option<ParamId> {
        self.by_name.get(canonical).copied()
    }

    pub fn name_of(&self, id: ParamId) -> Option<&str> {
        self.by_id.get(&id).map(|s| s.as_str())
    }

    pub fn insert(&mut self, id: ParamId, canonical: &str) {
        self.by_name.insert(canonical.to_string(), id);
        self.by_id.insert(id, canonical.to_string());
    }

    /// Resolve a canonical name through the cache hierarchy. On a global
    /// miss a fresh id is allocated; the caller is responsible for
    /// logging the declaration.
    pub fn resolve(&mut self, canonical: &str, global: &SeriesRegistry) -> (ParamId, ResolveOutcome) {
        if let Some(id) = self.get_id(canonical) {
            return (id, ResolveOutcome::Local);
        }
        let (id, created) = global.get_or_create(canonical);
        self.insert(id, canonical);
        let outcome = if created {
            ResolveOutcome::Created
        } else {
            ResolveOutcome::Global
        };
        (id, outcome)
    }
}

/// Query-scoped name override: maps transient ids (produced by group-by)
/// to the labels downstream consumers should see.
#[derive(Debug, Default)]
pub struct TransientMatcher {
    by_id: HashMap<ParamId, String>,
}

impl TransientMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ParamId, name: String) {
        self.by_id.insert(id, name);
    }

    pub fn name_of(&self, id: ParamId) -> Option<&str> {
        self.by_id.get(&id).map(|s| s.as_str())
    }

    pub fn ids(&self) -> impl Iterator<Item = (ParamId, &str)> {
        self.by_id.iter().map(|(&id, n)| (id, n.as_str()))
    }
}

/// Convenience for the write path: canonicalize + resolve, mapping parse
/// failures to `BadInput`.
pub fn resolve_raw(
    raw: &str,
    local: &mut LocalRegistry,
    global: &SeriesRegistry,
) -> StorageResult<(ParamId, ResolveOutcome)> {
    let canonical = SeriesName::parse(raw)?.canonical();
    Ok(local.resolve(&canonical, global))
}
