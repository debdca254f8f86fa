//! Prepared statement management and caching.
//!
//! This module provides:
//! - `PreparedStatement`: a compiled statement handle plus its metadata
//! - `StatementCache`: O(1) LRU cache for prepared statements per cursor
//!
//! A prepared statement is stamped with the id of the cursor that compiled
//! it and with the connection's link epoch at compile time. Submitting it
//! through another cursor is a usage error; a handle compiled before a
//! transparent resumption fails distinctly instead of being silently reused.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use uuid::Uuid;

use crate::link::StatementKind;

/// Collapse runs of whitespace so that trivially reformatted statement text
/// maps to the same cache entry.
pub(crate) fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_ws = false;
    for ch in sql.trim().chars() {
        if ch.is_whitespace() {
            in_ws = true;
        } else {
            if in_ws && !out.is_empty() {
                out.push(' ');
            }
            in_ws = false;
            out.push(ch);
        }
    }
    out
}

// ============================================================================
// Prepared Statement
// ============================================================================

/// A statement compiled by the remote server, usable only through the cursor
/// that created it.
#[derive(Debug, Clone)]
pub struct PreparedStatement<S> {
    /// Normalized statement text.
    pub text: String,
    /// Classification reported by the compiler.
    pub kind: StatementKind,
    /// Number of input parameters.
    pub num_params: usize,
    /// Output column names; empty for non-queries.
    pub columns: Vec<String>,
    /// Execution plan description, when available.
    pub plan: Option<String>,
    /// Compiled handle, opaque to this crate.
    pub(crate) handle: S,
    /// Id of the owning cursor. Submission through any other cursor fails.
    pub(crate) cursor_id: Uuid,
    /// Link epoch at compile time; a resumption bumps the connection epoch
    /// and strands every handle compiled before it.
    pub(crate) epoch: u64,
}

impl<S> PreparedStatement<S> {
    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Number of output columns.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// O(1) LRU cache for prepared statements.
///
/// Each cursor maintains its own cache so identical statement text compiles
/// at most once per cursor. Uses the `lru` crate for O(1) get/insert/evict.
///
/// Statements are stored as `Arc<PreparedStatement>` so a cache hit is a
/// reference count increment, not a clone of text and metadata.
pub(crate) struct StatementCache<S> {
    cache: LruCache<String, Arc<PreparedStatement<S>>>,
}

impl<S> StatementCache<S> {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Look up by normalized text and mark the entry recently used.
    pub fn get(&mut self, text: &str) -> Option<Arc<PreparedStatement<S>>> {
        self.cache.get(text).map(Arc::clone)
    }

    /// Insert a freshly compiled statement, evicting the least recently used
    /// entry at capacity.
    pub fn insert(&mut self, statement: Arc<PreparedStatement<S>>) {
        self.cache.put(statement.text.clone(), statement);
    }

    /// Drop an entry, e.g. when its handle went stale across a resumption.
    pub fn remove(&mut self, text: &str) -> Option<Arc<PreparedStatement<S>>> {
        self.cache.pop(text)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Clear all cached statements. Server-side handles are released by the
    /// cursor close path, not here.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::StatementKind;

    fn stmt(text: &str) -> Arc<PreparedStatement<String>> {
        Arc::new(PreparedStatement {
            text: normalize_sql(text),
            kind: StatementKind::Query,
            num_params: 0,
            columns: vec!["n".to_string()],
            plan: None,
            handle: text.to_string(),
            cursor_id: Uuid::new_v4(),
            epoch: 0,
        })
    }

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_sql("  SELECT   1\n\t"), "SELECT 1");
        assert_eq!(normalize_sql("SELECT 1"), "SELECT 1");
        assert_eq!(normalize_sql(""), "");
    }

    #[test]
    fn test_cache_basic_operations() {
        let mut cache = StatementCache::new(10);
        assert!(cache.is_empty());

        cache.insert(stmt("SELECT 1"));
        assert_eq!(cache.len(), 1);

        let found = cache.get("SELECT 1");
        assert!(found.is_some());
        assert_eq!(found.unwrap().columns, vec!["n".to_string()]);

        assert!(cache.get("SELECT 2").is_none());
    }

    #[test]
    fn test_cache_lru_eviction() {
        let mut cache = StatementCache::new(2);

        cache.insert(stmt("q1"));
        cache.insert(stmt("q2"));

        // Touch q1 so q2 becomes least recently used
        cache.get("q1");

        cache.insert(stmt("q3"));

        assert!(cache.get("q1").is_some());
        assert!(cache.get("q2").is_none());
        assert!(cache.get("q3").is_some());
    }

    #[test]
    fn test_cache_remove() {
        let mut cache = StatementCache::new(10);
        cache.insert(stmt("q1"));

        assert!(cache.remove("q1").is_some());
        assert!(cache.get("q1").is_none());
    }

    #[test]
    fn test_returns_rows() {
        let s = stmt("SELECT 1");
        assert!(s.returns_rows());
        assert_eq!(s.num_columns(), 1);
    }
}
