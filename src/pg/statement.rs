//! Prepared statement management and caching.
//!
//! This module provides:
//! - `PreparedStatement`: a named, server-side prepared command
//! - `StatementRegistry`: which names are registered on the current transport,
//!   and which handles callers still hold
//! - `StatementCache`: O(1) LRU of statements keyed by command text

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::transport::Reply;

/// Prefix of every generated statement name.
pub const STATEMENT_NAME_PREFIX: &str = "__pgkit_";

/// Default number of statements kept by `StatementCache`.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A prepared statement handle.
///
/// The name is generated once, when the handle is created, and is unique for
/// the lifetime of the process. Registering it with the server is deferred
/// to the first `ensure` on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreparedStatement {
    /// Server-side name (e.g. "__pgkit_3f2a...")
    pub name: String,
    /// The command text
    pub query: String,
}

impl PreparedStatement {
    /// Create a handle for `query` under a freshly generated name.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            name: generate_name(),
            query: query.into(),
        }
    }

    /// Create a handle under an explicit name.
    pub fn with_name(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
        }
    }
}

fn generate_name() -> String {
    format!("{}{}", STATEMENT_NAME_PREFIX, uuid::Uuid::new_v4().simple())
}

/// Interpret the reply to a prepare command. On failure the server's error
/// text is returned unmodified; `fallback` supplies it when the reply itself
/// carries none.
pub(crate) fn prepare_outcome(
    reply: Reply,
    fallback: impl FnOnce() -> String,
) -> std::result::Result<(), String> {
    match reply {
        Reply::CommandOk => Ok(()),
        Reply::Error(text) => Err(text),
        Reply::TuplesOk | Reply::SingleTuple(_) => Err(fallback()),
    }
}

// ============================================================================
// Statement Registry
// ============================================================================

/// Names registered with the server on the current transport, plus the
/// handles callers have been given and not yet released.
#[derive(Debug, Default)]
pub struct StatementRegistry {
    registered: HashSet<String>,
    handles: HashSet<String>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_registered(&self, name: &str) -> bool {
        self.registered.contains(name)
    }

    pub fn mark_registered(&mut self, name: &str) {
        self.registered.insert(name.to_string());
    }

    pub fn add_handle(&mut self, name: &str) {
        self.handles.insert(name.to_string());
    }

    /// Forget a caller-visible handle. The server-side registration stays.
    pub fn release_handle(&mut self, name: &str) -> bool {
        self.handles.remove(name)
    }

    #[inline]
    pub fn has_handle(&self, name: &str) -> bool {
        self.handles.contains(name)
    }

    /// Drop a server-side registration. Returns whether it was registered.
    pub fn forget(&mut self, name: &str) -> bool {
        self.handles.remove(name);
        self.registered.remove(name)
    }

    pub fn registered_len(&self) -> usize {
        self.registered.len()
    }

    /// Forget everything; used when the transport is replaced or closed.
    pub fn clear(&mut self) {
        self.registered.clear();
        self.handles.clear();
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// O(1) LRU cache of prepared statements keyed by command text.
///
/// Statements are stored as `Arc<PreparedStatement>` so a hit is a reference
/// count increment.
pub struct StatementCache {
    cache: LruCache<String, Arc<PreparedStatement>>,
}

impl StatementCache {
    /// Create a new statement cache with the given capacity (at least one).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Look up a statement and mark it as recently used.
    pub fn get_and_touch(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.get(query).map(Arc::clone)
    }

    /// Look up a statement without touching the LRU order.
    pub fn peek(&self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.peek(query).map(Arc::clone)
    }

    /// Insert a statement, evicting the least recently used one at capacity.
    /// Returns the evicted statement's name, if any.
    pub fn insert(&mut self, statement: Arc<PreparedStatement>) -> Option<String> {
        let query = statement.query.clone();
        match self.cache.push(query, statement) {
            // push also hands back the old value when the key was present
            Some((evicted_query, evicted)) if !self.cache.contains(&evicted_query) => {
                Some(evicted.name.clone())
            }
            _ => None,
        }
    }

    pub fn remove(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.pop(query)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
