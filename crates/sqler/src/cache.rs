//! The cache surface (C2): an abstract key -> SQL text store with TTL,
//! consumed by the manager but never implemented here. A real backend (Redis,
//! an in-process LRU, …) is a host-application concern; `sqler_test_support`
//! provides `FakeCache` for tests.

use std::time::{Duration, SystemTime};

/// Opaque error from a cache backend's `set`. The core never inspects it —
/// per §9 open question (c), `set` is fire-and-forget: a failure is logged,
/// never raised to the caller.
pub type CacheError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A cached SQL body plus the housekeeping needed to judge freshness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub item: String,
    pub stored: SystemTime,
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    pub fn new(item: impl Into<String>, stored: SystemTime, ttl: Option<Duration>) -> Self {
        Self {
            item: item.into(),
            stored,
            ttl,
        }
    }

    /// Whether this entry is still fresh as of `now`. An entry with no TTL
    /// never expires.
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        match self.ttl {
            None => true,
            Some(ttl) => now.duration_since(self.stored).map(|age| age < ttl).unwrap_or(true),
        }
    }
}

/// Abstract key -> SQL text cache, supplied by the host application.
///
/// The manager treats a configured cache as authoritative: `get` is consulted
/// before reading the filesystem, and `set` is fire-and-forget (§9, open
/// question (c)) — a failing `set` is logged by the caller, never raised.
/// Implementations must tolerate concurrent `get`/`set` on distinct keys and
/// on the same key; this is the only shared mutable state between concurrent
/// prepared-function calls.
pub trait CacheSurface: Send + Sync {
    /// Returns the cached entry for `key`, or `None` when missing or expired.
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Stores `value` under `key`, starting or resetting the eviction timer.
    /// Fire-and-forget from the caller's point of view: a returned error is
    /// logged, never propagated to the prepared-function invocation that
    /// triggered it.
    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;
}
