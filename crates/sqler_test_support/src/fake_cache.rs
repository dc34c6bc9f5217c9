//! In-process `CacheSurface` backed by a `Mutex<HashMap>`, for tests that
//! need to observe cache hits/misses without a real backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use sqler::cache::{CacheEntry, CacheError, CacheSurface};

#[derive(Default)]
pub struct FakeCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    fail_on_set: Mutex<Option<String>>,
}

impl FakeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `set` call return `Err(message)`, without
    /// touching `entries` — used to exercise the logged-not-raised
    /// fire-and-forget path.
    pub fn fail_next_set(&self, message: impl Into<String>) {
        *lock(&self.fail_on_set) = Some(message.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

impl CacheSurface for FakeCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let entries = lock(&self.entries);
        let entry = entries.get(key)?;
        entry.is_fresh(SystemTime::now()).then(|| entry.clone())
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        if let Some(message) = lock(&self.fail_on_set).take() {
            return Err(Box::from(message));
        }
        lock(&self.entries).insert(key.to_string(), CacheEntry::new(value, SystemTime::now(), ttl));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}
