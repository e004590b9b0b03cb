//! ID cache: remembers entity key → entity ID so the register worker can
//! skip re-registering entities the control plane already knows about.
//!
//! Entries expire after a per-type TTL (or [`IdCache::default_ttl`]) measured
//! from last access, not last write, so actively-used entities never expire
//! out from under a running agent.

use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug)]
struct CacheEntry {
    id: i64,
    last_access_millis: AtomicU64,
    ttl: Duration,
}

/// Concurrent, TTL-expiring key → entity ID cache.
#[derive(Debug)]
pub struct IdCache {
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    type_ttls: HashMap<String, Duration>,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl IdCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            default_ttl: Duration::from_secs(24 * 60 * 60),
            type_ttls: HashMap::new(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_type_ttl(mut self, entity_type: impl Into<String>, ttl: Duration) -> Self {
        self.type_ttls.insert(entity_type.into(), ttl);
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    fn ttl_for(&self, entity_type: &str) -> Duration {
        self.type_ttls.get(entity_type).copied().unwrap_or(self.default_ttl)
    }

    /// Record or refresh the ID for `key`, using `entity_type` to pick a TTL.
    pub fn put(&self, key: impl Into<String>, id: i64, entity_type: &str) {
        let now = self.clock.now_millis();
        let entry = CacheEntry { id, last_access_millis: AtomicU64::new(now), ttl: self.ttl_for(entity_type) };
        self.entries
            .write()
            .expect("IdCache.entries poisoned")
            .insert(key.into(), entry);
    }

    /// Look up `key`, refreshing its last-access time on hit. Returns `None`
    /// on a miss or an expired entry (which is also evicted).
    pub fn get(&self, key: &str) -> Option<i64> {
        {
            let entries = self.entries.read().expect("IdCache.entries poisoned");
            if let Some(entry) = entries.get(key) {
                let now = self.clock.now_millis();
                let last = entry.last_access_millis.load(Ordering::SeqCst);
                if now.saturating_sub(last) > entry.ttl.as_millis() as u64 {
                    drop(entries);
                    self.entries.write().expect("IdCache.entries poisoned").remove(key);
                    return None;
                }
                entry.last_access_millis.store(now, Ordering::SeqCst);
                return Some(entry.id);
            }
        }
        None
    }

    /// Remove every entry whose TTL has elapsed since its last access. Live
    /// entries are left untouched (their `last_access` is not disturbed by
    /// the sweep, only by `get`).
    pub fn sweep(&self) {
        let now = self.clock.now_millis();
        self.entries.write().expect("IdCache.entries poisoned").retain(|_, entry| {
            let last = entry.last_access_millis.load(Ordering::SeqCst);
            now.saturating_sub(last) <= entry.ttl.as_millis() as u64
        });
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("IdCache.entries poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
