//! In-memory storage with automatic garbage collection.
//!
//! This storage backend uses `DashMap` for thread-safe concurrent access
//! and includes configurable garbage collection to prevent memory growth.
//! Scripts run while the map shard holding their key is write-locked, so a
//! script is atomic with respect to every other operation on that key.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;

use crate::clock::{self, Clock};
use crate::error::Result;
use crate::storage::{Script, ScriptReply, Storage, StorageEntry};

/// Garbage collection interval configuration.
#[derive(Debug, Clone)]
pub enum GcInterval {
    /// Run GC every N requests.
    Requests(u64),
    /// Disable automatic GC.
    Manual,
}

impl Default for GcInterval {
    fn default() -> Self {
        Self::Requests(10000)
    }
}

/// Garbage collection configuration.
#[derive(Debug, Clone, Default)]
pub struct GcConfig {
    /// When to trigger GC.
    pub interval: GcInterval,
}

impl GcConfig {
    /// Create config with request-based GC.
    pub fn on_requests(count: u64) -> Self {
        Self {
            interval: GcInterval::Requests(count),
        }
    }

    /// Create config with manual GC only.
    pub fn manual() -> Self {
        Self {
            interval: GcInterval::Manual,
        }
    }
}

/// Internal entry with expiration tracking.
#[derive(Debug, Clone)]
struct InternalEntry {
    entry: StorageEntry,
    expires_at: u64,
}

impl InternalEntry {
    fn live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

/// In-memory storage with garbage collection.
///
/// Stands in for the shared store in single-node deployments and tests.
/// Expiry is evaluated against the injected [`Clock`], so TTL behaviour can
/// be driven deterministically.
///
/// # Example
///
/// ```ignore
/// use resilient_ratelimit::storage::{MemoryStorage, GcConfig};
///
/// // Default GC (every 10000 requests)
/// let storage = MemoryStorage::new();
///
/// // Manual GC only
/// let storage = MemoryStorage::with_gc(GcConfig::manual());
/// storage.run_gc();
/// ```
pub struct MemoryStorage {
    data: DashMap<String, InternalEntry>,
    gc_config: GcConfig,
    request_count: AtomicU64,
    gc_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("entries", &self.data.len())
            .field("gc_config", &self.gc_config)
            .finish()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create a new memory storage with default GC configuration.
    pub fn new() -> Self {
        Self::with_gc(GcConfig::default())
    }

    /// Create a new memory storage with custom GC configuration.
    pub fn with_gc(gc_config: GcConfig) -> Self {
        Self {
            data: DashMap::new(),
            gc_config,
            request_count: AtomicU64::new(0),
            gc_lock: Mutex::new(()),
            clock: clock::system(),
        }
    }

    /// Use `clock` for expiry decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Remove every expired entry.
    pub fn run_gc(&self) {
        let now = self.clock.now_millis();
        self.data.retain(|_, entry| entry.live(now));
    }

    /// Get the number of entries currently stored, expired or not.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.data.clear();
    }

    /// Check if GC should run and run it if needed.
    fn maybe_run_gc(&self) {
        if let GcInterval::Requests(threshold) = self.gc_config.interval {
            let count = self.request_count.fetch_add(1, Ordering::Relaxed);
            if threshold > 0 && count % threshold == 0 && count > 0 {
                // Try to acquire GC lock (non-blocking)
                if let Some(_guard) = self.gc_lock.try_lock() {
                    self.run_gc();
                }
            }
        }
    }

    fn read(&self, key: &str) -> Option<StorageEntry> {
        let now = self.clock.now_millis();
        self.data
            .get(key)
            .filter(|internal| internal.live(now))
            .map(|internal| internal.entry.clone())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

impl Storage for MemoryStorage {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        self.maybe_run_gc();

        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(ttl_millis(ttl));

        let mut internal = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| InternalEntry {
                entry: StorageEntry::default(),
                expires_at,
            });

        if !internal.live(now) {
            internal.entry = StorageEntry::default();
        }
        internal.entry.count += 1;
        internal.entry.last_update = now;
        if internal.entry.count == 1 {
            internal.expires_at = expires_at;
        }

        Ok(internal.entry.count)
    }

    async fn counter(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.read(key).map(|entry| entry.count))
    }

    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        Ok(self.read(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn execute_atomic<S: Script>(&self, key: &str, script: &S, now: u64) -> Result<ScriptReply> {
        self.maybe_run_gc();

        let store_now = self.clock.now_millis();
        let expires_at = store_now.saturating_add(ttl_millis(script.ttl()));

        // The entry guard holds the shard lock for the whole read-modify-write.
        let reply = match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied
                    .get()
                    .live(store_now)
                    .then(|| occupied.get().entry.clone());
                let (entry, reply) = script.apply(current, now);
                occupied.insert(InternalEntry { entry, expires_at });
                reply
            }
            Entry::Vacant(vacant) => {
                let (entry, reply) = script.apply(None, now);
                vacant.insert(InternalEntry { entry, expires_at });
                reply
            }
        };

        Ok(reply)
    }
}
