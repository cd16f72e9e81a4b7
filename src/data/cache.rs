//! TTL cache for upstream market data.
//!
//! Entries are stored behind `Arc` and replaced wholesale on every write,
//! so a reader either sees the previous value or the new one, never a mix.
//! Expired entries are logically absent from `get` even before the
//! maintenance sweep physically removes them.

use parking_lot::RwLock;
use serde::Deserialize;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-endpoint TTLs and the market-data freshness window.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub quote_ttl_secs: u64,
    pub chain_ttl_secs: u64,
    pub history_ttl_secs: u64,
    /// Maximum age of a quote's upstream timestamp before it must be refetched.
    pub freshness_window_secs: u64,
    /// Daily bars requested for indicator calculations.
    pub history_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            quote_ttl_secs: 60,
            chain_ttl_secs: 300,
            history_ttl_secs: 3600,
            freshness_window_secs: 60,
            history_days: 30,
        }
    }
}

impl CacheConfig {
    pub fn quote_ttl(&self) -> Duration {
        Duration::from_secs(self.quote_ttl_secs)
    }

    pub fn chain_ttl(&self) -> Duration {
        Duration::from_secs(self.chain_ttl_secs)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct CacheEntry<V> {
    value: Arc<V>,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

/// A cached value returned past its TTL, explicitly marked as stale.
#[derive(Debug, Clone)]
pub struct Staleness<V> {
    pub value: Arc<V>,
    pub age: Duration,
    pub expired: bool,
}

/// Thread-safe in-memory TTL cache.
pub struct TtlCache<K, V> {
    name: &'static str,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return the value if present and within its TTL.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Return whatever is stored, expired or not, with its age.
    /// Callers must treat an expired value as stale and never trade on it.
    pub fn get_stale<Q>(&self, key: &Q) -> Option<Staleness<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let entries = self.entries.read();
        entries.get(key).map(|entry| Staleness {
            value: Arc::clone(&entry.value),
            age: now.saturating_duration_since(entry.inserted_at),
            expired: entry.is_expired(now),
        })
    }

    /// Insert or replace an entry, returning the stored value.
    pub fn set(&self, key: K, value: V, ttl: Duration) -> Arc<V> {
        let value = Arc::new(value);
        let entry = CacheEntry {
            value: Arc::clone(&value),
            inserted_at: Instant::now(),
            ttl,
        };
        self.entries.write().insert(key, entry);
        value
    }

    /// Remove a single entry regardless of TTL.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.write().remove(key);
    }

    /// Drop every entry past its TTL. Returns the number removed.
    pub fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(cache = self.name, removed, remaining = entries.len(), "Evicted expired entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
