//! Bounded, TTL-based DNS resolution cache.
//!
//! Mirrors a small FIFO cache rather than an LRU: entries are evicted in
//! insertion order once capacity is exceeded, regardless of how recently
//! they were used. Concurrent lookups for the same key may both miss and
//! both resolve independently — the last writer wins. That's fine here;
//! a proxy re-resolving a host twice under race is cheaper than the
//! locking needed to prevent it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

const DEFAULT_TTL: Duration = Duration::from_secs(60);
const DEFAULT_CAPACITY: usize = 512;

struct Entry {
    addrs: Vec<SocketAddr>,
    inserted_at: Instant,
}

struct Inner {
    map: std::collections::HashMap<String, Entry>,
    order: VecDeque<String>,
}

/// A bounded cache mapping `"host:port"` to resolved socket addresses.
pub struct DnsCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl DnsCache {
    /// Build a cache with the default TTL (60s) and capacity (512 entries).
    pub fn new() -> Self {
        Self::with_params(DEFAULT_TTL, DEFAULT_CAPACITY)
    }

    /// Build a cache with explicit TTL and capacity.
    pub fn with_params(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            inner: Mutex::new(Inner {
                map: std::collections::HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Resolve `host:port`, serving a cached result if present and fresh.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let key = format!("{host}:{port}");

        if let Some(addrs) = self.cached(&key) {
            return Ok(addrs);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::DnsResolution {
                host: host.to_string(),
                reason: e.to_string(),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(Error::DnsResolution {
                host: host.to_string(),
                reason: "resolver returned no addresses".to_string(),
            });
        }

        self.insert(key, addrs.clone());
        Ok(addrs)
    }

    fn cached(&self, key: &str) -> Option<Vec<SocketAddr>> {
        let inner = self.inner.lock();
        let entry = inner.map.get(key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.addrs.clone())
    }

    fn insert(&self, key: String, addrs: Vec<SocketAddr>) {
        let mut inner = self.inner.lock();

        if !inner.map.contains_key(&key) {
            inner.order.push_back(key.clone());
        }
        inner.map.insert(
            key,
            Entry {
                addrs,
                inserted_at: Instant::now(),
            },
        );

        while inner.map.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Number of entries currently cached, including stale ones.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}
