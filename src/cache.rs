//! Query-result caching transport
//!
//! [`CachingBackend`] decorates any [`SearchBackend`], memoizing page
//! fetches under a canonical signature of the full query. Entries expire
//! by age (TTL) and by capacity (least-recently-inserted first), and the
//! whole table is cleared when the index watcher reports an index change.
//!
//! Count probes, shard-topology probes and index-generation pings always
//! bypass the cache: caching topology or freshness state would let a
//! stale answer persist after the index has moved. Playback-resolution
//! queries bypass it too, by being issued through a separate non-caching
//! backend instance ("cache poisoning" guard).

use crate::transport::{PageQuery, PageResponse, SearchBackend, ShardDescriptor};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

struct CacheTable {
    entries: HashMap<String, (PageResponse, Instant)>,
    /// Keys in insertion order; the front is evicted first.
    insertion_order: VecDeque<String>,
}

/// Caching decorator around a [`SearchBackend`].
pub struct CachingBackend {
    inner: Arc<dyn SearchBackend>,
    table: Mutex<CacheTable>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl CachingBackend {
    /// Wrap `inner`, keeping at most `capacity` responses for at most
    /// `ttl` each.
    pub fn new(inner: Arc<dyn SearchBackend>, capacity: usize, ttl: Duration) -> Self {
        info!(capacity, ttl_secs = ttl.as_secs(), "caching backend enabled");
        Self {
            inner,
            table: Mutex::new(CacheTable {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
            capacity,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Drop every cached entry. Wired to the index watcher's `Changed`
    /// signal.
    pub fn clear(&self) {
        let mut table = self.table.lock();
        let dropped = table.entries.len();
        table.entries.clear();
        table.insertion_order.clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(dropped, "cache cleared");
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// True when no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, signature: &str) -> Option<PageResponse> {
        let mut table = self.table.lock();
        let expired = match table.entries.get(signature) {
            Some((_, inserted)) => inserted.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            // Drop eagerly so capacity is not held hostage by dead entries.
            table.entries.remove(signature);
            table.insertion_order.retain(|key| key != signature);
            return None;
        }
        table.entries.get(signature).map(|(response, _)| response.clone())
    }

    fn store(&self, signature: String, response: PageResponse) {
        if self.capacity == 0 {
            return;
        }
        let mut table = self.table.lock();
        while table.entries.len() >= self.capacity {
            match table.insertion_order.pop_front() {
                Some(oldest) => {
                    table.entries.remove(&oldest);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        if table.entries.insert(signature.clone(), (response, Instant::now())).is_none() {
            table.insertion_order.push_back(signature);
        }
    }
}

#[async_trait]
impl SearchBackend for CachingBackend {
    async fn page(&self, query: &PageQuery) -> Result<PageResponse> {
        let signature = query.signature()?;
        if let Some(cached) = self.lookup(&signature) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let response = self.inner.page(query).await?;
        self.store(signature, response.clone());
        Ok(response)
    }

    /// Count probes bypass the cache: freshness matters more than the
    /// saved round trip.
    async fn count(&self, query: &str, filters: &[String]) -> Result<u64> {
        self.inner.count(query, filters).await
    }

    /// Topology is read fresh per sharded query, never cached.
    async fn shard_topology(&self) -> Result<Vec<ShardDescriptor>> {
        self.inner.shard_topology().await
    }

    /// Generation pings drive invalidation and must never be served from
    /// the thing they invalidate.
    async fn index_generation(&self) -> Result<u64> {
        self.inner.index_generation().await
    }
}
