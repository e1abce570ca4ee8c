//! Configuration for the warcdex retrieval core
//!
//! This module provides the configuration surface consumed by
//! [`crate::client::ArchiveClient`], including parameter validation and a
//! builder pattern implementation. The values themselves are owned by the
//! embedding application (property files, environment, flags); warcdex
//! only validates and consumes them.

use crate::error::WarcdexError;
use crate::request::{DEFAULT_MAX_UNIQUE, DEFAULT_PAGE_SIZE};
use crate::resolve::DEFAULT_RERANK_CANDIDATES;
use crate::sharded::DEFAULT_AUTO_DIVIDE_THRESHOLD;
use serde::{Deserialize, Serialize};

/// Configuration for one archive client instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarcdexConfig {
    /// Base endpoint of the search backend.
    pub backend_url: String,
    /// Default page size (rows) for cursor paging.
    pub page_size: usize,
    /// Ceiling for the bounded uniqueness tracker.
    pub max_unique: usize,
    /// Candidates fetched for local re-ranking in nearest-in-time
    /// resolution.
    pub rerank_candidates: usize,
    /// Result-size threshold above which `Auto` shard division fans out.
    pub auto_divide_threshold: u64,
    /// Maximum number of cached query responses. 0 disables caching.
    pub cache_capacity: usize,
    /// Age in seconds after which a cached response expires.
    pub cache_ttl_secs: u64,
    /// Poll interval in seconds for the index watcher. 0 disables the
    /// watcher (and with it, automatic cache invalidation).
    pub watch_interval_secs: u64,
}

impl Default for WarcdexConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8983/warcdex".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            max_unique: DEFAULT_MAX_UNIQUE,
            rerank_candidates: DEFAULT_RERANK_CANDIDATES,
            auto_divide_threshold: DEFAULT_AUTO_DIVIDE_THRESHOLD,
            cache_capacity: 1000,
            cache_ttl_secs: 300,
            watch_interval_secs: 0,
        }
    }
}

impl WarcdexConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend base endpoint.
    pub fn backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self
    }

    /// Set the default cursor page size.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the uniqueness tracking ceiling.
    pub fn max_unique(mut self, max_unique: usize) -> Self {
        self.max_unique = max_unique;
        self
    }

    /// Set the local re-rank candidate bound.
    pub fn rerank_candidates(mut self, candidates: usize) -> Self {
        self.rerank_candidates = candidates;
        self
    }

    /// Set the auto shard-divide threshold.
    pub fn auto_divide_threshold(mut self, threshold: u64) -> Self {
        self.auto_divide_threshold = threshold;
        self
    }

    /// Set the cache capacity (entries). 0 disables caching.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the cache TTL in seconds.
    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = secs;
        self
    }

    /// Set the index watcher poll interval in seconds. 0 disables it.
    pub fn watch_interval_secs(mut self, secs: u64) -> Self {
        self.watch_interval_secs = secs;
        self
    }

    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<(), WarcdexError> {
        if self.backend_url.trim().is_empty() {
            return Err(WarcdexError::config_error(
                "backend_url",
                "must not be empty",
                "Point backend_url at the search backend, e.g. http://localhost:8983/warcdex",
            ));
        }
        if self.page_size == 0 {
            return Err(WarcdexError::config_error(
                "page_size",
                "must be greater than 0",
                "Use 1000 for narrow field lists, smaller for wide ones",
            ));
        }
        if self.max_unique == 0 {
            return Err(WarcdexError::config_error(
                "max_unique",
                "must be greater than 0",
                "The default of 5000000 bounds tracking memory to roughly 1 GB",
            ));
        }
        if self.rerank_candidates == 0 {
            return Err(WarcdexError::config_error(
                "rerank_candidates",
                "must be greater than 0",
                "Use 10 unless the index holds many near-tied captures per URL",
            ));
        }
        if self.cache_capacity > 0 && self.cache_ttl_secs == 0 {
            return Err(WarcdexError::config_error(
                "cache_ttl_secs",
                "must be greater than 0 when caching is enabled",
                "Set a TTL (e.g. 300) or disable caching with cache_capacity = 0",
            ));
        }
        Ok(())
    }

    /// Build the configuration after validation.
    pub fn build(self) -> Result<Self, WarcdexError> {
        self.validate()?;
        Ok(self)
    }
}
