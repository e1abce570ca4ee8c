//! Archive client facade
//!
//! [`ArchiveClient`] is the explicitly constructed, explicitly owned
//! service object tying the retrieval core together: a caching backend
//! for read-mostly searches, a separate non-caching backend for
//! playback-resolution and probe queries, the URL resolver with its
//! process-lifetime counters, and the optional index watcher driving
//! cache invalidation. Initialize it once at process start and pass it by
//! handle; nothing here is a global.

use crate::cache::{CacheStats, CachingBackend};
use crate::config::WarcdexConfig;
use crate::record::Record;
use crate::request::SearchRequest;
use crate::resolve::{
    default_record_fields, LinkExtractor, ResolutionOutcome, UrlResolver, NO_REVISIT_FILTER,
};
use crate::sharded::{stream_with_strategy, ArchiveStream};
use crate::sort::{parse_time_anchor, SortClause};
use crate::streaming::{RecordStream, ResourceExpander};
use crate::transport::{Cursor, HttpBackend, PageQuery, PageResponse, SearchBackend};
use crate::urls::{create_phrase, normalize_url};
use crate::watcher::{IndexStatus, IndexWatcher, WatcherHandle};
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// High-level client over one archive index.
pub struct ArchiveClient {
    config: WarcdexConfig,
    /// Backend for read-mostly searches; caching when enabled.
    search_backend: Arc<dyn SearchBackend>,
    /// Backend that never caches: playback resolution, probes, streams.
    raw_backend: Arc<dyn SearchBackend>,
    cache: Option<Arc<CachingBackend>>,
    resolver: Arc<UrlResolver>,
    watcher: Option<WatcherHandle>,
    available: Arc<Mutex<Option<bool>>>,
}

impl ArchiveClient {
    /// Connect to the HTTP backend named by the configuration.
    pub fn connect(config: WarcdexConfig) -> Result<Self> {
        let backend: Arc<dyn SearchBackend> = Arc::new(HttpBackend::new(&config.backend_url));
        Self::assemble(config, backend, None)
    }

    /// Build a client over an explicit backend (used by tests and
    /// embedders with their own transport).
    pub fn from_backend(config: WarcdexConfig, backend: Arc<dyn SearchBackend>) -> Result<Self> {
        Self::assemble(config, backend, None)
    }

    /// Like [`ArchiveClient::from_backend`], with the link-extraction
    /// collaborator for resource expansion wired in.
    pub fn from_backend_with_extractor(
        config: WarcdexConfig,
        backend: Arc<dyn SearchBackend>,
        extractor: Arc<dyn LinkExtractor>,
    ) -> Result<Self> {
        Self::assemble(config, backend, Some(extractor))
    }

    fn assemble(
        config: WarcdexConfig,
        backend: Arc<dyn SearchBackend>,
        extractor: Option<Arc<dyn LinkExtractor>>,
    ) -> Result<Self> {
        config.validate()?;

        let raw_backend = Arc::clone(&backend);
        let (search_backend, cache) = if config.cache_capacity > 0 {
            let cache = Arc::new(CachingBackend::new(
                Arc::clone(&backend),
                config.cache_capacity,
                Duration::from_secs(config.cache_ttl_secs),
            ));
            (Arc::clone(&cache) as Arc<dyn SearchBackend>, Some(cache))
        } else {
            info!("query caching disabled");
            (backend, None)
        };

        let mut resolver =
            UrlResolver::new(Arc::clone(&raw_backend)).rerank_candidates(config.rerank_candidates);
        if let Some(extractor) = extractor {
            resolver = resolver.with_link_extractor(extractor);
        }
        let resolver = Arc::new(resolver);

        let available = Arc::new(Mutex::new(None));
        let watcher = if config.watch_interval_secs > 0 {
            let cache_for_watcher = cache.clone();
            let available_for_watcher = Arc::clone(&available);
            let handle = IndexWatcher::new(
                Arc::clone(&raw_backend),
                Duration::from_secs(config.watch_interval_secs),
            )
            .on_status(Box::new(move |status| match status {
                IndexStatus::Changed => {
                    if let Some(cache) = &cache_for_watcher {
                        cache.clear();
                    }
                    *available_for_watcher.lock() = Some(true);
                }
                IndexStatus::Available => *available_for_watcher.lock() = Some(true),
                IndexStatus::Unavailable => *available_for_watcher.lock() = Some(false),
                IndexStatus::Undetermined => {}
            }))
            .start();
            Some(handle)
        } else {
            None
        };

        info!(backend = %config.backend_url, "archive client initialized");
        Ok(Self {
            config,
            search_backend,
            raw_backend,
            cache,
            resolver,
            watcher,
            available,
        })
    }

    /// Stop the background watcher, if any.
    pub async fn shutdown(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown().await;
        }
    }

    /// A request template carrying this client's configured defaults.
    pub fn request(&self) -> SearchRequest {
        SearchRequest::new()
            .page_size(self.config.page_size)
            .auto_divide_threshold(self.config.auto_divide_threshold)
    }

    /// Backend availability as last observed by the index watcher.
    /// `None` until the first poll completes (or when the watcher is
    /// disabled).
    pub fn is_available(&self) -> Option<bool> {
        *self.available.lock()
    }

    /// The URL resolution engine, including its lenient counters.
    pub fn resolver(&self) -> &Arc<UrlResolver> {
        &self.resolver
    }

    /// Cache counters, when caching is enabled.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.stats())
    }

    /// Total hits for a query without fetching records. Never cached.
    pub async fn count(&self, query: &str, filters: &[String]) -> Result<u64> {
        self.search_backend.count(query, filters).await
    }

    /// Total records in the index.
    pub async fn total_records(&self) -> Result<u64> {
        self.count("*:*", &[]).await
    }

    /// One page of ranked results through the caching transport.
    pub async fn search(
        &self,
        query: &str,
        filters: &[String],
        rows: usize,
    ) -> Result<PageResponse> {
        self.search_backend
            .page(&PageQuery {
                query: query.to_string(),
                filters: filters.to_vec(),
                fields: default_record_fields(),
                sort: vec![SortClause::desc("score"), SortClause::asc("id")],
                rows,
                cursor: Cursor::start(),
                shards: Vec::new(),
            })
            .await
    }

    /// Open a plain record stream. Streaming exports issue unique
    /// requests, so they run on the non-caching transport.
    pub fn stream(&self, request: SearchRequest) -> Result<RecordStream> {
        RecordStream::open_with_expander(
            Arc::clone(&self.raw_backend),
            request,
            Arc::clone(&self.resolver) as Arc<dyn ResourceExpander>,
        )
    }

    /// Open a stream honoring the request's shard-divide policy.
    pub async fn stream_sharded(&self, request: SearchRequest) -> Result<ArchiveStream> {
        let request = if request.divide_threshold().is_none() {
            request.auto_divide_threshold(self.config.auto_divide_threshold)
        } else {
            request
        };
        stream_with_strategy(
            Arc::clone(&self.raw_backend),
            request,
            Some(Arc::clone(&self.resolver) as Arc<dyn ResourceExpander>),
        )
        .await
    }

    /// Find the capture of `url` closest in time to `anchor` (`oldest`,
    /// `newest` or a Zulu ISO timestamp).
    pub async fn find_closest_capture(&self, url: &str, anchor: &str) -> Result<Option<Record>> {
        let anchor = parse_time_anchor(anchor)?;
        self.resolver.find_closest_capture(url, anchor).await
    }

    /// Resolve one URL at a point in time, direct first then lenient,
    /// reporting which stage matched.
    pub async fn resolve_url(&self, url: &str, anchor: &str) -> Result<Option<ResolutionOutcome>> {
        let anchor = parse_time_anchor(anchor)?;
        self.resolver.resolve_url(url, anchor).await
    }

    /// For every URL, the capture closest in time to `anchor`.
    pub async fn find_nearest_records<'a, I>(
        &self,
        urls: I,
        anchor: &str,
    ) -> Result<Vec<Record>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let anchor = parse_time_anchor(anchor)?;
        self.resolver
            .find_nearest_records(urls, anchor, &default_record_fields())
            .await
    }

    /// Like [`ArchiveClient::find_nearest_records`] with the lenient
    /// fallback for URLs that fail the direct lookup.
    pub async fn find_nearest_lenient<'a, I>(
        &self,
        urls: I,
        anchor: &str,
    ) -> Result<Vec<Record>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let anchor = parse_time_anchor(anchor)?;
        self.resolver
            .find_nearest_lenient(urls, anchor, &default_record_fields())
            .await
    }

    /// Resolve each URL to one capture, direct first then lenient.
    pub async fn search_urls<'a, I>(&self, urls: I) -> Result<Vec<ResolutionOutcome>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.resolver
            .search_urls(&default_record_fields(), urls)
            .await
    }

    /// All capture timestamps of one URL, oldest first.
    pub async fn harvest_times_for_url(&self, url: &str) -> Result<Vec<DateTime<Utc>>> {
        let request = self
            .request()
            .query(format!("url_norm:{}", create_phrase(&normalize_url(url))))
            .fields(["id", "crawl_date"])
            .sort(vec![SortClause::asc("crawl_date"), SortClause::asc("id")]);
        let records = RecordStream::open(Arc::clone(&self.raw_backend), request)?
            .collect_all()
            .await?;
        Ok(records.iter().filter_map(Record::crawl_date).collect())
    }

    /// Exact lookup of one capture at one timestamp (PWID-style). Used by
    /// playback, therefore never cached.
    pub async fn find_exact_capture(&self, url: &str, timestamp: &str) -> Result<Option<Record>> {
        let query = format!(
            "url_norm:{} AND crawl_date:{}",
            create_phrase(&normalize_url(url)),
            create_phrase(timestamp)
        );
        let page = self
            .raw_backend
            .page(&PageQuery {
                query,
                filters: Vec::new(),
                fields: default_record_fields(),
                sort: vec![SortClause::asc("id")],
                rows: 1,
                cursor: Cursor::start(),
                shards: Vec::new(),
            })
            .await?;
        Ok(page.records.into_iter().next())
    }

    /// Locate the record describing the capture at a container path and
    /// byte offset. Used by playback, therefore never cached.
    pub async fn record_by_source(&self, path: &str, offset: u64) -> Result<Option<Record>> {
        let query = format!(
            "source_file_path:{} AND source_file_offset:{}",
            create_phrase(path),
            offset
        );
        let page = self
            .raw_backend
            .page(&PageQuery {
                query,
                filters: vec![NO_REVISIT_FILTER.to_string()],
                fields: default_record_fields(),
                sort: vec![SortClause::asc("id")],
                rows: 1,
                cursor: Cursor::start(),
                shards: Vec::new(),
            })
            .await?;
        Ok(page.records.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_backend::MemoryBackend;

    fn seeded_backend() -> Arc<MemoryBackend> {
        let backend = MemoryBackend::new();
        for (id, date, offset) in [
            ("doc_a", "2019-05-01T10:00:00Z", 10),
            ("doc_b", "2020-05-01T10:00:00Z", 20),
            ("doc_c", "2021-05-01T10:00:00Z", 30),
        ] {
            backend.add_record(
                "shard1",
                Record::new()
                    .with("id", id)
                    .with("url", "https://example.org/page")
                    .with("url_norm", "http://example.org/page")
                    .with("status_code", 200)
                    .with("record_type", "response")
                    .with("crawl_date", date)
                    .with("source_file_path", "captures.warc")
                    .with("source_file_offset", offset),
            );
        }
        Arc::new(backend)
    }

    fn client(backend: Arc<MemoryBackend>) -> ArchiveClient {
        ArchiveClient::from_backend(
            WarcdexConfig::new().cache_capacity(16).page_size(100),
            backend,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_counts() {
        let client = client(seeded_backend());
        assert_eq!(client.total_records().await.unwrap(), 3);
        assert_eq!(
            client.count("url_norm:\"http://example.org/page\"", &[]).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_harvest_times_sorted() {
        let client = client(seeded_backend());
        let times = client
            .harvest_times_for_url("https://www.example.org/page")
            .await
            .unwrap();
        assert_eq!(times.len(), 3);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_exact_capture_lookup() {
        let client = client(seeded_backend());
        let hit = client
            .find_exact_capture("https://example.org/page", "2020-05-01T10:00:00Z")
            .await
            .unwrap();
        assert_eq!(hit.unwrap().id(), Some("doc_b"));

        let miss = client
            .find_exact_capture("https://example.org/page", "1999-01-01T00:00:00Z")
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_record_by_source() {
        let client = client(seeded_backend());
        let hit = client.record_by_source("captures.warc", 20).await.unwrap();
        assert_eq!(hit.unwrap().id(), Some("doc_b"));
        assert!(client.record_by_source("captures.warc", 999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_is_cached_but_probes_are_not() {
        let backend = seeded_backend();
        let client = client(Arc::clone(&backend));
        client.search("*:*", &[], 10).await.unwrap();
        client.search("*:*", &[], 10).await.unwrap();
        let stats = client.cache_stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        client.total_records().await.unwrap();
        let stats = client.cache_stats().unwrap();
        assert_eq!(stats.hits + stats.misses, 2);
    }

    #[tokio::test]
    async fn test_availability_unknown_without_watcher() {
        let client = client(seeded_backend());
        assert_eq!(client.is_available(), None);
    }
}
