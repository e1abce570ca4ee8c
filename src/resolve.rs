//! Nearest-in-time URL resolution and lenient fallback search
//!
//! [`UrlResolver`] answers "which captured version of this URL is closest
//! to a given point in time", working around two backend weaknesses:
//!
//! * the distance-based sort can be unstable for near-tied distances, so
//!   rather than trusting row 0 the resolver fetches the top candidates
//!   and re-ranks them locally by exact distance, additionally applying
//!   domain rules the backend sort cannot express (protocol match,
//!   trailing-slash preservation, self-redirect skipping);
//! * URLs reconstructed from rewritten links are often slightly wrong, so
//!   a failed direct lookup falls back to a lenient weighted disjunction
//!   over the original URL, the canonical URL and host/path/query tokens.
//!
//! The resolver owns the process-lifetime lenient attempt/success
//! counters as part of its own state; it is constructed once and passed
//! by handle, never re-created implicitly.

use crate::record::Record;
use crate::request::SearchRequest;
use crate::sort::SortClause;
use crate::streaming::{RecordStream, ResourceExpander};
use crate::transport::{Cursor, PageQuery, SearchBackend};
use crate::urls::{create_phrase, host_of, normalize_url, path_tokens, query_tokens, same_protocol};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Filter excluding revisit records, which carry no payload of their own.
pub const NO_REVISIT_FILTER: &str = "record_type:response OR record_type:arc";

/// Default number of candidates fetched for local re-ranking.
///
/// The top-N-then-re-rank workaround is a heuristic: N near-tied
/// candidates beyond this bound would evade correction. Raise it via
/// [`UrlResolver::rerank_candidates`] when an index is known to hold many
/// captures of single URLs at near-identical times.
pub const DEFAULT_RERANK_CANDIDATES: usize = 10;

/// The fields resolution results carry by default.
pub fn default_record_fields() -> Vec<String> {
    [
        "id",
        "url",
        "url_norm",
        "crawl_date",
        "status_code",
        "content_type_norm",
        "record_type",
        "source_file_path",
        "source_file_offset",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Which resolution stage produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStage {
    /// Exact canonical-URL lookup.
    Direct,
    /// Weighted fallback search after the direct lookup failed.
    Lenient,
}

/// A resolved record together with the stage that produced it.
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub record: Record,
    pub stage: ResolutionStage,
}

/// Collaborator extracting the embedded resource URLs of one page record.
///
/// The raw-content fetch behind it (container path + byte offset) is an
/// external concern; the resolver only consumes the extracted URL set.
#[async_trait]
pub trait LinkExtractor: Send + Sync {
    async fn resource_links(&self, page: &Record) -> Result<Vec<String>>;
}

/// Nearest-in-time and lenient URL resolution engine.
pub struct UrlResolver {
    backend: Arc<dyn SearchBackend>,
    link_extractor: Option<Arc<dyn LinkExtractor>>,
    rerank_candidates: usize,
    lenient_attempts: AtomicU64,
    lenient_successes: AtomicU64,
}

impl UrlResolver {
    /// Create a resolver over `backend`. Resolution queries must bypass
    /// any caching layer: a cached "no match" would persist after the
    /// content is actually indexed, so hand a non-caching backend in.
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            backend,
            link_extractor: None,
            rerank_candidates: DEFAULT_RERANK_CANDIDATES,
            lenient_attempts: AtomicU64::new(0),
            lenient_successes: AtomicU64::new(0),
        }
    }

    /// Wire in the link-extraction collaborator used for resource
    /// expansion.
    pub fn with_link_extractor(mut self, extractor: Arc<dyn LinkExtractor>) -> Self {
        self.link_extractor = Some(extractor);
        self
    }

    /// Override the local re-rank candidate bound.
    pub fn rerank_candidates(mut self, candidates: usize) -> Self {
        self.rerank_candidates = candidates.max(1);
        self
    }

    /// Lenient fallback searches issued since process start.
    pub fn lenient_attempts(&self) -> u64 {
        self.lenient_attempts.load(Ordering::Relaxed)
    }

    /// Lenient fallback searches that produced a match since process
    /// start.
    pub fn lenient_successes(&self) -> u64 {
        self.lenient_successes.load(Ordering::Relaxed)
    }

    /// Find the capture of `url` closest in time to `anchor`.
    ///
    /// Queries for status-200 captures of the canonical URL sorted by time
    /// distance, then re-ranks the top candidates locally: the backend's
    /// distance sort is unstable for near-tied distances, and three rules
    /// cannot be expressed in the sort at all: the candidate must use the
    /// same protocol as the query URL, a trailing-slash URL never matches
    /// a candidate lacking the slash (both canonicalize identically), and
    /// a redirect pointing back at the queried URL is skipped to avoid an
    /// endless redirect during playback.
    ///
    /// Returns `Ok(None)` when no candidate survives.
    pub async fn find_closest_capture(
        &self,
        url: &str,
        anchor: DateTime<Utc>,
    ) -> Result<Option<Record>> {
        let slash_last = url.ends_with('/');
        let norm = normalize_url(url);
        let query = format!("url_norm:{} AND status_code:200", create_phrase(&norm));
        let page = self
            .backend
            .page(&PageQuery {
                query,
                filters: vec![NO_REVISIT_FILTER.to_string()],
                fields: default_record_fields(),
                sort: vec![
                    SortClause::time_distance("crawl_date", anchor),
                    SortClause::asc("id"),
                ],
                rows: self.rerank_candidates,
                cursor: Cursor::start(),
                shards: Vec::new(),
            })
            .await?;

        let mut best: Option<(usize, i64)> = None;
        for (index, candidate) in page.records.iter().enumerate() {
            let candidate_url = match candidate.url() {
                Some(u) => u,
                None => continue,
            };
            if !same_protocol(url, candidate_url) {
                continue;
            }
            if slash_last && !candidate_url.ends_with('/') {
                info!(url, found = candidate_url, "ignoring candidate missing trailing slash");
                continue;
            }
            if let Some(status) = candidate.status_code() {
                if (300..400).contains(&status) && candidate_url == url {
                    info!(url, "skipping self-redirect candidate");
                    continue;
                }
            }
            let capture_time = match candidate.crawl_date() {
                Some(t) => t,
                None => continue,
            };
            let distance = (anchor.timestamp_millis() - capture_time.timestamp_millis()).abs();
            if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                best = Some((index, distance));
            }
        }

        Ok(best.map(|(index, _)| {
            if index != 0 {
                warn!(url, row = index, "corrected unstable distance sort; better match below row 0");
            }
            page.records[index].clone()
        }))
    }

    /// For every given URL, find the capture closest in time to `anchor`,
    /// deduplicating on the canonical URL. No practical limit on the
    /// number of URLs or the result size.
    ///
    /// `data:` URLs are skipped as they can never match. Revisit records
    /// are not considered as candidates.
    pub async fn find_nearest_records<I, S>(
        &self,
        urls: I,
        anchor: DateTime<Utc>,
        fields: &[String],
    ) -> Result<Vec<Record>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let queries: Vec<String> = urls
            .into_iter()
            .filter(|url| !url.as_ref().starts_with("data:"))
            .map(|url| format!("url_norm:{}", create_phrase(&normalize_url(url.as_ref()))))
            .collect();
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let request = SearchRequest::new()
            .queries(queries)
            .filter_query(NO_REVISIT_FILTER)
            .fields(fields.iter().map(String::as_str))
            .time_proximity(anchor.format("%Y-%m-%dT%H:%M:%SZ").to_string(), "url_norm");
        RecordStream::open(Arc::clone(&self.backend), request)?
            .collect_all()
            .await
    }

    /// Like [`UrlResolver::find_nearest_records`], but URLs with no direct
    /// match fall back to the lenient search, bumping the attempt/success
    /// counters.
    pub async fn find_nearest_lenient<'a, I>(
        &self,
        urls: I,
        anchor: DateTime<Utc>,
        fields: &[String],
    ) -> Result<Vec<Record>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let urls: Vec<&str> = urls.into_iter().collect();
        let mut records = self
            .find_nearest_records(urls.iter().copied(), anchor, fields)
            .await?;
        let matched: Vec<String> = records
            .iter()
            .filter_map(|r| r.url_norm().map(str::to_string))
            .collect();
        for url in urls {
            if matched.iter().any(|m| m == &normalize_url(url)) {
                continue;
            }
            if let Some(record) = self.lenient_lookup(url, fields).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Resolve each URL to one capture: direct canonical match first, then
    /// the lenient fallback. The outcome records which stage matched.
    pub async fn search_urls<'a, I>(
        &self,
        fields: &[String],
        urls: I,
    ) -> Result<Vec<ResolutionOutcome>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let urls: Vec<&str> = urls.into_iter().collect();
        let queries: Vec<String> = urls
            .iter()
            .filter(|url| !url.starts_with("data:"))
            .map(|url| format!("url_norm:{}", create_phrase(&normalize_url(url))))
            .collect();

        let mut outcomes = Vec::new();
        let mut matched: Vec<String> = Vec::new();
        if !queries.is_empty() {
            let request = SearchRequest::new()
                .queries(queries)
                .filter_query(NO_REVISIT_FILTER)
                .fields(fields.iter().map(String::as_str))
                .sort(vec![SortClause::asc("url_norm"), SortClause::asc("id")])
                .deduplicate_field("url_norm");
            let direct = RecordStream::open(Arc::clone(&self.backend), request)?
                .collect_all()
                .await?;
            for record in direct {
                if let Some(norm) = record.url_norm() {
                    matched.push(norm.to_string());
                }
                outcomes.push(ResolutionOutcome {
                    record,
                    stage: ResolutionStage::Direct,
                });
            }
        }

        for url in urls {
            if matched.iter().any(|m| m == &normalize_url(url)) {
                continue;
            }
            if let Some(record) = self.lenient_lookup(url, fields).await? {
                outcomes.push(ResolutionOutcome {
                    record,
                    stage: ResolutionStage::Lenient,
                });
            }
        }
        Ok(outcomes)
    }

    /// Resolve one URL at a point in time, reporting the producing stage.
    pub async fn resolve_url(
        &self,
        url: &str,
        anchor: DateTime<Utc>,
    ) -> Result<Option<ResolutionOutcome>> {
        if let Some(record) = self.find_closest_capture(url, anchor).await? {
            return Ok(Some(ResolutionOutcome {
                record,
                stage: ResolutionStage::Direct,
            }));
        }
        Ok(self
            .lenient_lookup(url, &default_record_fields())
            .await?
            .map(|record| ResolutionOutcome {
                record,
                stage: ResolutionStage::Lenient,
            }))
    }

    /// Issue one lenient fallback search for `url`.
    ///
    /// The query OR-combines, in descending weight: the exact original
    /// URL, the exact canonical URL, and a conjunctive host + significant
    /// path/query token match, so a partial match on host and structure
    /// can still succeed when exact reconstruction fails. Every invocation
    /// counts as an attempt; a non-empty result also counts as a success.
    async fn lenient_lookup(&self, url: &str, fields: &[String]) -> Result<Option<Record>> {
        self.lenient_attempts.fetch_add(1, Ordering::Relaxed);
        let query = lenient_query(url);
        debug!(url, %query, "lenient URL lookup");
        let page = self
            .backend
            .page(&PageQuery {
                query,
                filters: vec![NO_REVISIT_FILTER.to_string()],
                fields: fields.to_vec(),
                sort: vec![SortClause::desc("score"), SortClause::asc("id")],
                rows: self.rerank_candidates,
                cursor: Cursor::start(),
                shards: Vec::new(),
            })
            .await?;
        let best = page.records.into_iter().next();
        if best.is_some() {
            self.lenient_successes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(best)
    }
}

/// Build the weighted disjunction for a lenient lookup.
///
/// Shape: `url:"<orig>"^200 OR url_norm:"<norm>"^100 OR (host:"<host>"
/// AND url_search:"<path>" AND (host:"<host>" OR url_search:"<token>"
/// ...))` where tokens are the remaining path segments and query
/// parameters.
fn lenient_query(url: &str) -> String {
    let mut clauses = vec![
        format!("url:{}^200", create_phrase(url)),
        format!("url_norm:{}^100", create_phrase(&normalize_url(url))),
    ];
    if let Some(host) = host_of(url) {
        let host_clause = format!("host:{}", create_phrase(&host));
        let mut paths = path_tokens(url);
        let mut inner: Vec<String> = vec![host_clause.clone()];
        inner.extend(
            paths
                .split_off(paths.len().min(1))
                .into_iter()
                .chain(query_tokens(url))
                .map(|token| format!("url_search:{}", create_phrase(&token))),
        );
        let mut structured = vec![host_clause];
        if let Some(first_path) = paths.into_iter().next() {
            structured.push(format!("url_search:{}", create_phrase(&first_path)));
        }
        structured.push(format!("({})", inner.join(" OR ")));
        clauses.push(format!("({})", structured.join(" AND ")));
    }
    clauses.join(" OR ")
}

#[async_trait]
impl ResourceExpander for UrlResolver {
    /// Expand one page record into its embedded resources: links come
    /// from the extraction collaborator, and each link resolves to the
    /// capture nearest the page's own crawl date.
    async fn expand(&self, page: &Record, fields: &[String]) -> Result<Vec<Record>> {
        let extractor = match &self.link_extractor {
            Some(extractor) => Arc::clone(extractor),
            None => return Ok(Vec::new()),
        };
        let anchor = match page.crawl_date() {
            Some(anchor) => anchor,
            None => return Ok(Vec::new()),
        };
        let links = extractor.resource_links(page).await?;
        self.find_nearest_records(links.iter().map(String::as_str), anchor, fields)
            .await
    }
}
