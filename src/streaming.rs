//! Cursor-based streaming over the document index
//!
//! [`RecordStream`] turns one backend endpoint plus one [`SearchRequest`]
//! into a lazy, finite, forward-only, non-restartable sequence of records
//! in declared sort order. Each pull fetches at most one page beyond what
//! is already buffered; an empty result page terminates the stream
//! permanently.
//!
//! Per fetched page, in order: adjacent-value deduplication, resource
//! expansion (page records grow the current page, never a later one) and
//! bounded identity deduplication. Transport errors propagate as stream
//! errors and are never retried here; retry policy belongs to the caller.

use crate::error::WarcdexError;
use crate::record::{FieldValue, Record};
use crate::request::{DedupMode, SearchRequest};
use crate::transport::{Cursor, PageQuery, SearchBackend};
use crate::Result;
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Collaborator resolving the embedded resources of one page record.
///
/// Implemented by the URL resolution engine: link extraction is delegated
/// further to an external parser, and each extracted link is resolved to
/// the capture nearest the page's own crawl date.
#[async_trait]
pub trait ResourceExpander: Send + Sync {
    async fn expand(&self, page: &Record, fields: &[String]) -> Result<Vec<Record>>;
}

/// Duplicate tracking shared by the plain stream and the shard merge, so
/// both execution strategies remove exactly the same records.
pub(crate) struct DedupState {
    mode: DedupMode,
    last_value: Option<FieldValue>,
    seen: FxHashSet<String>,
    duplicates_removed: u64,
}

impl DedupState {
    pub(crate) fn new(mode: DedupMode) -> Self {
        Self {
            mode,
            last_value: None,
            seen: FxHashSet::default(),
            duplicates_removed: 0,
        }
    }

    pub(crate) fn duplicates_removed(&self) -> u64 {
        self.duplicates_removed
    }

    pub(crate) fn mode(&self) -> &DedupMode {
        &self.mode
    }

    /// Decide whether `record` survives deduplication. Records are assumed
    /// to arrive in declared sort order, so for `StreamingAdjacent` the
    /// first record of each dedup group, i.e. the best in sort order, wins.
    pub(crate) fn accept(&mut self, record: &Record) -> Result<bool> {
        match &self.mode {
            DedupMode::None => Ok(true),
            DedupMode::StreamingAdjacent { field } => {
                let value = record.get(field).cloned();
                if value.is_some() && value == self.last_value {
                    self.duplicates_removed += 1;
                    Ok(false)
                } else {
                    self.last_value = value;
                    Ok(true)
                }
            }
            DedupMode::SetBounded { max_unique } => {
                let identity = match record.id() {
                    Some(id) => id.to_string(),
                    // The id field is forced into the request during
                    // normalization; a backend not returning it still gets
                    // a usable identity.
                    None => serde_json::to_string(record)?,
                };
                if self.seen.contains(&identity) {
                    self.duplicates_removed += 1;
                    return Ok(false);
                }
                if self.seen.len() >= *max_unique {
                    return Err(WarcdexError::resource_exhausted(
                        "unique tracker",
                        format!("more than {} unique record identities", max_unique),
                        "Raise max_unique, narrow the query or drop the uniqueness guarantee",
                    ));
                }
                self.seen.insert(identity);
                Ok(true)
            }
        }
    }
}

/// Lazy, cursor-paged record stream.
pub struct RecordStream {
    backend: Arc<dyn SearchBackend>,
    request: SearchRequest,
    expander: Option<Arc<dyn ResourceExpander>>,
    /// Shard restriction for fan-out streams; empty targets the whole
    /// logical index.
    shards: Vec<String>,
    /// When false, dedup, expansion and the result cap are skipped; the
    /// shard coordinator applies them globally after its merge.
    full_features: bool,
    dedup: DedupState,
    query_index: usize,
    cursor: Cursor,
    undelivered: VecDeque<Record>,
    finished: bool,
    delivered: u64,
    pages_fetched: u64,
}

impl RecordStream {
    /// Open a stream for `request` against `backend`. The request is
    /// normalized and validated here, before any network call.
    pub fn open(backend: Arc<dyn SearchBackend>, request: SearchRequest) -> Result<Self> {
        Self::build(backend, request, None, Vec::new(), true)
    }

    /// Open a stream with a resource expander wired in.
    pub fn open_with_expander(
        backend: Arc<dyn SearchBackend>,
        request: SearchRequest,
        expander: Arc<dyn ResourceExpander>,
    ) -> Result<Self> {
        Self::build(backend, request, Some(expander), Vec::new(), true)
    }

    /// Open a per-shard slice of a fanned-out request. Global features
    /// (dedup, expansion, result cap) are left to the merge.
    pub(crate) fn open_shard_slice(
        backend: Arc<dyn SearchBackend>,
        request: SearchRequest,
        shard: String,
    ) -> Result<Self> {
        Self::build(backend, request, None, vec![shard], false)
    }

    fn build(
        backend: Arc<dyn SearchBackend>,
        request: SearchRequest,
        expander: Option<Arc<dyn ResourceExpander>>,
        shards: Vec<String>,
        full_features: bool,
    ) -> Result<Self> {
        let request = request.normalized()?;
        let dedup = if full_features {
            DedupState::new(request.dedup_mode().clone())
        } else {
            DedupState::new(DedupMode::None)
        };
        Ok(Self {
            backend,
            request,
            expander,
            shards,
            full_features,
            dedup,
            query_index: 0,
            cursor: Cursor::start(),
            undelivered: VecDeque::new(),
            finished: false,
            delivered: 0,
            pages_fetched: 0,
        })
    }

    /// The normalized request this stream executes.
    pub fn request(&self) -> &SearchRequest {
        &self.request
    }

    /// Pull the next record, fetching a new page when the buffer is empty.
    /// Returns `Ok(None)` permanently once the stream is exhausted.
    pub async fn try_next(&mut self) -> Result<Option<Record>> {
        loop {
            if self.full_features {
                if let Some(cap) = self.request.result_cap() {
                    if self.delivered >= cap {
                        self.finished = true;
                        self.undelivered.clear();
                        return Ok(None);
                    }
                }
            }
            if let Some(record) = self.undelivered.pop_front() {
                self.delivered += 1;
                return Ok(Some(record));
            }
            if self.finished {
                return Ok(None);
            }
            if let Err(error) = self.fetch_page().await {
                // A stream error is terminal; repeated pulls stay exhausted.
                self.finished = true;
                self.undelivered.clear();
                return Err(error);
            }
        }
    }

    /// Drain the remainder of the stream into memory.
    pub async fn collect_all(&mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.try_next().await? {
            records.push(record);
        }
        Ok(records)
    }

    /// Number of records removed by deduplication so far.
    pub fn duplicates_removed(&self) -> u64 {
        self.dedup.duplicates_removed()
    }

    /// Number of page fetches issued so far.
    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    /// True once the stream has terminated. Idempotent: stays true.
    pub fn has_finished(&self) -> bool {
        self.finished && self.undelivered.is_empty()
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let query = PageQuery {
            query: self.request.query_list()[self.query_index].clone(),
            filters: self.request.filter_list().to_vec(),
            fields: self.request.field_list().to_vec(),
            sort: self.request.sort_clauses().to_vec(),
            rows: self.request.page_size_hint(),
            cursor: self.cursor.clone(),
            shards: self.shards.clone(),
        };
        let page = self.backend.page(&query).await?;
        self.pages_fetched += 1;
        self.cursor = page.next_cursor;

        if page.records.is_empty() {
            // This query's cursor space is drained; move to the next query
            // or terminate.
            self.query_index += 1;
            if self.query_index >= self.request.query_list().len() {
                debug!(
                    pages = self.pages_fetched,
                    delivered = self.delivered,
                    "record stream exhausted"
                );
                self.finished = true;
            } else {
                self.cursor = Cursor::start();
            }
            return Ok(());
        }

        if !self.full_features {
            self.undelivered.extend(page.records);
            return Ok(());
        }

        // Adjacent-value dedup sees the page as delivered by the backend;
        // identity dedup runs last so expanded resources are uniqued too.
        let mut records = page.records;
        if matches!(self.dedup.mode(), DedupMode::StreamingAdjacent { .. }) {
            records = self.filter_records(records)?;
        }
        if self.request.expands_resources() {
            records = self.expand_resources(records).await;
        }
        if matches!(self.dedup.mode(), DedupMode::SetBounded { .. }) {
            records = self.filter_records(records)?;
        }
        // Dedup may leave the page empty; the pull loop fetches again.
        self.undelivered.extend(records);
        Ok(())
    }

    fn filter_records(&mut self, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut surviving = Vec::with_capacity(records.len());
        for record in records {
            if self.dedup.accept(&record)? {
                surviving.push(record);
            }
        }
        Ok(surviving)
    }

    /// Resolve embedded resources of page records, emitting them directly
    /// after their source record within the same page. Expansion failures
    /// are logged and skipped; they never fail the stream.
    async fn expand_resources(&mut self, records: Vec<Record>) -> Vec<Record> {
        let expander = match &self.expander {
            Some(expander) => Arc::clone(expander),
            None => return records,
        };
        let mut expanded = Vec::with_capacity(records.len());
        for record in records {
            let is_page = record.is_page();
            expanded.push(record);
            if !is_page {
                continue;
            }
            let source = expanded.last().expect("just pushed");
            match expander.expand(source, self.request.field_list()).await {
                Ok(resources) => expanded.extend(resources),
                Err(error) => {
                    warn!(
                        id = source.id().unwrap_or("<no id>"),
                        %error,
                        "unable to expand resources for page record"
                    );
                }
            }
        }
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_backend::MemoryBackend;
    use crate::sort::SortClause;

    fn capture(id: usize, url_suffix: usize) -> Record {
        Record::new()
            .with("id", format!("doc_{:04}", id))
            .with("url", format!("https://example.COM/{}", url_suffix))
            .with("url_norm", format!("http://example.com/{}", url_suffix))
            .with("status_code", 200)
            .with("crawl_date", "2020-03-15T12:31:51Z")
    }

    fn backend_with(count: usize) -> Arc<MemoryBackend> {
        let backend = MemoryBackend::new();
        for i in 0..count {
            backend.add_record("shard1", capture(i, i % 10));
        }
        Arc::new(backend)
    }

    #[tokio::test]
    async fn test_exact_page_boundary_terminates_on_empty_page() {
        // 2000 records at page size 1000: three fetches, the third being
        // the empty terminator rather than a partial page beyond index end.
        let backend = backend_with(2000);
        let request = SearchRequest::new()
            .query("*:*")
            .fields(["id"])
            .sort(vec![SortClause::asc("id")])
            .page_size(1000);
        let mut stream = RecordStream::open(backend, request).unwrap();
        let records = stream.collect_all().await.unwrap();
        assert_eq!(records.len(), 2000);
        assert_eq!(stream.pages_fetched(), 3);
        assert!(stream.has_finished());

        // Exhaustion is idempotent: no further fetches are issued.
        assert!(stream.try_next().await.unwrap().is_none());
        assert_eq!(stream.pages_fetched(), 3);
    }

    #[tokio::test]
    async fn test_partial_final_page_still_delivers_everything() {
        // 2500 records at page size 1000: a 500-record final page, then
        // the empty terminator.
        let backend = backend_with(2500);
        let request = SearchRequest::new()
            .query("*:*")
            .fields(["id"])
            .sort(vec![SortClause::asc("id")])
            .page_size(1000);
        let mut stream = RecordStream::open(backend, request).unwrap();
        let records = stream.collect_all().await.unwrap();
        assert_eq!(records.len(), 2500);
        assert_eq!(stream.pages_fetched(), 4);
    }

    #[tokio::test]
    async fn test_streaming_adjacent_dedup_accounting() {
        let backend = backend_with(40); // 10 distinct url_norm values
        let request = SearchRequest::new()
            .query("*:*")
            .fields(["id", "url_norm"])
            .deduplicate_field("url_norm")
            .page_size(7);
        let mut stream = RecordStream::open(backend, request).unwrap();
        let records = stream.collect_all().await.unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(stream.duplicates_removed() + records.len() as u64, 40);
    }

    #[tokio::test]
    async fn test_set_bounded_ceiling_fails_stream() {
        let backend = backend_with(50);
        let request = SearchRequest::new()
            .query("*:*")
            .fields(["id"])
            .ensure_unique_max(20)
            .page_size(8);
        let mut stream = RecordStream::open(backend, request).unwrap();
        let mut delivered = 0;
        let error = loop {
            match stream.try_next().await {
                Ok(Some(_)) => delivered += 1,
                Ok(None) => panic!("stream should fail before exhausting"),
                Err(error) => break error,
            }
        };
        assert!(matches!(error, WarcdexError::ResourceExhausted { .. }));
        assert!(delivered <= 20);
        // Terminal and non-retryable for this stream instance.
        assert!(stream.try_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_max_results_caps_delivery() {
        let backend = backend_with(100);
        let request = SearchRequest::new()
            .query("*:*")
            .fields(["id"])
            .max_results(17)
            .page_size(10);
        let mut stream = RecordStream::open(backend, request).unwrap();
        let records = stream.collect_all().await.unwrap();
        assert_eq!(records.len(), 17);
    }

    #[tokio::test]
    async fn test_multi_query_draining_spans_dedup_state() {
        let backend = MemoryBackend::new();
        backend.add_record("shard1", capture(1, 1));
        backend.add_record("shard1", capture(2, 1));
        let request = SearchRequest::new()
            .queries([
                "url_norm:\"http://example.com/1\"",
                "url_norm:\"http://example.com/1\"",
            ])
            .fields(["id", "url_norm"])
            .deduplicate_field("url_norm");
        let mut stream = RecordStream::open(Arc::new(backend), request).unwrap();
        let records = stream.collect_all().await.unwrap();
        // The second query's records collapse into the first's dedup group.
        assert_eq!(records.len(), 1);
        assert_eq!(stream.duplicates_removed(), 3);
    }

    #[tokio::test]
    async fn test_sort_order_invariant_holds() {
        let backend = backend_with(120);
        let request = SearchRequest::new()
            .query("*:*")
            .fields(["id", "url_norm"])
            .sort(vec![SortClause::asc("url_norm"), SortClause::asc("id")])
            .page_size(11);
        let comparator = request.clone().normalized().unwrap().comparator();
        let mut stream = RecordStream::open(backend, request).unwrap();
        let records = stream.collect_all().await.unwrap();
        assert_eq!(records.len(), 120);
        assert!(comparator.is_sorted(&records));
    }
}
