//! Request specification for streaming queries
//!
//! A [`SearchRequest`] is an immutable, validated description of one query:
//! what to ask, how to page, how to deduplicate and how to split across
//! shards. Requests are built with consuming setters, normalized once and
//! validated fail-fast before any network call.
//!
//! Normalization mirrors what the backend needs for stable cursoring:
//! a trailing `id` tie-break is appended to the sort when missing, a
//! streaming dedup field is promoted to primary sort and added to the
//! field list, and resource expansion forces the fields needed to locate
//! and classify page records.

use crate::error::WarcdexError;
use crate::sort::{parse_time_anchor, RecordComparator, SortClause, SortKey, SortOrder};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Default page size (rows) for cursor paging.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Default ceiling for the bounded uniqueness tracker.
///
/// Each tracked id costs roughly 150-250 bytes of heap, so the default
/// bounds tracking memory to about 1 GB.
pub const DEFAULT_MAX_UNIQUE: usize = 5_000_000;

/// The tie-break field required at the end of every sort.
const TIE_BREAK_FIELD: &str = "id";

/// How duplicates are removed from a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DedupMode {
    /// No deduplication.
    None,
    /// Adjacent-value dedup on `field`. Requires the field to be the
    /// primary sort key: records are assumed delivered grouped by it.
    /// Violating that assumption silently under-deduplicates, so request
    /// normalization promotes the field rather than trusting the caller.
    StreamingAdjacent { field: String },
    /// Identity dedup backed by a tracking set, bounded by `max_unique`.
    /// Exceeding the ceiling fails the stream instead of dropping tracking.
    SetBounded { max_unique: usize },
}

impl DedupMode {
    pub fn is_none(&self) -> bool {
        matches!(self, DedupMode::None)
    }
}

/// Whether a query is split into per-shard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardDividePolicy {
    /// Single logical-index mode; the backend's own distributed query is
    /// trusted for cross-shard paging.
    Never,
    /// One stream per shard, merged locally.
    Always,
    /// Probe the result size first; fan out only above the threshold.
    Auto,
}

/// Immutable description of one streaming query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    queries: Vec<String>,
    filters: Vec<String>,
    fields: Vec<String>,
    sort: Vec<SortClause>,
    page_size: usize,
    max_results: Option<u64>,
    dedup: DedupMode,
    expand_resources: bool,
    shard_divide: ShardDividePolicy,
    auto_divide_threshold: Option<u64>,
    time_proximity: Option<(String, String)>, // (raw anchor, dedup field)
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchRequest {
    /// Create an empty request. At least one query and one field must be
    /// set before the request passes validation.
    pub fn new() -> Self {
        Self {
            queries: Vec::new(),
            filters: Vec::new(),
            fields: Vec::new(),
            sort: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
            max_results: None,
            dedup: DedupMode::None,
            expand_resources: false,
            shard_divide: ShardDividePolicy::Never,
            auto_divide_threshold: None,
            time_proximity: None,
        }
    }

    /// Set a single query predicate.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.queries = vec![query.into()];
        self
    }

    /// Set multiple query predicates, drained in order by the stream.
    /// Deduplication state spans query boundaries.
    pub fn queries<I, S>(mut self, queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queries = queries.into_iter().map(Into::into).collect();
        self
    }

    /// Add one filter predicate. For performance, 0 or 1 filters are
    /// recommended; collapse multiple filters into one where possible.
    pub fn filter_query(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    /// Add several filter predicates.
    pub fn filter_queries<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters.extend(filters.into_iter().map(Into::into));
        self
    }

    /// Set the fields to export.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Set the declared sort. A trailing `id` tie-break is appended during
    /// normalization when missing.
    pub fn sort(mut self, sort: Vec<SortClause>) -> Self {
        self.sort = sort;
        self
    }

    /// Set the cursor page size.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Cap the total number of delivered records.
    pub fn max_results(mut self, max_results: u64) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// Enable adjacent-value deduplication on `field`.
    pub fn deduplicate_field(mut self, field: impl Into<String>) -> Self {
        self.dedup = DedupMode::StreamingAdjacent {
            field: field.into(),
        };
        self
    }

    /// Guarantee unique record identities, tracking at most
    /// [`DEFAULT_MAX_UNIQUE`] ids.
    pub fn ensure_unique(self) -> Self {
        self.ensure_unique_max(DEFAULT_MAX_UNIQUE)
    }

    /// Guarantee unique record identities with an explicit tracking ceiling.
    pub fn ensure_unique_max(mut self, max_unique: usize) -> Self {
        self.dedup = DedupMode::SetBounded { max_unique };
        self
    }

    /// Expand embedded resources of page records into the stream.
    pub fn expand_resources(mut self, expand: bool) -> Self {
        self.expand_resources = expand;
        self
    }

    /// Set the shard-divide policy.
    pub fn shard_divide(mut self, policy: ShardDividePolicy) -> Self {
        self.shard_divide = policy;
        self
    }

    /// Result-size threshold above which `Auto` fans out per shard.
    pub fn auto_divide_threshold(mut self, threshold: u64) -> Self {
        self.auto_divide_threshold = Some(threshold);
        self
    }

    /// Stream records closest in time to `anchor`, deduplicating on
    /// `field` (typically `url_norm`): sorts by the dedup field, then by
    /// absolute time distance, and enables adjacent-value dedup so the
    /// nearest capture per key wins.
    ///
    /// `anchor` accepts `oldest`, `newest` or a Zulu ISO timestamp; an
    /// invalid anchor fails validation before any network call.
    pub fn time_proximity(mut self, anchor: impl Into<String>, field: impl Into<String>) -> Self {
        self.time_proximity = Some((anchor.into(), field.into()));
        self
    }

    /// An independent copy with no shared mutable state. Used when the
    /// same logical request drives multiple comparison runs.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    // Accessors used by the engines. Normalized requests only.

    pub fn query_list(&self) -> &[String] {
        &self.queries
    }

    pub fn filter_list(&self) -> &[String] {
        &self.filters
    }

    pub fn field_list(&self) -> &[String] {
        &self.fields
    }

    pub fn sort_clauses(&self) -> &[SortClause] {
        &self.sort
    }

    pub fn page_size_hint(&self) -> usize {
        self.page_size
    }

    pub fn result_cap(&self) -> Option<u64> {
        self.max_results
    }

    pub fn dedup_mode(&self) -> &DedupMode {
        &self.dedup
    }

    pub fn expands_resources(&self) -> bool {
        self.expand_resources
    }

    pub fn shard_divide_policy(&self) -> ShardDividePolicy {
        self.shard_divide
    }

    pub fn divide_threshold(&self) -> Option<u64> {
        self.auto_divide_threshold
    }

    /// Comparator over the normalized sort.
    pub fn comparator(&self) -> RecordComparator {
        RecordComparator::new(self.sort.clone())
    }

    /// Resolve defaults, promote dedup/expansion fields and validate.
    ///
    /// Fails fast (before any network call) when the field list is empty,
    /// no query is present, a dedup field conflicts with the declared sort,
    /// a uniqueness ceiling is zero, or a time anchor does not parse.
    pub fn normalized(mut self) -> Result<Self> {
        if self.queries.is_empty() {
            return Err(WarcdexError::invalid_request(
                "query",
                "no query predicate given",
                "Set query() or queries() before streaming",
            ));
        }
        if self.fields.is_empty() {
            return Err(WarcdexError::invalid_request(
                "fields",
                "field list is empty",
                "List the fields to export, e.g. fields([\"id\", \"url_norm\"])",
            ));
        }
        if self.page_size == 0 {
            return Err(WarcdexError::invalid_request(
                "page_size",
                "must be greater than 0",
                "Use the default of 1000 or a positive page size",
            ));
        }

        // Time proximity installs its sort and dedup before the generic
        // normalization below.
        if let Some((raw_anchor, field)) = self.time_proximity.take() {
            let anchor = parse_time_anchor(&raw_anchor)?;
            self.sort = vec![
                SortClause::asc(field.clone()),
                SortClause::time_distance("crawl_date", anchor),
            ];
            self.dedup = DedupMode::StreamingAdjacent { field };
        }

        if self.sort.is_empty() {
            self.sort = vec![SortClause::desc("score"), SortClause::asc(TIE_BREAK_FIELD)];
        }
        let ends_in_tie_break = matches!(
            self.sort.last(),
            Some(SortClause { key: SortKey::Field(f), .. }) if f == TIE_BREAK_FIELD
        );
        if !ends_in_tie_break {
            self.sort.push(SortClause {
                key: SortKey::Field(TIE_BREAK_FIELD.to_string()),
                order: SortOrder::Asc,
            });
        }

        match &self.dedup {
            DedupMode::None => {}
            DedupMode::StreamingAdjacent { field } => {
                let position = self.sort.iter().position(|c| c.field() == field);
                match position {
                    Some(0) => {}
                    Some(_) => {
                        return Err(WarcdexError::invalid_request(
                            "deduplicate_field",
                            format!("'{}' is in the sort but not the primary key", field),
                            "Streaming dedup assumes records arrive grouped by the dedup field; \
                             make it the first sort clause or drop the explicit sort",
                        ));
                    }
                    None => {
                        self.sort.insert(0, SortClause::asc(field.clone()));
                    }
                }
                if !self.fields.iter().any(|f| f == field) {
                    self.fields.push(field.clone());
                }
            }
            DedupMode::SetBounded { max_unique } => {
                if *max_unique == 0 {
                    return Err(WarcdexError::invalid_request(
                        "max_unique",
                        "must be greater than 0",
                        "Use ensure_unique() for the default ceiling of 5000000",
                    ));
                }
                if !self.fields.iter().any(|f| f == TIE_BREAK_FIELD) {
                    self.fields.push(TIE_BREAK_FIELD.to_string());
                }
            }
        }

        if self.expand_resources {
            for required in ["content_type_norm", "source_file_path", "source_file_offset"] {
                if !self.fields.iter().any(|f| f == required) {
                    self.fields.push(required.to_string());
                }
            }
        }

        Ok(self)
    }
}
