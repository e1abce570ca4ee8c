//! Backend transport: wire types and the search-backend seam
//!
//! The retrieval core talks to the external document index through the
//! [`SearchBackend`] trait: one page fetch carrying an opaque cursor, a
//! count-only probe, a shard-topology probe and an index-generation ping.
//! [`HttpBackend`] is the production implementation speaking JSON over
//! HTTP; the in-memory backend used by the test suites implements the
//! same trait.
//!
//! Cursor tokens are backend-defined opaque strings. The reserved start
//! token means "from the beginning"; a cursor is replaced, never mutated,
//! after each page fetch.

use crate::record::Record;
use crate::sort::SortClause;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque, backend-issued paging token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// The reserved sentinel understood by the backend as "from the
    /// beginning".
    pub fn start() -> Self {
        Self("*".to_string())
    }

    /// Wrap a backend-issued token.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_token(&self) -> &str {
        &self.0
    }
}

/// One structured page request against the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageQuery {
    /// Query predicate.
    pub query: String,
    /// Filter predicates, conjunctive with the query.
    pub filters: Vec<String>,
    /// Fields to return per record.
    pub fields: Vec<String>,
    /// Declared sort, ending in the `id` tie-break.
    pub sort: Vec<SortClause>,
    /// Requested page size.
    pub rows: usize,
    /// Paging position.
    pub cursor: Cursor,
    /// Restrict the query to these shards; empty means the whole logical
    /// index.
    pub shards: Vec<String>,
}

impl PageQuery {
    /// Canonical signature of this query, used as the cache key. Relies on
    /// `Record`-independent field ordering being stable (struct order plus
    /// explicit vectors).
    pub fn signature(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One page of backend results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResponse {
    /// Records of this page, in declared sort order.
    pub records: Vec<Record>,
    /// Total hits for the query, independent of paging.
    pub num_found: u64,
    /// Token for the next page. Meaningless once a page comes back empty.
    pub next_cursor: Cursor,
}

/// One partition of the horizontally-split logical index.
///
/// The shard set is re-read per top-level query; descriptors are never
/// cached across queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// Endpoint address of the shard, as understood by the backend's
    /// shard-restriction parameter.
    pub endpoint: String,
    /// Membership epoch at probe time.
    pub epoch: u64,
}

/// Request/response transport to the search backend.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Fetch one page of results.
    async fn page(&self, query: &PageQuery) -> Result<PageResponse>;

    /// Count-only probe: total hits without fetching records.
    async fn count(&self, query: &str, filters: &[String]) -> Result<u64>;

    /// Current shard endpoints of the logical index.
    async fn shard_topology(&self) -> Result<Vec<ShardDescriptor>>;

    /// Backend index generation/version, advanced on reindex.
    async fn index_generation(&self) -> Result<u64>;
}

/// Render the declared sort as the backend's sort expression.
pub fn sort_expression(clauses: &[SortClause]) -> String {
    clauses
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Serialize)]
struct SelectBody<'a> {
    query: &'a str,
    filters: &'a [String],
    fields: &'a [String],
    sort: String,
    rows: usize,
    cursor: &'a str,
    shards: &'a [String],
}

#[derive(Deserialize)]
struct SelectResponse {
    records: Vec<Record>,
    num_found: u64,
    next_cursor: String,
}

#[derive(Deserialize)]
struct TopologyResponse {
    shards: Vec<ShardDescriptor>,
}

#[derive(Deserialize)]
struct GenerationResponse {
    generation: u64,
}

/// HTTP+JSON implementation of [`SearchBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a backend against `base_url` (no trailing slash required).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Base endpoint this backend talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl SearchBackend for HttpBackend {
    async fn page(&self, query: &PageQuery) -> Result<PageResponse> {
        let body = SelectBody {
            query: &query.query,
            filters: &query.filters,
            fields: &query.fields,
            sort: sort_expression(&query.sort),
            rows: query.rows,
            cursor: query.cursor.as_token(),
            shards: &query.shards,
        };
        let response: SelectResponse = self
            .http
            .post(self.endpoint("select"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(PageResponse {
            records: response.records,
            num_found: response.num_found,
            next_cursor: Cursor::from_token(response.next_cursor),
        })
    }

    async fn count(&self, query: &str, filters: &[String]) -> Result<u64> {
        let page = self
            .page(&PageQuery {
                query: query.to_string(),
                filters: filters.to_vec(),
                fields: vec!["id".to_string()],
                sort: Vec::new(),
                rows: 0,
                cursor: Cursor::start(),
                shards: Vec::new(),
            })
            .await?;
        Ok(page.num_found)
    }

    async fn shard_topology(&self) -> Result<Vec<ShardDescriptor>> {
        let response: TopologyResponse = self
            .http
            .get(self.endpoint("admin/shards"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.shards)
    }

    async fn index_generation(&self) -> Result<u64> {
        let response: GenerationResponse = self
            .http
            .get(self.endpoint("admin/index"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.generation)
    }
}
