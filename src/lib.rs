//! Warcdex - streaming retrieval core for web-archive indexes
//!
//! Warcdex turns a large, externally-hosted, possibly sharded document
//! index into a reliable, memory-bounded, order-preserving stream of
//! archived-page records, and resolves which captured version of a URL is
//! closest to a given point in time even when the index's native sort is
//! unstable or the URL is malformed.
//!
//! The pieces, leaves first: [`SearchRequest`] describes one query;
//! [`RecordStream`] executes it as a lazy cursor-paged pull sequence with
//! deduplication and bounded uniqueness tracking; the shard coordinator
//! ([`stream_with_strategy`]) fans requests out per shard and k-way
//! merges the sorted per-shard streams; [`UrlResolver`] layers
//! nearest-in-time matching and the lenient fallback search on top; and
//! [`CachingBackend`] plus [`IndexWatcher`] memoize read-mostly queries
//! with external invalidation. [`ArchiveClient`] wires all of it together
//! as one explicitly owned service object.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod memory_backend;
pub mod record;
pub mod request;
pub mod resolve;
pub mod sharded;
pub mod sort;
pub mod streaming;
pub mod transport;
pub mod urls;
pub mod watcher;

pub use cache::{CacheStats, CachingBackend};
pub use client::ArchiveClient;
pub use config::WarcdexConfig;
pub use error::WarcdexError;
pub use record::{FieldValue, Record, SourcePointer};
pub use request::{
    DedupMode, SearchRequest, ShardDividePolicy, DEFAULT_MAX_UNIQUE, DEFAULT_PAGE_SIZE,
};
pub use resolve::{
    LinkExtractor, ResolutionOutcome, ResolutionStage, UrlResolver, DEFAULT_RERANK_CANDIDATES,
    NO_REVISIT_FILTER,
};
pub use sharded::{stream_with_strategy, ArchiveStream, ShardedStream};
pub use sort::{RecordComparator, SortClause, SortKey, SortOrder};
pub use streaming::{RecordStream, ResourceExpander};
pub use transport::{
    Cursor, HttpBackend, PageQuery, PageResponse, SearchBackend, ShardDescriptor,
};
pub use watcher::{IndexStatus, IndexWatcher, WatcherHandle};

/// Type alias for Results using WarcdexError
pub type Result<T> = std::result::Result<T, WarcdexError>;
