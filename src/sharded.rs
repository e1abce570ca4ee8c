//! Shard fan-out and k-way merge
//!
//! A horizontally-partitioned index guarantees per-shard sort correctness
//! but not a reliable global tie-break across shards, so per-shard streams
//! cannot simply be concatenated. The coordinator here makes a sharded
//! backend indistinguishable from a single logical index: one
//! [`RecordStream`] per shard, each independently cursor-paginated, merged
//! through a frontier of buffered head records ordered by the declared
//! comparator.
//!
//! The load-bearing invariant is result-set equivalence: for the same
//! request, shard-divide `Never`, `Always` and `Auto` produce the same
//! records in the same order. Global features (result cap, dedup,
//! resource expansion) are therefore applied after the merge, never per
//! shard.
//!
//! A single shard's stream error aborts the whole merge with that error;
//! there is no degraded partial-result mode.

use crate::record::Record;
use crate::request::{DedupMode, SearchRequest, ShardDividePolicy};
use crate::sort::RecordComparator;
use crate::streaming::{DedupState, RecordStream, ResourceExpander};
use crate::transport::SearchBackend;
use crate::{Result, WarcdexError};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default result-size threshold above which `Auto` fans out per shard.
/// Below it, the fixed overhead of launching one stream per shard is not
/// amortized and single-shard streaming wins.
pub const DEFAULT_AUTO_DIVIDE_THRESHOLD: u64 = 1000;

/// A record stream that is either a plain logical-index stream or a
/// sharded merge, chosen by the request's divide policy.
pub enum ArchiveStream {
    Plain(RecordStream),
    Sharded(ShardedStream),
}

impl ArchiveStream {
    /// Pull the next record in declared sort order.
    pub async fn try_next(&mut self) -> Result<Option<Record>> {
        match self {
            Self::Plain(stream) => stream.try_next().await,
            Self::Sharded(stream) => stream.try_next().await,
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
        match self {
            Self::Plain(stream) => stream.duplicates_removed(),
            Self::Sharded(stream) => stream.duplicates_removed(),
        }
    }
}

/// Open a stream for `request`, honoring its shard-divide policy.
///
/// `Auto` issues one count-only probe against the logical index and fans
/// out only when the estimated result size exceeds the configured
/// threshold. The shard set is probed fresh per call and never cached.
pub async fn stream_with_strategy(
    backend: Arc<dyn SearchBackend>,
    request: SearchRequest,
    expander: Option<Arc<dyn ResourceExpander>>,
) -> Result<ArchiveStream> {
    let request = request.normalized()?;
    let divide = match request.shard_divide_policy() {
        ShardDividePolicy::Never => false,
        ShardDividePolicy::Always => true,
        ShardDividePolicy::Auto => {
            let threshold = request
                .divide_threshold()
                .unwrap_or(DEFAULT_AUTO_DIVIDE_THRESHOLD);
            let mut estimated = 0u64;
            for query in request.query_list() {
                estimated = estimated.saturating_add(
                    backend.count(query, request.filter_list()).await?,
                );
            }
            debug!(estimated, threshold, "auto shard-divide probe");
            estimated > threshold
        }
    };

    if !divide {
        return open_plain(backend, request, expander);
    }

    let topology = backend.shard_topology().await?;
    if topology.len() < 2 {
        debug!(
            shards = topology.len(),
            "shard divide requested but index is not partitioned; using plain stream"
        );
        return open_plain(backend, request, expander);
    }

    let mut heads = Vec::with_capacity(topology.len());
    for shard in &topology {
        let mut stream = RecordStream::open_shard_slice(
            Arc::clone(&backend),
            request.deep_copy(),
            shard.endpoint.clone(),
        )
        .map_err(|e| WarcdexError::shard(shard.endpoint.clone(), e))?;
        match stream.try_next().await {
            Ok(Some(head)) => heads.push(ShardHead {
                shard: shard.endpoint.clone(),
                stream,
                head,
            }),
            Ok(None) => {} // empty shard never joins the frontier
            Err(error) => return Err(WarcdexError::shard(shard.endpoint.clone(), error)),
        }
    }
    debug!(
        shards = topology.len(),
        live = heads.len(),
        "fanned out sharded stream"
    );

    Ok(ArchiveStream::Sharded(ShardedStream {
        heads,
        comparator: request.comparator(),
        dedup: DedupState::new(request.dedup_mode().clone()),
        expander,
        request,
        pending: VecDeque::new(),
        delivered: 0,
        finished: false,
    }))
}

fn open_plain(
    backend: Arc<dyn SearchBackend>,
    request: SearchRequest,
    expander: Option<Arc<dyn ResourceExpander>>,
) -> Result<ArchiveStream> {
    let stream = match expander {
        Some(expander) => RecordStream::open_with_expander(backend, request, expander)?,
        None => RecordStream::open(backend, request)?,
    };
    Ok(ArchiveStream::Plain(stream))
}

struct ShardHead {
    shard: String,
    stream: RecordStream,
    head: Record,
}

/// K-way merge over per-shard streams.
///
/// Frontier invariant: every live shard has exactly one buffered head
/// record, and no shard's un-buffered remainder can sort before the
/// current frontier minimum, so the minimal head is always the globally
/// next record.
pub struct ShardedStream {
    heads: Vec<ShardHead>,
    comparator: RecordComparator,
    dedup: DedupState,
    expander: Option<Arc<dyn ResourceExpander>>,
    request: SearchRequest,
    /// Records ready for delivery: the last merged record plus any
    /// resources it expanded into.
    pending: VecDeque<Record>,
    delivered: u64,
    finished: bool,
}

impl ShardedStream {
    /// Pull the next record in global sort order.
    pub async fn try_next(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(cap) = self.request.result_cap() {
                if self.delivered >= cap {
                    self.finished = true;
                    self.pending.clear();
                }
            }
            if let Some(record) = self.pending.pop_front() {
                self.delivered += 1;
                return Ok(Some(record));
            }
            if self.finished {
                return Ok(None);
            }
            if self.heads.is_empty() {
                self.finished = true;
                return Ok(None);
            }
            if let Err(error) = self.merge_step().await {
                self.finished = true;
                self.pending.clear();
                return Err(error);
            }
        }
    }

    /// Number of records removed by deduplication so far.
    pub fn duplicates_removed(&self) -> u64 {
        self.dedup.duplicates_removed()
    }

    /// Emit the comparator-minimal head into `pending` (unless dedup drops
    /// it), refill that shard's head and apply the post-merge features.
    async fn merge_step(&mut self) -> Result<()> {
        let min_index = self
            .heads
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| self.comparator.compare(&a.head, &b.head))
            .map(|(i, _)| i)
            .expect("merge_step requires a non-empty frontier");

        let record = self.refill(min_index).await?;

        if matches!(self.dedup.mode(), DedupMode::StreamingAdjacent { .. })
            && !self.dedup.accept(&record)?
        {
            return Ok(());
        }

        let mut batch = vec![record];
        if self.request.expands_resources() {
            if let Some(expander) = &self.expander {
                let source = &batch[0];
                if source.is_page() {
                    match expander.expand(source, self.request.field_list()).await {
                        Ok(resources) => batch.extend(resources),
                        Err(error) => {
                            warn!(
                                id = source.id().unwrap_or("<no id>"),
                                %error,
                                "unable to expand resources for page record"
                            );
                        }
                    }
                }
            }
        }
        if matches!(self.dedup.mode(), DedupMode::SetBounded { .. }) {
            let mut surviving = Vec::with_capacity(batch.len());
            for record in batch {
                if self.dedup.accept(&record)? {
                    surviving.push(record);
                }
            }
            batch = surviving;
        }
        self.pending.extend(batch);
        Ok(())
    }

    /// Take the head of shard `index` and replace it from its stream,
    /// dropping the shard from the frontier when exhausted.
    async fn refill(&mut self, index: usize) -> Result<Record> {
        let entry = &mut self.heads[index];
        match entry.stream.try_next().await {
            Ok(Some(next)) => Ok(std::mem::replace(&mut entry.head, next)),
            Ok(None) => {
                let entry = self.heads.swap_remove(index);
                Ok(entry.head)
            }
            Err(error) => Err(WarcdexError::shard(entry.shard.clone(), error)),
        }
    }
}
