//! Shard-divide equivalence suite
//!
//! The load-bearing invariant of the shard coordinator: for the same
//! request, shard-divide `Never`, `Always` and `Auto` produce the same
//! records in the same order. Each test builds one request, runs it both
//! ways against a three-shard in-memory index and compares the id
//! sequences.

use std::cmp::Ordering;
use std::sync::Arc;

use warcdex::memory_backend::MemoryBackend;
use warcdex::{
    ArchiveClient, Record, RecordComparator, SearchBackend, SearchRequest, ShardDividePolicy,
    SortClause, WarcdexConfig, WarcdexError,
};

const CRAWL_TIMES: [&str; 4] = [
    "2018-03-15T12:31:51Z",
    "2019-03-15T12:31:51Z",
    "2020-03-15T12:31:51Z",
    "2021-03-15T12:31:51Z",
];

fn capture(id: usize) -> Record {
    Record::new()
        .with("id", format!("doc_{:04}", id))
        .with("url", format!("https://example.COM/{}", id % 10))
        .with("url_norm", format!("http://example.com/{}", id % 10))
        .with("domain", "example.com")
        .with("status_code", 200)
        .with("record_type", "response")
        .with("crawl_date", CRAWL_TIMES[id % 4])
        .with("source_file_path", format!("some.warc_{}", id))
        .with("source_file_offset", id as i64)
}

fn sharded_backend() -> Arc<MemoryBackend> {
    let backend = MemoryBackend::new();
    for i in 0..300 {
        backend.add_record(&format!("shard{}", i % 3 + 1), capture(i));
    }
    Arc::new(backend)
}

fn client(backend: Arc<MemoryBackend>) -> ArchiveClient {
    // Streams run uncached either way; cache capacity 0 keeps the test
    // focused on the coordinator.
    ArchiveClient::from_backend(WarcdexConfig::new().cache_capacity(0), backend).unwrap()
}

async fn collect_ids(client: &ArchiveClient, request: SearchRequest) -> Vec<String> {
    let mut stream = client.stream_sharded(request).await.unwrap();
    stream
        .collect_all()
        .await
        .unwrap()
        .iter()
        .map(|r| r.id().unwrap().to_string())
        .collect()
}

/// Extract all ids with shard-divide `Never`, then with the request's own
/// policy, and compare.
async fn assert_docs_equal(request: SearchRequest) {
    let backend = sharded_backend();
    let client = client(backend);
    let plain_ids = collect_ids(
        &client,
        request.deep_copy().shard_divide(ShardDividePolicy::Never),
    )
    .await;
    let divided_ids = collect_ids(&client, request).await;
    assert!(
        !plain_ids.is_empty(),
        "the comparison is vacuous without hits"
    );
    for (position, (plain, divided)) in plain_ids.iter().zip(divided_ids.iter()).enumerate() {
        assert_eq!(
            plain, divided,
            "id mismatch at position {} between plain and divided runs",
            position
        );
    }
    assert_eq!(plain_ids.len(), divided_ids.len());
}

#[tokio::test]
async fn test_plain_stream_has_hits() {
    let client = client(sharded_backend());
    let mut stream = client
        .stream(SearchRequest::new().query("*:*").fields(["id"]))
        .unwrap();
    assert!(stream.try_next().await.unwrap().is_some());
}

#[tokio::test]
async fn test_topology_reports_all_shards() {
    let backend = sharded_backend();
    let topology = backend.shard_topology().await.unwrap();
    assert!(topology.len() > 1, "backend should be partitioned");
}

#[tokio::test]
async fn test_shard_divide_always() {
    let request = SearchRequest::new()
        .query("*:*")
        .fields(["id"])
        .shard_divide(ShardDividePolicy::Always)
        .page_size(32)
        .max_results(100);
    assert_docs_equal(request).await;
}

#[tokio::test]
async fn test_shard_divide_auto_true() {
    let request = SearchRequest::new()
        .query("*:*")
        .fields(["id"])
        .shard_divide(ShardDividePolicy::Auto)
        .auto_divide_threshold(10)
        .page_size(32)
        .max_results(100);
    assert_docs_equal(request).await;
}

#[tokio::test]
async fn test_shard_divide_auto_false() {
    let request = SearchRequest::new()
        .query("*:*")
        .fields(["id"])
        .shard_divide(ShardDividePolicy::Auto)
        .auto_divide_threshold(u64::MAX)
        .page_size(32)
        .max_results(100);
    assert_docs_equal(request).await;
}

#[tokio::test]
async fn test_shard_divide_sort_date() {
    let request = SearchRequest::new()
        .query("*:*")
        .fields(["id", "crawl_date"])
        .sort(vec![SortClause::asc("crawl_date")])
        .shard_divide(ShardDividePolicy::Always)
        .page_size(32)
        .max_results(100);
    assert_docs_equal(request).await;
}

#[tokio::test]
async fn test_shard_divide_deduplicate() {
    let request = SearchRequest::new()
        .query("*:*")
        .fields(["id", "domain"])
        .deduplicate_field("domain")
        .shard_divide(ShardDividePolicy::Always)
        .page_size(32)
        .max_results(100);
    assert_docs_equal(request).await;
}

#[tokio::test]
async fn test_shard_divide_time_proximity() {
    let request = SearchRequest::new()
        .query("*:*")
        .fields(["id", "url_norm", "crawl_date"])
        .time_proximity("2019-10-10T19:47:00Z", "url_norm")
        .shard_divide(ShardDividePolicy::Always)
        .page_size(32)
        .max_results(100);
    assert_docs_equal(request).await;
}

#[tokio::test]
async fn test_shard_divide_expand_resources() {
    use async_trait::async_trait;
    use warcdex::{FieldValue, LinkExtractor};

    // Extracts links recorded on the page itself.
    struct FieldLinkExtractor;

    #[async_trait]
    impl LinkExtractor for FieldLinkExtractor {
        async fn resource_links(&self, page: &Record) -> warcdex::Result<Vec<String>> {
            Ok(match page.get("links") {
                Some(FieldValue::Multi(values)) => {
                    values.iter().map(|v| v.to_string()).collect()
                }
                Some(value) => vec![value.to_string()],
                _ => Vec::new(),
            })
        }
    }

    let backend = sharded_backend();
    for i in 0..6 {
        let mut page = capture(1000 + i);
        page.set("content_type_norm", "html");
        page.set("links", format!("https://example.COM/{}", i));
        backend.add_record(&format!("shard{}", i % 3 + 1), page);
    }

    let client = ArchiveClient::from_backend_with_extractor(
        WarcdexConfig::new().cache_capacity(0),
        Arc::clone(&backend) as Arc<dyn SearchBackend>,
        Arc::new(FieldLinkExtractor),
    )
    .unwrap();

    let request = SearchRequest::new()
        .query("content_type_norm:html")
        .fields(["id", "url", "url_norm", "crawl_date", "links"])
        .sort(vec![SortClause::asc("id")])
        .expand_resources(true)
        .shard_divide(ShardDividePolicy::Always)
        .page_size(32)
        .max_results(100);

    let plain_ids = collect_ids(
        &client,
        request.deep_copy().shard_divide(ShardDividePolicy::Never),
    )
    .await;
    let divided_ids = collect_ids(&client, request).await;
    assert!(plain_ids.len() > 6, "expansion should add resource records");
    assert_eq!(plain_ids, divided_ids);
}

#[tokio::test]
async fn test_merged_order_is_non_decreasing() {
    let backend = sharded_backend();
    let client = client(backend);
    let request = SearchRequest::new()
        .query("*:*")
        .fields(["id", "crawl_date"])
        .sort(vec![SortClause::asc("crawl_date")])
        .shard_divide(ShardDividePolicy::Always)
        .page_size(32);
    let comparator = request.deep_copy().normalized().unwrap().comparator();
    let mut stream = client.stream_sharded(request).await.unwrap();
    let records = stream.collect_all().await.unwrap();
    assert_eq!(records.len(), 300);
    assert!(comparator.is_sorted(&records));
}

#[tokio::test]
async fn test_comparator_orders_by_date_then_id() {
    let asc = RecordComparator::new(vec![SortClause::asc("crawl_date"), SortClause::asc("id")]);
    let desc = RecordComparator::new(vec![SortClause::desc("crawl_date"), SortClause::asc("id")]);

    let doc1 = Record::new()
        .with("id", "1")
        .with("crawl_date", "2023-10-10T19:47:00Z");
    let doc2 = Record::new()
        .with("id", "2")
        .with("crawl_date", "2023-10-10T19:47:01Z");

    assert_eq!(asc.compare(&doc1, &doc2), Ordering::Less);
    assert_eq!(asc.compare(&doc2, &doc1), Ordering::Greater);
    assert_eq!(desc.compare(&doc1, &doc2), Ordering::Greater);
}

#[tokio::test]
async fn test_shard_failure_aborts_the_merge() {
    let backend = sharded_backend();
    backend.fail_pages_for_shard("shard2");
    let client = client(backend);
    let request = SearchRequest::new()
        .query("*:*")
        .fields(["id"])
        .shard_divide(ShardDividePolicy::Always);
    let error = match client.stream_sharded(request).await {
        Err(error) => error,
        Ok(mut stream) => stream.collect_all().await.unwrap_err(),
    };
    assert!(matches!(error, WarcdexError::Shard { ref shard, .. } if shard == "shard2"));
}
