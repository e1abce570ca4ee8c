//! URL resolution scenarios: direct lookup, nearest-in-time re-ranking
//! and the lenient fallback with its observability counters.

use std::sync::Arc;

use warcdex::memory_backend::MemoryBackend;
use warcdex::{ArchiveClient, Record, ResolutionStage, WarcdexConfig};

const URL_1: &str = "https://www.EXAMPLE.org/foo?bar=hest&zoo=pling";
const URL_2: &str = "https://www.EXAMPLE.org/foo?bar=ged&zoo=ooling";
const URL_2_FAULTY: &str = "https://www.EXAMPLE.org/foo?bar=hest&zoo=ooling"; // hest is wrong
const URL_NONEXISTING: &str = "https://www.EXAMPLE.org/drop?bar=ged&zoo=ooling"; // drop is wrong

fn capture(
    id: &str,
    crawl_date: &str,
    url: &str,
    url_norm: &str,
    url_search: &str,
    offset: i64,
) -> Record {
    Record::new()
        .with("id", id)
        .with("host", "example.org")
        .with("crawl_date", crawl_date)
        .with("url", url)
        .with("url_norm", url_norm)
        .with("url_search", url_search)
        .with("record_type", "response")
        .with("status_code", 200)
        .with("source_file_path", "somepath")
        .with("source_file_offset", offset)
}

fn filled_backend() -> Arc<MemoryBackend> {
    let backend = MemoryBackend::new();
    backend.add_record(
        "shard1",
        capture(
            "doc_1_old",
            "2018-11-04T13:51:00Z",
            URL_1,
            "http://example.org/foo?bar=hest&zoo=pling",
            "http example org foo bar=hest zoo=pling",
            87,
        ),
    );
    backend.add_record(
        "shard1",
        capture(
            "doc_2_old",
            "2019-11-04T13:51:00Z",
            URL_2,
            "http://example.org/foo?bar=ged&zoo=ooling",
            "http example org foo bar=ged zoo=ooling",
            88,
        ),
    );
    backend.add_record(
        "shard1",
        capture(
            "doc_2_new",
            "2022-11-04T11:51:00Z",
            URL_2,
            "http://example.org/foo?bar=ged&zoo=ooling",
            "http example org foo bar=ged zoo=ooling",
            80,
        ),
    );
    backend.add_record(
        "shard1",
        capture(
            "doc_3",
            "2022-11-04T13:51:00Z",
            URL_2,
            "http://example.org/foo?bar=ged&zoo=ooling",
            "http example org foo bar=ged zoo=ooling",
            88,
        ),
    );
    Arc::new(backend)
}

fn client(backend: Arc<MemoryBackend>) -> ArchiveClient {
    ArchiveClient::from_backend(WarcdexConfig::new().cache_capacity(0), backend).unwrap()
}

#[tokio::test]
async fn test_direct_match_does_not_trigger_lenient() {
    let client = client(filled_backend());
    let outcomes = client.search_urls([URL_1]).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].stage, ResolutionStage::Direct);
    assert_eq!(client.resolver().lenient_attempts(), 0);
    assert_eq!(client.resolver().lenient_successes(), 0);
}

#[tokio::test]
async fn test_time_proximity_without_lenient() {
    let client = client(filled_backend());

    let docs = client
        .find_nearest_records([URL_2], "2022-11-02T13:54:00Z")
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    // Three captures exist; the one just before the anchor is nearest.
    assert_eq!(docs[0].id(), Some("doc_2_new"));
    assert_eq!(client.resolver().lenient_attempts(), 0);
    assert_eq!(client.resolver().lenient_successes(), 0);

    let docs = client
        .find_nearest_records([URL_2_FAULTY], "2022-11-02T13:54:00Z")
        .await
        .unwrap();
    assert!(docs.is_empty());
    assert_eq!(client.resolver().lenient_attempts(), 0);
}

#[tokio::test]
async fn test_time_proximity_lenient_fallback() {
    let client = client(filled_backend());

    // Direct url_norm match: lenient never engages.
    let docs = client
        .find_nearest_lenient([URL_2], "2022-11-02T13:54:00Z")
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(client.resolver().lenient_attempts(), 0);
    assert_eq!(client.resolver().lenient_successes(), 0);

    // No direct match: the weighted fallback finds the most similar URL
    // (the one sharing the rare bar=hest parameter) and bumps both
    // counters.
    let docs = client
        .find_nearest_lenient([URL_2_FAULTY], "2022-11-02T13:54:00Z")
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id(), Some("doc_1_old"));
    assert_eq!(client.resolver().lenient_attempts(), 1);
    assert_eq!(client.resolver().lenient_successes(), 1);
}

#[tokio::test]
async fn test_lenient_trigger_success_counters() {
    let client = client(filled_backend());
    let outcomes = client.search_urls([URL_2_FAULTY]).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].stage, ResolutionStage::Lenient);
    assert_eq!(client.resolver().lenient_attempts(), 1);
    assert_eq!(client.resolver().lenient_successes(), 1);
}

#[tokio::test]
async fn test_lenient_trigger_fail_counters() {
    let client = client(filled_backend());
    let outcomes = client.search_urls([URL_NONEXISTING]).await.unwrap();
    assert!(outcomes.is_empty());
    assert_eq!(client.resolver().lenient_attempts(), 1);
    assert_eq!(client.resolver().lenient_successes(), 0);
}

#[tokio::test]
async fn test_resolution_stage_scenario() {
    let client = client(filled_backend());

    // Capture exactly at the anchor resolves directly.
    let outcome = client
        .resolve_url(URL_2, "2022-11-04T11:51:00Z")
        .await
        .unwrap()
        .expect("direct resolution");
    assert_eq!(outcome.stage, ResolutionStage::Direct);
    assert_eq!(outcome.record.id(), Some("doc_2_new"));
    assert_eq!(client.resolver().lenient_attempts(), 0);

    // Mistyped variant resolves leniently.
    let outcome = client
        .resolve_url(URL_2_FAULTY, "2022-11-04T11:51:00Z")
        .await
        .unwrap()
        .expect("lenient resolution");
    assert_eq!(outcome.stage, ResolutionStage::Lenient);
    assert_eq!(client.resolver().lenient_attempts(), 1);
    assert_eq!(client.resolver().lenient_successes(), 1);

    // A URL sharing nothing with the index stays unresolved.
    let outcome = client
        .resolve_url("https://unrelated.test/nothing", "2022-11-04T11:51:00Z")
        .await
        .unwrap();
    assert!(outcome.is_none());
    assert_eq!(client.resolver().lenient_attempts(), 2);
    assert_eq!(client.resolver().lenient_successes(), 1);
}

#[tokio::test]
async fn test_nearest_match_survives_unstable_backend_sort() {
    // Candidates at 9, 5, 2 and 2 minutes from the anchor. The backend's
    // distance sort only resolves 10-minute buckets, so its row 0 is
    // decided by the id tie-break and lands on the 9-minute capture. The
    // local re-rank must still return the minimal-distance candidate.
    let backend = Arc::new(MemoryBackend::new());
    let anchor = "2020-06-01T12:00:00Z";
    for (id, date) in [
        ("a_nine", "2020-06-01T12:09:00Z"),
        ("b_five", "2020-06-01T11:55:00Z"),
        ("c_two", "2020-06-01T12:02:00Z"),
        ("d_two", "2020-06-01T11:58:00Z"),
    ] {
        backend.add_record(
            "shard1",
            Record::new()
                .with("id", id)
                .with("url", "http://example.org/page")
                .with("url_norm", "http://example.org/page")
                .with("record_type", "response")
                .with("status_code", 200)
                .with("crawl_date", date)
                .with("source_file_path", "somepath")
                .with("source_file_offset", 1),
        );
    }
    backend.set_coarse_time_sort(true);

    let client = client(backend);
    let hit = client
        .find_closest_capture("http://example.org/page", anchor)
        .await
        .unwrap()
        .expect("a capture should resolve");
    assert_eq!(hit.id(), Some("c_two"));
}

#[tokio::test]
async fn test_protocol_must_match() {
    let backend = Arc::new(MemoryBackend::new());
    backend.add_record(
        "shard1",
        Record::new()
            .with("id", "https_only")
            .with("url", "https://example.org/sec")
            .with("url_norm", "http://example.org/sec")
            .with("record_type", "response")
            .with("status_code", 200)
            .with("crawl_date", "2020-06-01T12:00:00Z")
            .with("source_file_path", "somepath")
            .with("source_file_offset", 1),
    );
    let client = client(backend);

    // Same canonical URL, but the only capture is https.
    let miss = client
        .find_closest_capture("http://example.org/sec", "2020-06-01T12:00:00Z")
        .await
        .unwrap();
    assert!(miss.is_none());

    let hit = client
        .find_closest_capture("https://example.org/sec", "2020-06-01T12:00:00Z")
        .await
        .unwrap();
    assert_eq!(hit.unwrap().id(), Some("https_only"));
}

#[tokio::test]
async fn test_trailing_slash_is_preserved() {
    let backend = Arc::new(MemoryBackend::new());
    for (id, url, date) in [
        ("without_slash", "http://example.org/dir", "2020-06-01T12:00:00Z"),
        ("with_slash", "http://example.org/dir/", "2020-06-01T13:00:00Z"),
    ] {
        backend.add_record(
            "shard1",
            Record::new()
                .with("id", id)
                .with("url", url)
                .with("url_norm", "http://example.org/dir")
                .with("record_type", "response")
                .with("status_code", 200)
                .with("crawl_date", date)
                .with("source_file_path", "somepath")
                .with("source_file_offset", 1),
        );
    }
    let client = client(backend);

    // Both captures canonicalize identically, but a trailing-slash query
    // must not resolve to the slashless page, even though it is nearer.
    let hit = client
        .find_closest_capture("http://example.org/dir/", "2020-06-01T12:00:00Z")
        .await
        .unwrap();
    assert_eq!(hit.unwrap().id(), Some("with_slash"));

    // A slashless query may use either capture; the nearest wins.
    let hit = client
        .find_closest_capture("http://example.org/dir", "2020-06-01T12:00:00Z")
        .await
        .unwrap();
    assert_eq!(hit.unwrap().id(), Some("without_slash"));
}
