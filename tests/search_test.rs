use std::time::{Duration, Instant};

use tempfile::TempDir;
use vulcano::{Config, Db, Document, HnswParams, Query};

fn test_config() -> Config {
    Config::new()
        .data_segment_bytes(256 * 1024)
        .index_segment_bytes(16 * 1024)
        .wal_segment_bytes(64 * 1024)
        .index_buckets(16)
        .ingest_workers(2)
        .hnsw_field("v", HnswParams::with_dimensions(2).block_size(4096))
        .inverted_field("name")
}

#[test]
fn test_two_dimensional_similarity_search() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), test_config()).unwrap();

    let d1 = Document::builder().add_vector("v", vec![1.0, 0.0]).build();
    let d2 = Document::builder().add_vector("v", vec![0.0, 1.0]).build();
    db.add(&d1).unwrap();
    db.add(&d2).unwrap();

    // Exact match: top-1 is d1 with score 1.0.
    let result = db
        .search(&Query::is_similar_to(vec![1.0, 0.0], "v"), Some(1), None)
        .unwrap();
    assert_eq!(result.hits.len(), 1);
    assert_eq!(result.hits[0].document.id(), d1.id());
    assert!((result.hits[0].score - 1.0).abs() < 1e-5);

    // Diagonal query: both documents score 1/sqrt(2).
    let result = db
        .search(&Query::is_similar_to(vec![1.0, 1.0], "v"), Some(2), None)
        .unwrap();
    assert_eq!(result.hits.len(), 2);
    let expected = 1.0 / 2.0f32.sqrt();
    for hit in &result.hits {
        assert!((hit.score - expected).abs() < 1e-4);
    }
    let ids: Vec<_> = result.hits.iter().map(|h| h.document.id()).collect();
    assert!(ids.contains(&d1.id()) && ids.contains(&d2.id()));

    db.close().unwrap();
}

#[test]
fn test_hybrid_name_and_embedding_query() {
    let dir = TempDir::new().unwrap();
    let config = Config::new()
        .data_segment_bytes(256 * 1024)
        .index_segment_bytes(16 * 1024)
        .wal_segment_bytes(64 * 1024)
        .index_buckets(16)
        .hnsw_field("embedding", HnswParams::with_dimensions(2).block_size(4096))
        .inverted_field("name");
    let db = Db::open(dir.path(), config).unwrap();

    // Embeddings biased so the query vector lands closest to "John Doe".
    let people = [
        ("John", vec![1.0, 0.0]),
        ("Jane", vec![0.0, 1.0]),
        ("John Doe", vec![0.9, 0.45]),
        ("Mary Jane", vec![0.2, 0.9]),
    ];
    let mut john_doe_id = None;
    for (name, embedding) in people {
        let doc = Document::builder()
            .add_string("name", name)
            .add_vector("embedding", embedding)
            .build();
        if name == "John Doe" {
            john_doe_id = Some(doc.id());
        }
        db.add(&doc).unwrap();
    }

    let query = Query::starts_with("John", "name")
        .and(Query::is_similar_to(vec![0.9, 0.45], "embedding"));
    let result = db.search(&query, Some(1), None).unwrap();
    assert_eq!(result.hits.len(), 1);
    assert_eq!(result.hits[0].document.id(), john_doe_id.unwrap());

    db.close().unwrap();
}

#[test]
fn test_residual_integer_predicates() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), test_config()).unwrap();

    for (name, age) in [("a", 10), ("b", 20), ("c", 30)] {
        let doc = Document::builder()
            .add_string("name", name)
            .add_integer("age", age)
            .build();
        db.add(&doc).unwrap();
    }

    let result = db
        .search(&Query::is_greater_than_or_equal(20, "age"), None, None)
        .unwrap();
    assert_eq!(result.hits.len(), 2);

    let result = db
        .search(
            &Query::is_less_than(30, "age").and(Query::is_greater_than(10, "age")),
            None,
            None,
        )
        .unwrap();
    assert_eq!(result.hits.len(), 1);
    assert_eq!(
        result.hits[0].document.get("name").unwrap().as_str(),
        Some("b")
    );

    db.close().unwrap();
}

#[test]
fn test_not_query_subtracts_from_universe() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), test_config()).unwrap();

    for name in ["John", "Jane", "Mary"] {
        db.add(&Document::builder().add_string("name", name).build())
            .unwrap();
    }

    let result = db
        .search(&Query::is_equal("John", "name").not(), None, None)
        .unwrap();
    assert_eq!(result.hits.len(), 2);
    for hit in &result.hits {
        assert_ne!(hit.document.get("name").unwrap().as_str(), Some("John"));
    }

    db.close().unwrap();
}

#[test]
fn test_search_result_bounded_by_stored_documents() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), test_config()).unwrap();
    for i in 0..10 {
        db.add(
            &Document::builder()
                .add_string("name", format!("doc-{i}"))
                .build(),
        )
        .unwrap();
    }

    let result = db.search(&Query::match_all(), None, None).unwrap();
    assert_eq!(result.hits.len() as u64, db.document_count());

    let result = db.search(&Query::match_all(), Some(3), None).unwrap();
    assert_eq!(result.hits.len(), 3);

    db.close().unwrap();
}

#[test]
fn test_elapsed_deadline_flags_timeout() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), test_config()).unwrap();
    for i in 0..100 {
        db.add(
            &Document::builder()
                .add_string("name", format!("doc-{i}"))
                .build(),
        )
        .unwrap();
    }

    let expired = Instant::now() - Duration::from_millis(1);
    let result = db.search(&Query::match_all(), None, Some(expired)).unwrap();
    assert!(result.timed_out);

    let generous = Instant::now() + Duration::from_secs(60);
    let result = db
        .search(&Query::match_all(), None, Some(generous))
        .unwrap();
    assert!(!result.timed_out);
    assert_eq!(result.hits.len(), 100);

    db.close().unwrap();
}

#[test]
fn test_scores_sorted_descending_with_id_tie_break() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), test_config()).unwrap();
    for i in 0..5 {
        db.add(
            &Document::builder()
                .add_string("name", format!("same-{i}"))
                .build(),
        )
        .unwrap();
    }

    let result = db
        .search(&Query::starts_with("same", "name"), None, None)
        .unwrap();
    assert_eq!(result.hits.len(), 5);
    for pair in result.hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
        if pair[0].score == pair[1].score {
            assert!(pair[0].internal_id < pair[1].internal_id);
        }
    }

    db.close().unwrap();
}
