use tempfile::TempDir;
use vulcano::{Config, Db, Document, Query};

fn names_db(dir: &TempDir) -> Db {
    let config = Config::new()
        .data_segment_bytes(256 * 1024)
        .index_segment_bytes(16 * 1024)
        .wal_segment_bytes(64 * 1024)
        .index_buckets(16)
        .inverted_field("name");
    let db = Db::open(dir.path(), config).unwrap();
    for name in ["John", "Jane", "John Doe", "Mary Jane"] {
        let doc = Document::builder().add_string("name", name).build();
        assert!(db.add(&doc).unwrap().success);
    }
    db
}

#[test]
fn test_string_operator_cardinalities() {
    let dir = TempDir::new().unwrap();
    let db = names_db(&dir);

    let count = |query: Query| db.search(&query, None, None).unwrap().hits.len();

    assert_eq!(count(Query::is_equal("John", "name")), 1);
    assert_eq!(count(Query::starts_with("John", "name")), 2);
    assert_eq!(count(Query::ends_with("Jane", "name")), 2);
    assert_eq!(count(Query::contains("n", "name")), 4);

    db.close().unwrap();
}

#[test]
fn test_indexed_and_residual_agree() {
    // The same predicates over an unindexed field must match the same
    // documents, just through the residual path.
    let dir = TempDir::new().unwrap();
    let config = Config::new()
        .data_segment_bytes(256 * 1024)
        .index_segment_bytes(16 * 1024)
        .wal_segment_bytes(64 * 1024)
        .index_buckets(16);
    let db = Db::open(dir.path(), config).unwrap();
    for name in ["John", "Jane", "John Doe", "Mary Jane"] {
        db.add(&Document::builder().add_string("name", name).build())
            .unwrap();
    }

    let count = |query: Query| db.search(&query, None, None).unwrap().hits.len();
    assert_eq!(count(Query::is_equal("John", "name")), 1);
    assert_eq!(count(Query::starts_with("John", "name")), 2);
    assert_eq!(count(Query::ends_with("Jane", "name")), 2);
    assert_eq!(count(Query::contains("n", "name")), 4);

    db.close().unwrap();
}

#[test]
fn test_boolean_composition_over_index() {
    let dir = TempDir::new().unwrap();
    let db = names_db(&dir);

    let result = db
        .search(
            &Query::starts_with("John", "name").or(Query::ends_with("Jane", "name")),
            None,
            None,
        )
        .unwrap();
    assert_eq!(result.hits.len(), 4);

    let result = db
        .search(
            &Query::starts_with("John", "name").and(Query::contains("Doe", "name")),
            None,
            None,
        )
        .unwrap();
    assert_eq!(result.hits.len(), 1);
    assert_eq!(
        result.hits[0].document.get("name").unwrap().as_str(),
        Some("John Doe")
    );

    db.close().unwrap();
}

#[test]
fn test_removed_document_leaves_stale_posting_invisible() {
    let dir = TempDir::new().unwrap();
    let db = names_db(&dir);

    let result = db
        .search(&Query::is_equal("John", "name"), None, None)
        .unwrap();
    let john = result.hits[0].document.id();
    db.remove(&john).unwrap();

    // The posting list still contains the id; the executor drops it when
    // the document fails to load.
    let result = db
        .search(&Query::is_equal("John", "name"), None, None)
        .unwrap();
    assert!(result.hits.is_empty());
    assert_eq!(db.document_count(), 3);

    db.close().unwrap();
}

#[test]
fn test_index_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = names_db(&dir);
        db.close().unwrap();
    }
    let config = Config::new()
        .data_segment_bytes(256 * 1024)
        .index_segment_bytes(16 * 1024)
        .wal_segment_bytes(64 * 1024)
        .index_buckets(16)
        .inverted_field("name");
    let db = Db::open(dir.path(), config).unwrap();
    let result = db
        .search(&Query::starts_with("John", "name"), None, None)
        .unwrap();
    assert_eq!(result.hits.len(), 2);
    db.close().unwrap();
}
