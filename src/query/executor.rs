//! Query execution.
//!
//! Splits the query, evaluates the index tree into a candidate set, streams
//! candidates through the residual matcher, and keeps the top results in a
//! bounded min-heap. Deadlines are checked between bitmap evaluations and
//! between residual scoring batches; an elapsed deadline yields the partial
//! result with `timed_out` set.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use crate::document::Document;
use crate::error::{Result, VulcanoError};
use crate::index::hnsw::HnswIndex;
use crate::index::inverted::InvertedIndex;
use crate::query::bitmap::{DocIdSet, IndexContext, physical_plan};
use crate::query::matcher::{self, DocumentMatcher};
use crate::query::planner::{IndexedFields, split};
use crate::query::{Query, QueryNode};

const DEADLINE_BATCH: usize = 64;

/// One ranked search hit.
#[derive(Debug, Clone)]
pub struct Hit {
    pub internal_id: u64,
    pub score: f32,
    pub document: Document,
}

/// The result of a search.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub hits: Vec<Hit>,
    pub timed_out: bool,
}

/// Loads documents by internal id during residual evaluation.
pub trait DocumentSource {
    fn load(&self, internal_id: u64) -> Result<Option<Document>>;
}

/// Everything the executor needs from the engine.
pub struct ExecutorContext<'a> {
    pub source: &'a dyn DocumentSource,
    pub inverted: &'a HashMap<String, InvertedIndex>,
    pub hnsw: &'a HashMap<String, HnswIndex>,
    pub indexed: &'a IndexedFields,
    pub universe: &'a DocIdSet,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapEntry {
    score: f32,
    internal_id: u64,
}

impl Eq for HeapEntry {}

// Higher score first; equal scores break toward the lower internal id.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.internal_id.cmp(&self.internal_id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Execute `query`, returning at most `max_results` hits ordered by
/// descending score.
pub fn execute(
    ctx: &ExecutorContext<'_>,
    query: &Query,
    max_results: Option<usize>,
    deadline: Option<Instant>,
) -> Result<QueryResult> {
    let planned = split(query.root(), ctx.indexed);

    let ann_k = match max_results {
        Some(k) if k > 0 => k.max(1),
        _ => ctx.universe.len().max(1) as usize,
    };

    let index_ctx = IndexContext {
        inverted: ctx.inverted,
        hnsw: ctx.hnsw,
        universe: ctx.universe,
        ann_k,
        deadline,
        scores: RefCell::new(HashMap::new()),
    };

    // MatchAll is the universe sentinel: iterate live ids directly instead
    // of materializing a copy.
    let candidates = if planned.index_tree == QueryNode::MatchAll {
        None
    } else {
        match physical_plan(&planned.index_tree)?.compute(&index_ctx) {
            Ok(set) => Some(set),
            Err(VulcanoError::Timeout) => {
                return Ok(QueryResult {
                    hits: Vec::new(),
                    timed_out: true,
                });
            }
            Err(e) => return Err(e),
        }
    };
    let idx_scores = index_ctx.scores.into_inner();

    let residual_is_match_all = planned.residual_tree == QueryNode::MatchAll;
    let residual: Box<dyn DocumentMatcher> = matcher::compile(&planned.residual_tree);

    let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::new();
    let mut documents: HashMap<u64, Document> = HashMap::new();
    let mut timed_out = false;
    let mut processed = 0usize;

    let iter: Box<dyn Iterator<Item = u64>> = match &candidates {
        Some(set) => Box::new(set.iter().collect::<Vec<_>>().into_iter()),
        None => Box::new(ctx.universe.iter().collect::<Vec<_>>().into_iter()),
    };

    for internal_id in iter {
        if processed % DEADLINE_BATCH == 0 {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    timed_out = true;
                    break;
                }
            }
        }
        processed += 1;

        // Ids can outlive their documents (tombstoned or rolled back);
        // missing documents are skipped, not errors.
        let Some(document) = ctx.source.load(internal_id)? else {
            continue;
        };

        let index_score = idx_scores.get(&internal_id).copied();
        let score = if residual_is_match_all {
            index_score.unwrap_or(1.0)
        } else {
            let residual_score = residual.evaluate(&document);
            if !residual_score.matches {
                continue;
            }
            // Geometric mean of the index score (neutral 1 when absent)
            // and the residual score.
            (index_score.unwrap_or(1.0) * residual_score.score).sqrt()
        };

        let entry = HeapEntry {
            score,
            internal_id,
        };
        if let Some(limit) = max_results {
            if heap.len() == limit {
                let worst = heap.peek().map(|r| r.0).unwrap_or(entry);
                if entry.cmp(&worst) == std::cmp::Ordering::Greater {
                    if let Some(Reverse(evicted)) = heap.pop() {
                        documents.remove(&evicted.internal_id);
                    }
                } else {
                    continue;
                }
            }
        }
        documents.insert(internal_id, document);
        heap.push(Reverse(entry));
    }

    let mut ranked: Vec<HeapEntry> = heap.into_iter().map(|r| r.0).collect();
    ranked.sort_by(|a, b| b.cmp(a));

    let hits = ranked
        .into_iter()
        .filter_map(|entry| {
            documents.remove(&entry.internal_id).map(|document| Hit {
                internal_id: entry.internal_id,
                score: entry.score,
                document,
            })
        })
        .collect();

    Ok(QueryResult { hits, timed_out })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;

    struct MapSource(HashMap<u64, Document>);

    impl DocumentSource for MapSource {
        fn load(&self, internal_id: u64) -> Result<Option<Document>> {
            Ok(self.0.get(&internal_id).cloned())
        }
    }

    fn make_ctx<'a>(
        source: &'a MapSource,
        empty_inverted: &'a HashMap<String, InvertedIndex>,
        empty_hnsw: &'a HashMap<String, HnswIndex>,
        indexed: &'a IndexedFields,
        universe: &'a DocIdSet,
    ) -> ExecutorContext<'a> {
        ExecutorContext {
            source,
            inverted: empty_inverted,
            hnsw: empty_hnsw,
            indexed,
            universe,
        }
    }

    fn people() -> MapSource {
        let mut docs = HashMap::new();
        for (id, name, age) in [
            (1u64, "John", 25),
            (2, "Jane", 35),
            (3, "John Doe", 45),
            (4, "Mary Jane", 55),
        ] {
            docs.insert(
                id,
                Document::builder()
                    .add_string("name", name)
                    .add_integer("age", age)
                    .build(),
            );
        }
        MapSource(docs)
    }

    #[test]
    fn test_residual_only_query() {
        let source = people();
        let inverted = HashMap::new();
        let hnsw = HashMap::new();
        let indexed = IndexedFields::default();
        let universe: DocIdSet = (1u64..=4).collect();
        let ctx = make_ctx(&source, &inverted, &hnsw, &indexed, &universe);

        let result = execute(
            &ctx,
            &Query::starts_with("John", "name"),
            None,
            None,
        )
        .unwrap();
        assert_eq!(result.hits.len(), 2);
        assert!(!result.timed_out);
        // Equal scores: lower internal id first.
        assert_eq!(result.hits[0].internal_id, 1);
        assert_eq!(result.hits[1].internal_id, 3);
    }

    #[test]
    fn test_max_results_truncates() {
        let source = people();
        let inverted = HashMap::new();
        let hnsw = HashMap::new();
        let indexed = IndexedFields::default();
        let universe: DocIdSet = (1u64..=4).collect();
        let ctx = make_ctx(&source, &inverted, &hnsw, &indexed, &universe);

        let result = execute(&ctx, &Query::match_all(), Some(2), None).unwrap();
        assert_eq!(result.hits.len(), 2);
        assert_eq!(result.hits[0].internal_id, 1);
        assert_eq!(result.hits[1].internal_id, 2);
    }

    #[test]
    fn test_and_of_residual_predicates() {
        let source = people();
        let inverted = HashMap::new();
        let hnsw = HashMap::new();
        let indexed = IndexedFields::default();
        let universe: DocIdSet = (1u64..=4).collect();
        let ctx = make_ctx(&source, &inverted, &hnsw, &indexed, &universe);

        let query = Query::contains("Jane", "name").and(Query::is_greater_than(40, "age"));
        let result = execute(&ctx, &query, None, None).unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].internal_id, 4);
    }

    #[test]
    fn test_expired_deadline_returns_partial() {
        let source = people();
        let inverted = HashMap::new();
        let hnsw = HashMap::new();
        let indexed = IndexedFields::default();
        let universe: DocIdSet = (1u64..=4).collect();
        let ctx = make_ctx(&source, &inverted, &hnsw, &indexed, &universe);

        let past = Instant::now() - std::time::Duration::from_secs(1);
        let result = execute(&ctx, &Query::match_all(), None, Some(past)).unwrap();
        assert!(result.timed_out);
        assert!(result.hits.is_empty());
    }

    #[test]
    fn test_missing_documents_are_skipped() {
        let source = people();
        let inverted = HashMap::new();
        let hnsw = HashMap::new();
        let indexed = IndexedFields::default();
        // Universe references an id with no document.
        let universe: DocIdSet = (1u64..=5).collect();
        let ctx = make_ctx(&source, &inverted, &hnsw, &indexed, &universe);

        let result = execute(&ctx, &Query::match_all(), None, None).unwrap();
        assert_eq!(result.hits.len(), 4);
    }
}
