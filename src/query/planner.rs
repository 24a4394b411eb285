//! Query planner: index/residual split.
//!
//! Walks the logical tree and routes every leaf either to the index tree
//! (evaluated via bitmaps) or the residual tree (evaluated per document),
//! based on which fields carry indexes. `MatchAll` acts as the neutral
//! element on both sides.

use std::collections::HashSet;

use crate::query::QueryNode;

/// Which fields carry which index, as declared in the configuration.
#[derive(Debug, Clone, Default)]
pub struct IndexedFields {
    pub inverted: HashSet<String>,
    pub hnsw: HashSet<String>,
}

impl IndexedFields {
    fn string_indexed(&self, field: &str) -> bool {
        self.inverted.contains(field)
    }

    fn vector_indexed(&self, field: &str) -> bool {
        self.hnsw.contains(field)
    }
}

/// The split result: `(index_tree, residual_tree)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedQuery {
    pub index_tree: QueryNode,
    pub residual_tree: QueryNode,
}

/// Split `node` into index and residual trees.
pub fn split(node: &QueryNode, indexed: &IndexedFields) -> PlannedQuery {
    let (index_tree, residual_tree) = split_node(node, indexed);
    PlannedQuery {
        index_tree,
        residual_tree,
    }
}

fn split_node(node: &QueryNode, indexed: &IndexedFields) -> (QueryNode, QueryNode) {
    match node {
        QueryNode::MatchAll => (QueryNode::MatchAll, QueryNode::MatchAll),
        QueryNode::MatchNone => (QueryNode::MatchNone, QueryNode::MatchAll),
        QueryNode::StringLeaf { field, .. } => {
            if indexed.string_indexed(field) {
                (node.clone(), QueryNode::MatchAll)
            } else {
                (QueryNode::MatchAll, node.clone())
            }
        }
        QueryNode::IntLeaf { .. } => (QueryNode::MatchAll, node.clone()),
        QueryNode::SimilarTo { field, .. } => {
            if indexed.vector_indexed(field) {
                (node.clone(), QueryNode::MatchAll)
            } else {
                (QueryNode::MatchAll, node.clone())
            }
        }
        QueryNode::SimilarToAll { fields, .. } => {
            if !fields.is_empty() && fields.iter().all(|f| indexed.vector_indexed(f)) {
                (node.clone(), QueryNode::MatchAll)
            } else {
                (QueryNode::MatchAll, node.clone())
            }
        }
        QueryNode::And(left, right) => {
            let (index_l, residual_l) = split_node(left, indexed);
            let (index_r, residual_r) = split_node(right, indexed);
            (and(index_l, index_r), and(residual_l, residual_r))
        }
        QueryNode::Or(left, right) => {
            let (index_l, residual_l) = split_node(left, indexed);
            let (index_r, residual_r) = split_node(right, indexed);
            if residual_l == QueryNode::MatchAll && residual_r == QueryNode::MatchAll {
                (
                    QueryNode::Or(Box::new(index_l), Box::new(index_r)),
                    QueryNode::MatchAll,
                )
            } else {
                (QueryNode::MatchAll, node.clone())
            }
        }
        QueryNode::Not(inner) => {
            let (index_inner, residual_inner) = split_node(inner, indexed);
            if residual_inner == QueryNode::MatchAll {
                (QueryNode::Not(Box::new(index_inner)), QueryNode::MatchAll)
            } else {
                (QueryNode::MatchAll, node.clone())
            }
        }
    }
}

fn and(left: QueryNode, right: QueryNode) -> QueryNode {
    match (left, right) {
        (QueryNode::MatchAll, x) | (x, QueryNode::MatchAll) => x,
        (QueryNode::MatchNone, _) | (_, QueryNode::MatchNone) => QueryNode::MatchNone,
        (l, r) => QueryNode::And(Box::new(l), Box::new(r)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;

    fn indexed() -> IndexedFields {
        let mut fields = IndexedFields::default();
        fields.inverted.insert("name".to_string());
        fields.hnsw.insert("embedding".to_string());
        fields
    }

    #[test]
    fn test_indexed_leaf_goes_to_index_tree() {
        let query = Query::starts_with("Jo", "name");
        let planned = split(query.root(), &indexed());
        assert_eq!(planned.index_tree, query.root().clone());
        assert_eq!(planned.residual_tree, QueryNode::MatchAll);
    }

    #[test]
    fn test_unindexed_leaf_goes_to_residual() {
        let query = Query::is_equal("x", "city");
        let planned = split(query.root(), &indexed());
        assert_eq!(planned.index_tree, QueryNode::MatchAll);
        assert_eq!(planned.residual_tree, query.root().clone());
    }

    #[test]
    fn test_int_leaf_is_always_residual() {
        let query = Query::is_greater_than(10, "age");
        let planned = split(query.root(), &indexed());
        assert_eq!(planned.index_tree, QueryNode::MatchAll);
        assert_eq!(planned.residual_tree, query.root().clone());
    }

    #[test]
    fn test_and_splits_both_sides() {
        let query = Query::starts_with("Jo", "name").and(Query::is_greater_than(10, "age"));
        let planned = split(query.root(), &indexed());
        // Index side keeps only the indexed leaf; MatchAll is absorbed.
        assert!(matches!(planned.index_tree, QueryNode::StringLeaf { .. }));
        assert!(matches!(planned.residual_tree, QueryNode::IntLeaf { .. }));
    }

    #[test]
    fn test_or_with_residual_side_moves_whole_tree() {
        let query = Query::starts_with("Jo", "name").or(Query::is_greater_than(10, "age"));
        let planned = split(query.root(), &indexed());
        assert_eq!(planned.index_tree, QueryNode::MatchAll);
        assert_eq!(planned.residual_tree, query.root().clone());
    }

    #[test]
    fn test_or_fully_indexed_stays_in_index_tree() {
        let query = Query::starts_with("Jo", "name")
            .or(Query::is_similar_to(vec![1.0, 0.0], "embedding"));
        let planned = split(query.root(), &indexed());
        assert!(matches!(planned.index_tree, QueryNode::Or(_, _)));
        assert_eq!(planned.residual_tree, QueryNode::MatchAll);
    }

    #[test]
    fn test_not_fully_indexed() {
        let query = Query::is_equal("John", "name").not();
        let planned = split(query.root(), &indexed());
        assert!(matches!(planned.index_tree, QueryNode::Not(_)));
        assert_eq!(planned.residual_tree, QueryNode::MatchAll);
    }

    #[test]
    fn test_not_residual_moves_whole_subtree() {
        let query = Query::is_greater_than(1, "age").not();
        let planned = split(query.root(), &indexed());
        assert_eq!(planned.index_tree, QueryNode::MatchAll);
        assert_eq!(planned.residual_tree, query.root().clone());
    }

    #[test]
    fn test_match_none_short_circuits_and() {
        let query = Query::match_none().and(Query::starts_with("Jo", "name"));
        let planned = split(query.root(), &indexed());
        assert_eq!(planned.index_tree, QueryNode::MatchNone);
    }

    #[test]
    fn test_similar_to_all_requires_every_field_indexed() {
        let both = Query::all_similar_to(
            vec![1.0],
            vec!["embedding".to_string(), "other".to_string()],
        );
        let planned = split(both.root(), &indexed());
        assert_eq!(planned.index_tree, QueryNode::MatchAll);
        assert_eq!(planned.residual_tree, both.root().clone());
    }
}
