//! Residual document matchers.
//!
//! The residual half of a planned query is evaluated per document into a
//! [`Score`]: a match flag plus a similarity-compatible score in `[0, 1]`.
//! The combinators fix the algebra: AND takes the geometric mean, OR the
//! arithmetic mean, NOT the complement.

use crate::document::{Document, FieldValue};
use crate::index::similarity::{Cosine, Similarity, matrix_similarity};
use crate::query::{IntMatch, QueryNode, StringMatch};

/// Boolean match plus unified score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub matches: bool,
    pub score: f32,
}

impl Score {
    pub const MATCH_ALL: Score = Score {
        matches: true,
        score: 1.0,
    };

    pub const NO_MATCH: Score = Score {
        matches: false,
        score: 0.0,
    };

    fn matched(score: f32) -> Score {
        Score {
            matches: true,
            score,
        }
    }

    /// `matches = a && b`; `score = sqrt(a * b)` when both match.
    pub fn and(self, other: Score) -> Score {
        if self.matches && other.matches {
            Score::matched((self.score * other.score).sqrt())
        } else {
            Score::NO_MATCH
        }
    }

    /// `matches = a || b`; `score = (a + b) / 2` when either matches.
    pub fn or(self, other: Score) -> Score {
        if self.matches || other.matches {
            Score::matched((self.score + other.score) / 2.0)
        } else {
            Score::NO_MATCH
        }
    }

    /// `matches = !a`; `score = 1 - a.score`.
    pub fn negate(self) -> Score {
        Score {
            matches: !self.matches,
            score: (1.0 - self.score).clamp(0.0, 1.0),
        }
    }
}

/// A compiled residual predicate.
pub trait DocumentMatcher: Send + Sync {
    fn evaluate(&self, document: &Document) -> Score;
}

struct MatchAllMatcher;

impl DocumentMatcher for MatchAllMatcher {
    fn evaluate(&self, _document: &Document) -> Score {
        Score::MATCH_ALL
    }
}

struct MatchNoneMatcher;

impl DocumentMatcher for MatchNoneMatcher {
    fn evaluate(&self, _document: &Document) -> Score {
        Score::NO_MATCH
    }
}

struct StringMatcher {
    field: String,
    op: StringMatch,
    value: String,
}

impl DocumentMatcher for StringMatcher {
    fn evaluate(&self, document: &Document) -> Score {
        match document.get(&self.field) {
            Some(FieldValue::String(term)) => {
                let matched = match self.op {
                    StringMatch::Equals => term == &self.value,
                    StringMatch::StartsWith => term.starts_with(&self.value),
                    StringMatch::EndsWith => term.ends_with(&self.value),
                    StringMatch::Contains => term.contains(&self.value),
                };
                if matched {
                    Score::MATCH_ALL
                } else {
                    Score::NO_MATCH
                }
            }
            _ => Score::NO_MATCH,
        }
    }
}

struct IntMatcher {
    field: String,
    op: IntMatch,
    value: i32,
}

impl DocumentMatcher for IntMatcher {
    fn evaluate(&self, document: &Document) -> Score {
        match document.get(&self.field) {
            Some(FieldValue::Integer(actual)) => {
                if self.op.matches(*actual, self.value) {
                    Score::MATCH_ALL
                } else {
                    Score::NO_MATCH
                }
            }
            _ => Score::NO_MATCH,
        }
    }
}

struct SimilarityMatcher {
    fields: Vec<String>,
    vector: Vec<f32>,
    sim: Cosine,
}

impl SimilarityMatcher {
    /// Similarity of the query vector against one field value, clamped to
    /// `[0, 1]`. Matrix fields score as the mean of row similarities.
    fn field_score(&self, document: &Document, field: &str) -> Option<f32> {
        match document.get(field)? {
            FieldValue::Vector(v) => {
                if v.len() != self.vector.len() {
                    return None;
                }
                Some(self.sim.score(&self.vector, v).clamp(0.0, 1.0))
            }
            FieldValue::Matrix(m) => {
                Some(matrix_similarity(&self.sim, &self.vector, m).clamp(0.0, 1.0))
            }
            _ => None,
        }
    }
}

impl DocumentMatcher for SimilarityMatcher {
    fn evaluate(&self, document: &Document) -> Score {
        // Short-circuit AND over fields: one zero partial fails the leaf.
        let mut total = 0.0f32;
        for field in &self.fields {
            match self.field_score(document, field) {
                Some(score) if score > 0.0 => total += score,
                _ => return Score::NO_MATCH,
            }
        }
        if self.fields.is_empty() {
            return Score::NO_MATCH;
        }
        Score {
            matches: true,
            score: total / self.fields.len() as f32,
        }
    }
}

struct AndMatcher {
    left: Box<dyn DocumentMatcher>,
    right: Box<dyn DocumentMatcher>,
}

impl DocumentMatcher for AndMatcher {
    fn evaluate(&self, document: &Document) -> Score {
        self.left
            .evaluate(document)
            .and(self.right.evaluate(document))
    }
}

struct OrMatcher {
    left: Box<dyn DocumentMatcher>,
    right: Box<dyn DocumentMatcher>,
}

impl DocumentMatcher for OrMatcher {
    fn evaluate(&self, document: &Document) -> Score {
        self.left
            .evaluate(document)
            .or(self.right.evaluate(document))
    }
}

struct NotMatcher {
    inner: Box<dyn DocumentMatcher>,
}

impl DocumentMatcher for NotMatcher {
    fn evaluate(&self, document: &Document) -> Score {
        self.inner.evaluate(document).negate()
    }
}

/// Compile a residual tree into a matcher.
pub fn compile(node: &QueryNode) -> Box<dyn DocumentMatcher> {
    match node {
        QueryNode::MatchAll => Box::new(MatchAllMatcher),
        QueryNode::MatchNone => Box::new(MatchNoneMatcher),
        QueryNode::StringLeaf { field, op, value } => Box::new(StringMatcher {
            field: field.clone(),
            op: *op,
            value: value.clone(),
        }),
        QueryNode::IntLeaf { field, op, value } => Box::new(IntMatcher {
            field: field.clone(),
            op: *op,
            value: *value,
        }),
        QueryNode::SimilarTo { field, vector } => Box::new(SimilarityMatcher {
            fields: vec![field.clone()],
            vector: vector.clone(),
            sim: Cosine,
        }),
        QueryNode::SimilarToAll { fields, vector } => Box::new(SimilarityMatcher {
            fields: fields.clone(),
            vector: vector.clone(),
            sim: Cosine,
        }),
        QueryNode::And(left, right) => Box::new(AndMatcher {
            left: compile(left),
            right: compile(right),
        }),
        QueryNode::Or(left, right) => Box::new(OrMatcher {
            left: compile(left),
            right: compile(right),
        }),
        QueryNode::Not(inner) => Box::new(NotMatcher {
            inner: compile(inner),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Matrix;
    use crate::query::Query;

    fn john() -> Document {
        Document::builder()
            .add_string("name", "John Doe")
            .add_integer("age", 30)
            .add_vector("v", vec![1.0, 0.0])
            .build()
    }

    #[test]
    fn test_score_combinators() {
        let a = Score {
            matches: true,
            score: 0.5,
        };
        let b = Score {
            matches: true,
            score: 0.8,
        };
        assert!((a.and(b).score - (0.5f32 * 0.8).sqrt()).abs() < 1e-6);
        assert!((a.or(b).score - 0.65).abs() < 1e-6);
        assert!((a.negate().score - 0.5).abs() < 1e-6);
        assert!(!a.negate().matches);

        let miss = Score::NO_MATCH;
        assert_eq!(a.and(miss), Score::NO_MATCH);
        assert!((a.or(miss).score - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_string_and_int_matchers() {
        let doc = john();
        assert!(compile(Query::starts_with("John", "name").root())
            .evaluate(&doc)
            .matches);
        assert!(compile(Query::contains("Doe", "name").root())
            .evaluate(&doc)
            .matches);
        assert!(!compile(Query::is_equal("John", "name").root())
            .evaluate(&doc)
            .matches);
        assert!(compile(Query::is_greater_than_or_equal(30, "age").root())
            .evaluate(&doc)
            .matches);
        assert!(!compile(Query::is_less_than(30, "age").root())
            .evaluate(&doc)
            .matches);
    }

    #[test]
    fn test_missing_field_never_matches() {
        let doc = john();
        assert!(!compile(Query::is_equal("x", "city").root())
            .evaluate(&doc)
            .matches);
        // NOT of a missing field matches.
        assert!(compile(Query::is_equal("x", "city").not().root())
            .evaluate(&doc)
            .matches);
    }

    #[test]
    fn test_similarity_matcher_scores_cosine() {
        let doc = john();
        let score = compile(Query::is_similar_to(vec![1.0, 0.0], "v").root()).evaluate(&doc);
        assert!(score.matches);
        assert!((score.score - 1.0).abs() < 1e-6);

        // Orthogonal query: zero similarity does not match.
        let score = compile(Query::is_similar_to(vec![0.0, 1.0], "v").root()).evaluate(&doc);
        assert!(!score.matches);
    }

    #[test]
    fn test_similarity_dimension_mismatch_no_match() {
        let doc = john();
        let score = compile(Query::is_similar_to(vec![1.0, 0.0, 0.0], "v").root()).evaluate(&doc);
        assert!(!score.matches);
    }

    #[test]
    fn test_matrix_field_scores_row_mean() {
        let doc = Document::builder()
            .add_matrix(
                "m",
                Matrix::new(2, 2, vec![1.0, 0.0, 1.0, 0.0]).unwrap(),
            )
            .build();
        let score = compile(Query::is_similar_to(vec![1.0, 0.0], "m").root()).evaluate(&doc);
        assert!(score.matches);
        assert!((score.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_all_similar_to_short_circuits_on_zero_partial() {
        let doc = Document::builder()
            .add_vector("a", vec![1.0, 0.0])
            .add_vector("b", vec![0.0, 1.0])
            .build();
        let query = Query::all_similar_to(
            vec![1.0, 0.0],
            vec!["a".to_string(), "b".to_string()],
        );
        // Field "b" is orthogonal to the query: the whole leaf fails.
        assert!(!compile(query.root()).evaluate(&doc).matches);

        let query = Query::all_similar_to(vec![1.0, 1.0], vec!["a".to_string(), "b".to_string()]);
        let score = compile(query.root()).evaluate(&doc);
        assert!(score.matches);
        let expected = 1.0 / 2.0f32.sqrt();
        assert!((score.score - expected).abs() < 1e-5);
    }
}
