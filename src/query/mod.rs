//! Query model and execution.
//!
//! A [`Query`] is a boolean tree over typed field predicates and vector
//! similarity leaves. The planner splits it into an index tree (answered by
//! bitmaps over posting lists and ANN candidates) and a residual tree
//! (scored per document); the executor merges both into a ranked result.

pub mod bitmap;
pub mod executor;
pub mod matcher;
pub mod planner;

pub use crate::index::inverted::StringMatch;

/// Integer comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntMatch {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl IntMatch {
    pub fn matches(&self, value: i32, operand: i32) -> bool {
        match self {
            IntMatch::Eq => value == operand,
            IntMatch::Lt => value < operand,
            IntMatch::Le => value <= operand,
            IntMatch::Gt => value > operand,
            IntMatch::Ge => value >= operand,
        }
    }
}

/// Logical query tree.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    /// Matches every document.
    MatchAll,
    /// Matches nothing.
    MatchNone,
    /// String predicate on one field.
    StringLeaf {
        field: String,
        op: StringMatch,
        value: String,
    },
    /// Integer predicate on one field.
    IntLeaf {
        field: String,
        op: IntMatch,
        value: i32,
    },
    /// ANN similarity against one vector field.
    SimilarTo { field: String, vector: Vec<f32> },
    /// Similarity against several vector fields; a zero partial similarity
    /// fails the whole leaf, otherwise the score is the per-field mean.
    SimilarToAll {
        fields: Vec<String>,
        vector: Vec<f32>,
    },
    And(Box<QueryNode>, Box<QueryNode>),
    Or(Box<QueryNode>, Box<QueryNode>),
    Not(Box<QueryNode>),
}

/// A user query: a logical tree plus fluent combinators.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    root: QueryNode,
}

impl Query {
    pub fn root(&self) -> &QueryNode {
        &self.root
    }

    pub fn into_root(self) -> QueryNode {
        self.root
    }

    pub fn match_all() -> Query {
        Query {
            root: QueryNode::MatchAll,
        }
    }

    pub fn match_none() -> Query {
        Query {
            root: QueryNode::MatchNone,
        }
    }

    /// ANN similarity of `vector` against `field`.
    pub fn is_similar_to(vector: Vec<f32>, field: impl Into<String>) -> Query {
        Query {
            root: QueryNode::SimilarTo {
                field: field.into(),
                vector,
            },
        }
    }

    /// Similarity of `vector` against every field in `fields`.
    pub fn all_similar_to(vector: Vec<f32>, fields: Vec<String>) -> Query {
        Query {
            root: QueryNode::SimilarToAll { fields, vector },
        }
    }

    /// String equality on `field`.
    pub fn is_equal(value: impl Into<String>, field: impl Into<String>) -> Query {
        Query {
            root: QueryNode::StringLeaf {
                field: field.into(),
                op: StringMatch::Equals,
                value: value.into(),
            },
        }
    }

    /// Integer equality on `field`.
    pub fn is_equal_int(value: i32, field: impl Into<String>) -> Query {
        Query {
            root: QueryNode::IntLeaf {
                field: field.into(),
                op: IntMatch::Eq,
                value,
            },
        }
    }

    pub fn starts_with(prefix: impl Into<String>, field: impl Into<String>) -> Query {
        Query {
            root: QueryNode::StringLeaf {
                field: field.into(),
                op: StringMatch::StartsWith,
                value: prefix.into(),
            },
        }
    }

    pub fn ends_with(suffix: impl Into<String>, field: impl Into<String>) -> Query {
        Query {
            root: QueryNode::StringLeaf {
                field: field.into(),
                op: StringMatch::EndsWith,
                value: suffix.into(),
            },
        }
    }

    pub fn contains(needle: impl Into<String>, field: impl Into<String>) -> Query {
        Query {
            root: QueryNode::StringLeaf {
                field: field.into(),
                op: StringMatch::Contains,
                value: needle.into(),
            },
        }
    }

    pub fn is_greater_than(value: i32, field: impl Into<String>) -> Query {
        Query {
            root: QueryNode::IntLeaf {
                field: field.into(),
                op: IntMatch::Gt,
                value,
            },
        }
    }

    pub fn is_greater_than_or_equal(value: i32, field: impl Into<String>) -> Query {
        Query {
            root: QueryNode::IntLeaf {
                field: field.into(),
                op: IntMatch::Ge,
                value,
            },
        }
    }

    pub fn is_less_than(value: i32, field: impl Into<String>) -> Query {
        Query {
            root: QueryNode::IntLeaf {
                field: field.into(),
                op: IntMatch::Lt,
                value,
            },
        }
    }

    pub fn is_less_than_or_equal(value: i32, field: impl Into<String>) -> Query {
        Query {
            root: QueryNode::IntLeaf {
                field: field.into(),
                op: IntMatch::Le,
                value,
            },
        }
    }

    pub fn and(self, other: Query) -> Query {
        Query {
            root: QueryNode::And(Box::new(self.root), Box::new(other.root)),
        }
    }

    pub fn or(self, other: Query) -> Query {
        Query {
            root: QueryNode::Or(Box::new(self.root), Box::new(other.root)),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Query {
        Query {
            root: QueryNode::Not(Box::new(self.root)),
        }
    }
}
