//! Doc-id sets and physical bitmap operators.
//!
//! [`DocIdSet`] wraps a 64-bit roaring bitmap. The physical operators
//! evaluate the index half of a planned query: leaves pull posting lists
//! and ANN candidates, inner nodes combine sets cost-ordered with
//! short-circuiting. Vector leaves deposit per-id similarities into the
//! shared score map consumed by the executor.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Instant;

use roaring::RoaringTreemap;

use crate::error::{Result, VulcanoError};
use crate::index::hnsw::HnswIndex;
use crate::index::inverted::{InvertedIndex, StringMatch};
use crate::query::QueryNode;

/// Mutable 64-bit id set with set algebra and cardinality estimation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocIdSet(RoaringTreemap);

impl DocIdSet {
    pub fn new() -> Self {
        DocIdSet(RoaringTreemap::new())
    }

    pub fn insert(&mut self, id: u64) {
        self.0.insert(id);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> u64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn and(&mut self, other: &DocIdSet) {
        self.0 &= &other.0;
    }

    pub fn or(&mut self, other: &DocIdSet) {
        self.0 |= &other.0;
    }

    pub fn and_not(&mut self, other: &DocIdSet) {
        self.0 -= &other.0;
    }

    /// `universe - self`.
    pub fn negate(&self, universe: &DocIdSet) -> DocIdSet {
        let mut result = universe.clone();
        result.and_not(self);
        result
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter()
    }
}

impl FromIterator<u64> for DocIdSet {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        DocIdSet(RoaringTreemap::from_iter(iter))
    }
}

/// Evaluation context shared by the physical operators of one query.
pub struct IndexContext<'a> {
    pub inverted: &'a HashMap<String, InvertedIndex>,
    pub hnsw: &'a HashMap<String, HnswIndex>,
    pub universe: &'a DocIdSet,
    /// Candidate count requested from ANN leaves.
    pub ann_k: usize,
    pub deadline: Option<Instant>,
    /// Per-id similarity scores from vector leaves. When two leaves score
    /// the same id, the mean wins (the multi-field averaging rule).
    pub scores: RefCell<HashMap<u64, f32>>,
}

impl IndexContext<'_> {
    fn check_deadline(&self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(VulcanoError::Timeout);
            }
        }
        Ok(())
    }

    fn record_score(&self, id: u64, score: f32) {
        let mut scores = self.scores.borrow_mut();
        scores
            .entry(id)
            .and_modify(|existing| *existing = (*existing + score) / 2.0)
            .or_insert(score);
    }
}

/// A physical operator over doc-id sets.
pub trait BitmapNode {
    fn compute(&self, ctx: &IndexContext<'_>) -> Result<DocIdSet>;
    /// Relative evaluation cost, used to order AND children.
    fn estimate_cost(&self) -> f64;
}

struct UniverseNode;

impl BitmapNode for UniverseNode {
    fn compute(&self, ctx: &IndexContext<'_>) -> Result<DocIdSet> {
        Ok(ctx.universe.clone())
    }

    fn estimate_cost(&self) -> f64 {
        2.0
    }
}

struct EmptyNode;

impl BitmapNode for EmptyNode {
    fn compute(&self, _ctx: &IndexContext<'_>) -> Result<DocIdSet> {
        Ok(DocIdSet::new())
    }

    fn estimate_cost(&self) -> f64 {
        0.0
    }
}

struct StringLeafNode {
    field: String,
    op: StringMatch,
    value: String,
}

impl BitmapNode for StringLeafNode {
    fn compute(&self, ctx: &IndexContext<'_>) -> Result<DocIdSet> {
        let index = ctx.inverted.get(&self.field).ok_or_else(|| {
            VulcanoError::index(format!("no inverted index for field '{}'", self.field))
        })?;
        index.search(self.op, &self.value)
    }

    fn estimate_cost(&self) -> f64 {
        match self.op {
            StringMatch::Equals => 1.0,
            // Term enumeration scans every posting key.
            _ => 16.0,
        }
    }
}

struct VectorLeafNode {
    fields: Vec<String>,
    vector: Vec<f32>,
}

impl BitmapNode for VectorLeafNode {
    fn compute(&self, ctx: &IndexContext<'_>) -> Result<DocIdSet> {
        let mut result: Option<DocIdSet> = None;
        let mut partials: HashMap<u64, Vec<f32>> = HashMap::new();

        for field in &self.fields {
            ctx.check_deadline()?;
            let index = ctx.hnsw.get(field).ok_or_else(|| {
                VulcanoError::index(format!("no vector index for field '{field}'"))
            })?;
            let hits = index.search(&self.vector, ctx.ann_k)?;
            let mut set = DocIdSet::new();
            for (id, sim) in hits {
                let score = sim.clamp(0.0, 1.0);
                if score > 0.0 {
                    set.insert(id);
                    partials.entry(id).or_default().push(score);
                }
            }
            match result {
                Some(ref mut acc) => acc.and(&set),
                None => result = Some(set),
            }
        }

        let result = result.unwrap_or_default();
        for id in result.iter() {
            if let Some(scores) = partials.get(&id) {
                let mean = scores.iter().sum::<f32>() / scores.len() as f32;
                ctx.record_score(id, mean);
            }
        }
        Ok(result)
    }

    fn estimate_cost(&self) -> f64 {
        4.0 * self.fields.len() as f64
    }
}

struct AndNode {
    children: Vec<Box<dyn BitmapNode>>,
}

impl BitmapNode for AndNode {
    fn compute(&self, ctx: &IndexContext<'_>) -> Result<DocIdSet> {
        let mut order: Vec<&Box<dyn BitmapNode>> = self.children.iter().collect();
        order.sort_by(|a, b| a.estimate_cost().total_cmp(&b.estimate_cost()));

        let mut result: Option<DocIdSet> = None;
        for child in order {
            ctx.check_deadline()?;
            let set = child.compute(ctx)?;
            match result {
                Some(ref mut acc) => acc.and(&set),
                None => result = Some(set),
            }
            if result.as_ref().is_some_and(|set| set.is_empty()) {
                return Ok(DocIdSet::new());
            }
        }
        Ok(result.unwrap_or_default())
    }

    fn estimate_cost(&self) -> f64 {
        self.children.iter().map(|c| c.estimate_cost()).sum()
    }
}

struct OrNode {
    children: Vec<Box<dyn BitmapNode>>,
}

impl BitmapNode for OrNode {
    fn compute(&self, ctx: &IndexContext<'_>) -> Result<DocIdSet> {
        let mut result = DocIdSet::new();
        for child in &self.children {
            ctx.check_deadline()?;
            result.or(&child.compute(ctx)?);
        }
        Ok(result)
    }

    fn estimate_cost(&self) -> f64 {
        self.children.iter().map(|c| c.estimate_cost()).sum()
    }
}

struct NotNode {
    child: Box<dyn BitmapNode>,
}

impl BitmapNode for NotNode {
    fn compute(&self, ctx: &IndexContext<'_>) -> Result<DocIdSet> {
        ctx.check_deadline()?;
        Ok(self.child.compute(ctx)?.negate(ctx.universe))
    }

    fn estimate_cost(&self) -> f64 {
        self.child.estimate_cost() + 2.0
    }
}

/// Compile an index tree into its physical operator.
///
/// Only node kinds the planner routes to the index side can appear here;
/// anything else is an internal error.
pub fn physical_plan(node: &QueryNode) -> Result<Box<dyn BitmapNode>> {
    match node {
        QueryNode::MatchAll => Ok(Box::new(UniverseNode)),
        QueryNode::MatchNone => Ok(Box::new(EmptyNode)),
        QueryNode::StringLeaf { field, op, value } => Ok(Box::new(StringLeafNode {
            field: field.clone(),
            op: *op,
            value: value.clone(),
        })),
        QueryNode::SimilarTo { field, vector } => Ok(Box::new(VectorLeafNode {
            fields: vec![field.clone()],
            vector: vector.clone(),
        })),
        QueryNode::SimilarToAll { fields, vector } => Ok(Box::new(VectorLeafNode {
            fields: fields.clone(),
            vector: vector.clone(),
        })),
        QueryNode::And(left, right) => Ok(Box::new(AndNode {
            children: vec![physical_plan(left)?, physical_plan(right)?],
        })),
        QueryNode::Or(left, right) => Ok(Box::new(OrNode {
            children: vec![physical_plan(left)?, physical_plan(right)?],
        })),
        QueryNode::Not(child) => Ok(Box::new(NotNode {
            child: physical_plan(child)?,
        })),
        QueryNode::IntLeaf { field, .. } => Err(VulcanoError::internal(format!(
            "integer predicate on '{field}' routed to the index tree"
        ))),
    }
}
