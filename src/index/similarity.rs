//! Vector similarity functions.
//!
//! [`Similarity`] is pluggable per HNSW index; cosine is the default. Both
//! entry points exist so that graph traversal can score against a
//! memory-mapped row without materializing the stored vector.

use std::fmt::Debug;

use crate::document::Matrix;
use crate::index::vectors::VectorRow;

/// Similarity between two vectors. Higher is closer.
pub trait Similarity: Send + Sync + Debug {
    /// Score two materialized vectors.
    fn score(&self, a: &[f32], b: &[f32]) -> f32;

    /// Score a materialized vector against a memory-mapped row.
    fn score_row(&self, a: &[f32], row: &VectorRow<'_>) -> f32;
}

/// Cosine similarity, in `[-1, 1]` for non-zero vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl Similarity for Cosine {
    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for (x, y) in a.iter().zip(b.iter()) {
            dot += (*x as f64) * (*y as f64);
            norm_a += (*x as f64) * (*x as f64);
            norm_b += (*y as f64) * (*y as f64);
        }
        finish_cosine(dot, norm_a, norm_b)
    }

    fn score_row(&self, a: &[f32], row: &VectorRow<'_>) -> f32 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for (j, x) in a.iter().enumerate() {
            let y = row.element(j);
            dot += (*x as f64) * (y as f64);
            norm_a += (*x as f64) * (*x as f64);
            norm_b += (y as f64) * (y as f64);
        }
        finish_cosine(dot, norm_a, norm_b)
    }
}

fn finish_cosine(dot: f64, norm_a: f64, norm_b: f64) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

/// Matrix similarity: the mean of row-wise cosines against `query`.
pub fn matrix_similarity(sim: &dyn Similarity, query: &[f32], matrix: &Matrix) -> f32 {
    if matrix.cols() != query.len() || matrix.rows() == 0 {
        return 0.0;
    }
    let mut total = 0.0f32;
    for r in 0..matrix.rows() {
        total += sim.score(query, matrix.row(r));
    }
    total / matrix.rows() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn test_cosine_bounds() {
        let v = vec![0.3, -1.2, 4.5];
        let neg: Vec<f32> = v.iter().map(|x| -x).collect();
        let w = vec![1.0, 0.0, 2.0];
        let sim = Cosine;

        assert!((sim.score(&v, &v) - 1.0).abs() <= EPSILON);
        assert!((sim.score(&v, &neg) + 1.0).abs() <= EPSILON);
        assert!((sim.score(&v, &w) - sim.score(&w, &v)).abs() <= EPSILON);
        assert!(sim.score(&v, &w).abs() <= 1.0 + EPSILON);
    }

    #[test]
    fn test_orthogonal_vectors() {
        let sim = Cosine;
        assert!(sim.score(&[1.0, 0.0], &[0.0, 1.0]).abs() <= EPSILON);
    }

    #[test]
    fn test_zero_vector_scores_zero() {
        let sim = Cosine;
        assert_eq!(sim.score(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_matrix_similarity_is_row_mean() {
        let sim = Cosine;
        let m = Matrix::new(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let score = matrix_similarity(&sim, &[1.0, 0.0], &m);
        assert!((score - 0.5).abs() <= EPSILON);
    }

    #[test]
    fn test_matrix_similarity_dimension_mismatch() {
        let sim = Cosine;
        let m = Matrix::new(1, 3, vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(matrix_similarity(&sim, &[1.0, 0.0], &m), 0.0);
    }
}
