//! Exact nearest-neighbor search over L2-normalized recipe embeddings.
//!
//! Two implementations share one contract:
//! - `FlatIndex`: brute-force inner product against every row
//! - `AcceleratedIndex` (see `accelerated`): exact inner-product search on a
//!   usearch index
//!
//! Results are ranked by score descending; equal scores rank the smaller row
//! position first.

use std::cmp::Ordering;
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::semantic::preprocess::{dot, l2_normalize};

/// Search result from a similarity index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    /// Cosine similarity in [-1, 1]
    pub score: f32,
    /// Position of the row in the embedding matrix (and in the metadata)
    pub row: usize,
}

/// Which index variant backs a loaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Accelerated,
    Flat,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Accelerated => f.write_str("accelerated"),
            IndexKind::Flat => f.write_str("flat"),
        }
    }
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Accelerated index unavailable: {0}")]
    AcceleratedUnavailable(String),

    #[error("Index backend error: {0}")]
    Backend(String),
}

/// Exact top-k similarity search over normalized vectors.
pub trait SimilarityIndex: Send + Sync {
    /// Build an index over already-normalized vectors; row `i` is `vectors[i]`.
    fn build(dimensions: usize, vectors: &[Vec<f32>]) -> Result<Self, IndexError>
    where
        Self: Sized;

    fn kind(&self) -> IndexKind;

    fn dimensions(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the `min(k, len)` best rows for a normalized query.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError>;
}

/// Total order of the ranking: score descending, then row ascending.
pub fn rank_order(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score.total_cmp(&a.score).then_with(|| a.row.cmp(&b.row))
}

/// Sort hits by the ranking order and keep the first `k`.
pub fn rank_hits(hits: &mut Vec<SearchHit>, k: usize) {
    hits.sort_by(rank_order);
    hits.truncate(k);
}

pub(crate) fn check_dimensions(expected: usize, got: usize) -> Result<(), IndexError> {
    if expected != got {
        return Err(IndexError::DimensionMismatch { expected, got });
    }
    Ok(())
}

/// Brute-force index over a row-major matrix.
pub struct FlatIndex {
    /// N rows of `dimensions` floats, back to back
    matrix: Vec<f32>,
    dimensions: usize,
}

impl FlatIndex {
    /// Build from a row-major matrix, normalizing each row.
    ///
    /// Rows that are already unit length are left unchanged (up to rounding).
    pub fn from_matrix(dimensions: usize, mut matrix: Vec<f32>) -> Result<Self, IndexError> {
        if dimensions == 0 || matrix.len() % dimensions != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: dimensions,
                got: matrix.len(),
            });
        }

        matrix.par_chunks_mut(dimensions).for_each(l2_normalize);

        Ok(Self { matrix, dimensions })
    }

    #[cfg(test)]
    fn row(&self, row: usize) -> Option<&[f32]> {
        self.matrix.chunks_exact(self.dimensions).nth(row)
    }
}

impl SimilarityIndex for FlatIndex {
    fn build(dimensions: usize, vectors: &[Vec<f32>]) -> Result<Self, IndexError> {
        let mut matrix = Vec::with_capacity(dimensions * vectors.len());
        for vector in vectors {
            check_dimensions(dimensions, vector.len())?;
            matrix.extend_from_slice(vector);
        }
        Self::from_matrix(dimensions, matrix)
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn len(&self) -> usize {
        self.matrix.len() / self.dimensions
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        check_dimensions(self.dimensions, query.len())?;

        let mut hits: Vec<SearchHit> = self
            .matrix
            .par_chunks(self.dimensions)
            .enumerate()
            .map(|(row, vector)| SearchHit {
                score: dot(query, vector),
                row,
            })
            .collect();

        rank_hits(&mut hits, k);
        Ok(hits)
    }
}
