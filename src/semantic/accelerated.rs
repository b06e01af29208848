//! Accelerated inner-product index backed by USearch.
//!
//! Only exact search is used, so results match `FlatIndex` up to float
//! rounding. Keys are row positions. Compiled only with the `accelerated`
//! feature; without it every constructor reports `AcceleratedUnavailable` and
//! callers fall back to the flat matrix.

use crate::semantic::index::{IndexError, IndexKind, SearchHit, SimilarityIndex};

#[cfg(feature = "accelerated")]
pub use backend::AcceleratedIndex;

#[cfg(not(feature = "accelerated"))]
pub use unavailable::AcceleratedIndex;

#[cfg(feature = "accelerated")]
mod backend {
    use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

    use super::*;
    use crate::semantic::index::{check_dimensions, rank_hits, rank_order};

    pub struct AcceleratedIndex {
        index: Index,
        dimensions: usize,
    }

    fn options(dimensions: usize) -> IndexOptions {
        IndexOptions {
            dimensions,
            metric: MetricKind::IP,
            quantization: ScalarKind::F32,
            connectivity: 0,
            expansion_add: 0,
            expansion_search: 0,
            multi: false,
        }
    }

    fn backend_error(err: impl std::fmt::Display) -> IndexError {
        IndexError::Backend(err.to_string())
    }

    impl AcceleratedIndex {
        /// Serialize the index into an opaque blob.
        pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
            let mut buffer = vec![0u8; self.index.serialized_length()];
            self.index
                .save_to_buffer(&mut buffer)
                .map_err(backend_error)?;
            Ok(buffer)
        }

        /// Restore an index from a blob produced by `to_bytes`.
        pub fn from_bytes(dimensions: usize, bytes: &[u8]) -> Result<Self, IndexError> {
            let index = Index::new(&options(dimensions)).map_err(|e| {
                IndexError::AcceleratedUnavailable(e.to_string())
            })?;
            index.load_from_buffer(bytes).map_err(backend_error)?;
            check_dimensions(dimensions, index.dimensions())?;
            // Loading does not reserve search threads.
            index.reserve(index.size()).map_err(backend_error)?;

            Ok(Self { index, dimensions })
        }

        fn exact_hits(&self, query: &[f32], count: usize) -> Result<Vec<SearchHit>, IndexError> {
            let matches = self
                .index
                .exact_search(query, count)
                .map_err(backend_error)?;

            Ok(matches
                .keys
                .iter()
                .zip(matches.distances.iter())
                .map(|(&key, &distance)| SearchHit {
                    // For the IP metric, distance = 1 - <a, b>
                    score: 1.0 - distance,
                    row: key as usize,
                })
                .collect())
        }
    }

    impl SimilarityIndex for AcceleratedIndex {
        fn build(dimensions: usize, vectors: &[Vec<f32>]) -> Result<Self, IndexError> {
            let index = Index::new(&options(dimensions))
                .map_err(|e| IndexError::AcceleratedUnavailable(e.to_string()))?;
            index
                .reserve(vectors.len())
                .map_err(|e| IndexError::AcceleratedUnavailable(e.to_string()))?;

            for (row, vector) in vectors.iter().enumerate() {
                check_dimensions(dimensions, vector.len())?;
                index.add(row as u64, vector.as_slice()).map_err(backend_error)?;
            }

            Ok(Self { index, dimensions })
        }

        fn kind(&self) -> IndexKind {
            IndexKind::Accelerated
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn len(&self) -> usize {
            self.index.size()
        }

        fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
            check_dimensions(self.dimensions, query.len())?;

            let total = self.len();
            let k = k.min(total);
            if k == 0 {
                return Ok(vec![]);
            }

            // The backend orders equal scores arbitrarily, so rows tied with the
            // k-th score may have been cut. Widen the window until the last
            // fetched score is strictly below the k-th one (or everything is in).
            let mut count = k;
            loop {
                let mut hits = self.exact_hits(query, count)?;
                hits.sort_by(rank_order);

                let boundary_is_strict =
                    hits.len() > k && hits[hits.len() - 1].score < hits[k - 1].score;
                if count >= total || boundary_is_strict {
                    rank_hits(&mut hits, k);
                    return Ok(hits);
                }

                count = (count * 2).max(k + 1).min(total);
            }
        }
    }
}

#[cfg(not(feature = "accelerated"))]
mod unavailable {
    use super::*;

    const REASON: &str = "built without the `accelerated` feature";

    pub struct AcceleratedIndex {
        _private: (),
    }

    impl AcceleratedIndex {
        pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
            Err(IndexError::AcceleratedUnavailable(REASON.to_string()))
        }

        pub fn from_bytes(_dimensions: usize, _bytes: &[u8]) -> Result<Self, IndexError> {
            Err(IndexError::AcceleratedUnavailable(REASON.to_string()))
        }
    }

    impl SimilarityIndex for AcceleratedIndex {
        fn build(_dimensions: usize, _vectors: &[Vec<f32>]) -> Result<Self, IndexError> {
            Err(IndexError::AcceleratedUnavailable(REASON.to_string()))
        }

        fn kind(&self) -> IndexKind {
            IndexKind::Accelerated
        }

        fn dimensions(&self) -> usize {
            0
        }

        fn len(&self) -> usize {
            0
        }

        fn search(&self, _query: &[f32], _k: usize) -> Result<Vec<SearchHit>, IndexError> {
            Err(IndexError::AcceleratedUnavailable(REASON.to_string()))
        }
    }
}
