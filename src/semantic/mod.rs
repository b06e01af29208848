//! Semantic recipe retrieval over ingredient embeddings.
//!
//! Embeddings come from a local fastembed model; search is exact cosine
//! similarity over L2-normalized vectors.
//!
//! # Architecture
//!
//! - `embeddings`: The `Embedder` capability and its fastembed implementation
//! - `preprocess`: Ingredient normalization and vector math
//! - `index`: The `SimilarityIndex` contract and the flat brute-force index
//! - `accelerated`: usearch-backed exact index (`accelerated` feature)
//! - `storage`: Binary artifact and metadata persistence
//! - `builder`: Offline build from corpus to artifacts
//! - `service`: Query service with hot-swappable generations

mod accelerated;
mod builder;
pub mod embeddings;
mod index;
mod preprocess;
mod service;
mod storage;

pub use builder::IndexBuilder;
pub use embeddings::{Embedder, EmbeddingModel};
pub use preprocess::normalize_ingredients;
pub use service::{QueryResponse, QueryService, RecipeHit, RecipeSearchError, ReloadReport};

#[cfg(test)]
pub use builder::{BuildError, BuildReport};
#[cfg(test)]
pub use embeddings::EmbeddingError;
#[cfg(test)]
pub use index::IndexKind;
#[cfg(test)]
pub use storage::{EncodedMetadata, MetadataStorage};
