//! Online recipe retrieval.
//!
//! A `SearchContext` is one immutable generation of (index, metadata) loaded
//! from disk. `QueryService` keeps the current generation behind an
//! `RwLock<Arc<_>>`: queries clone the `Arc` and release the lock before
//! embedding or searching, and a reload publishes a fully loaded generation
//! with a single swap.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::config::ArtifactPaths;
use crate::recipes::RecipeDoc;
use crate::semantic::accelerated::AcceleratedIndex;
use crate::semantic::embeddings::{EmbeddingError, Embedder};
use crate::semantic::index::{FlatIndex, IndexError, IndexKind, SimilarityIndex};
use crate::semantic::preprocess::{l2_normalize, query_text};
use crate::semantic::storage::{
    ArtifactHeader, LoadedMetadata, MetadataStorage, VectorStorage, VectorStorageError,
};

/// Errors that can occur while loading artifacts or answering queries.
#[derive(Debug, thiserror::Error)]
pub enum RecipeSearchError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Dimension mismatch: artifact has {got} dimensions, embedder produces {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Artifact mismatch: index has {rows} rows but metadata has {records} records")]
    ArtifactMismatch { rows: usize, records: usize },

    #[error("Generation mismatch: index was built for metadata {index:08x}, found {metadata:08x}")]
    GenerationMismatch { index: u32, metadata: u32 },

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A recipe with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeHit {
    #[serde(flatten)]
    pub recipe: RecipeDoc,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    /// Ingredients exactly as given by the caller
    pub query: Vec<String>,
    /// Highest score first
    pub results: Vec<RecipeHit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub documents: usize,
    pub kind: IndexKind,
}

/// One loaded generation: an index and the documents its rows point at.
pub struct SearchContext {
    index: Box<dyn SimilarityIndex>,
    metadata: Vec<RecipeDoc>,
}

impl SearchContext {
    /// Pair an index with its metadata; row `i` must describe `metadata[i]`.
    pub fn new(
        index: Box<dyn SimilarityIndex>,
        metadata: Vec<RecipeDoc>,
    ) -> Result<Self, RecipeSearchError> {
        if index.len() != metadata.len() {
            return Err(RecipeSearchError::ArtifactMismatch {
                rows: index.len(),
                records: metadata.len(),
            });
        }
        Ok(Self { index, metadata })
    }

    /// Load metadata and whichever index artifact belongs to it.
    ///
    /// The accelerated artifact is tried first; if it cannot be opened or was
    /// written by another build, the flat matrix is used instead.
    pub fn load(paths: &ArtifactPaths, embedder: &dyn Embedder) -> Result<Self, RecipeSearchError> {
        let metadata_storage = MetadataStorage::new(paths.metadata.clone());
        if !metadata_storage.exists() {
            return Err(RecipeSearchError::IndexUnavailable(format!(
                "metadata not found at {}",
                metadata_storage.path().display()
            )));
        }
        let metadata = metadata_storage.load().map_err(|e| {
            RecipeSearchError::IndexUnavailable(format!(
                "failed to read metadata {}: {e}",
                metadata_storage.path().display()
            ))
        })?;

        let index = load_index(paths, embedder, &metadata)?;
        log::info!(
            "loaded {} index with {} recipes ({} dimensions)",
            index.kind(),
            index.len(),
            index.dimensions()
        );

        Self::new(index, metadata.docs)
    }

    pub fn kind(&self) -> IndexKind {
        self.index.kind()
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    /// Search with a normalized query vector and attach documents to hits.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<RecipeHit>, RecipeSearchError> {
        if self.index.is_empty() {
            return Ok(vec![]);
        }

        let hits = self.index.search(query, top_k.min(self.len()))?;

        hits.into_iter()
            .map(|hit| {
                let recipe = self.metadata.get(hit.row).cloned().ok_or_else(|| {
                    RecipeSearchError::Internal(format!("index returned unknown row {}", hit.row))
                })?;
                Ok(RecipeHit {
                    recipe,
                    score: hit.score,
                })
            })
            .collect()
    }
}

fn load_index(
    paths: &ArtifactPaths,
    embedder: &dyn Embedder,
    metadata: &LoadedMetadata,
) -> Result<Box<dyn SimilarityIndex>, RecipeSearchError> {
    let mut skipped = None;

    let accelerated = VectorStorage::new(paths.index.clone());
    if accelerated.exists() {
        match load_accelerated(&accelerated, embedder, metadata) {
            Ok(index) => return Ok(index),
            Err(err @ RecipeSearchError::DimensionMismatch { .. }) => return Err(err),
            Err(err) => {
                log::warn!(
                    "failed to load accelerated index {}, trying flat matrix: {err}",
                    accelerated.path().display()
                );
                skipped = Some(err);
            }
        }
    }

    let flat = VectorStorage::new(paths.embeddings.clone());
    if flat.exists() {
        return load_flat(&flat, embedder, metadata).map_err(|err| match err {
            RecipeSearchError::DimensionMismatch { .. }
            | RecipeSearchError::ArtifactMismatch { .. }
            | RecipeSearchError::GenerationMismatch { .. } => err,
            other => RecipeSearchError::IndexUnavailable(format!(
                "failed to load {}: {other}",
                flat.path().display()
            )),
        });
    }

    Err(match skipped {
        Some(
            err @ (RecipeSearchError::ArtifactMismatch { .. }
            | RecipeSearchError::GenerationMismatch { .. }),
        ) => err,
        _ => RecipeSearchError::IndexUnavailable(format!(
            "no usable index at {} or {}",
            accelerated.path().display(),
            flat.path().display()
        )),
    })
}

/// Check that an artifact fits the embedder and was written with `metadata`.
fn check_header(
    header: &ArtifactHeader,
    expected_kind: IndexKind,
    embedder: &dyn Embedder,
    metadata: &LoadedMetadata,
) -> Result<(), RecipeSearchError> {
    if header.kind != expected_kind {
        return Err(VectorStorageError::InvalidFormat(format!(
            "expected a {expected_kind} artifact, found {}",
            header.kind
        ))
        .into());
    }

    if header.dimensions != embedder.dimensions() {
        return Err(RecipeSearchError::DimensionMismatch {
            expected: embedder.dimensions(),
            got: header.dimensions,
        });
    }

    if header.entry_count != metadata.docs.len() {
        return Err(RecipeSearchError::ArtifactMismatch {
            rows: header.entry_count,
            records: metadata.docs.len(),
        });
    }

    if header.metadata_checksum != metadata.checksum {
        return Err(RecipeSearchError::GenerationMismatch {
            index: header.metadata_checksum,
            metadata: metadata.checksum,
        });
    }

    if header.model_id != embedder.model_id_hash() {
        log::warn!(
            "index was built with a different model than '{}'; dimensions match, continuing",
            embedder.name()
        );
    }

    Ok(())
}

fn load_accelerated(
    storage: &VectorStorage,
    embedder: &dyn Embedder,
    metadata: &LoadedMetadata,
) -> Result<Box<dyn SimilarityIndex>, RecipeSearchError> {
    let artifact = storage.load()?;
    check_header(&artifact.header, IndexKind::Accelerated, embedder, metadata)?;

    let index = AcceleratedIndex::from_bytes(artifact.header.dimensions, &artifact.payload)?;
    Ok(Box::new(index))
}

fn load_flat(
    storage: &VectorStorage,
    embedder: &dyn Embedder,
    metadata: &LoadedMetadata,
) -> Result<Box<dyn SimilarityIndex>, RecipeSearchError> {
    let artifact = storage.load()?;
    check_header(&artifact.header, IndexKind::Flat, embedder, metadata)?;

    let index = FlatIndex::from_matrix(artifact.header.dimensions, artifact.matrix()?)?;
    Ok(Box::new(index))
}

/// Answers ingredient queries against the current generation.
pub struct QueryService {
    embedder: Arc<dyn Embedder>,
    paths: ArtifactPaths,
    current: RwLock<Arc<SearchContext>>,
}

impl QueryService {
    /// Load artifacts from `paths`. Fails if no generation can be loaded.
    pub fn load(embedder: Arc<dyn Embedder>, paths: ArtifactPaths) -> Result<Self, RecipeSearchError> {
        let context = SearchContext::load(&paths, embedder.as_ref())?;
        Ok(Self::from_context(embedder, paths, context))
    }

    pub fn from_context(
        embedder: Arc<dyn Embedder>,
        paths: ArtifactPaths,
        context: SearchContext,
    ) -> Self {
        Self {
            embedder,
            paths,
            current: RwLock::new(Arc::new(context)),
        }
    }

    /// The generation new queries will run against.
    pub fn snapshot(&self) -> Result<Arc<SearchContext>, RecipeSearchError> {
        self.current
            .read()
            .map(|guard| Arc::clone(&*guard))
            .map_err(|e| RecipeSearchError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Rank recipes by similarity to the given ingredients.
    ///
    /// Rejects an empty (after normalization) ingredient list or `top_k == 0`
    /// before touching the embedder or the index.
    pub fn query(
        &self,
        ingredients: &[String],
        top_k: usize,
    ) -> Result<QueryResponse, RecipeSearchError> {
        if top_k == 0 {
            return Err(RecipeSearchError::InvalidQuery(
                "top_k must be greater than 0".to_string(),
            ));
        }

        let text = query_text(ingredients).ok_or_else(|| {
            RecipeSearchError::InvalidQuery("no ingredients given".to_string())
        })?;

        let mut vector = self.embedder.embed(&text)?;
        l2_normalize(&mut vector);

        let context = self.snapshot()?;
        let results = context.search(&vector, top_k)?;

        log::debug!("query '{}' matched {} recipes", text, results.len());

        Ok(QueryResponse {
            query: ingredients.to_vec(),
            results,
        })
    }

    /// Load a new generation from disk and publish it.
    ///
    /// On failure, including an index and metadata pair from two different
    /// builds, the current generation keeps serving.
    pub fn reload(&self) -> Result<ReloadReport, RecipeSearchError> {
        let context = SearchContext::load(&self.paths, self.embedder.as_ref())?;
        let report = ReloadReport {
            documents: context.len(),
            kind: context.kind(),
        };

        let mut guard = self
            .current
            .write()
            .map_err(|e| RecipeSearchError::Internal(format!("Lock poisoned: {}", e)))?;
        *guard = Arc::new(context);

        log::info!(
            "reloaded {} index with {} recipes",
            report.kind,
            report.documents
        );

        Ok(report)
    }
}
