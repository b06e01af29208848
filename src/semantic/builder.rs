//! Offline index build: corpus -> embeddings -> persisted index + metadata.
//!
//! The accelerated artifact is preferred. Any failure on that path degrades to
//! the flat matrix artifact, so a build only fails for corpus, embedding or
//! final persistence errors.
//!
//! Every index artifact records the checksum of the metadata written by the
//! same build. Readers reject an index and metadata pair whose checksums
//! disagree, so a reload racing a build never mixes two generations.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::config::{ArtifactPaths, IndexBackend};
use crate::recipes::{CorpusError, RecipeDoc};
use crate::semantic::accelerated::AcceleratedIndex;
use crate::semantic::embeddings::{EmbeddingError, Embedder};
use crate::semantic::index::{IndexError, IndexKind, SimilarityIndex};
use crate::semantic::preprocess::{document_text, l2_normalize};
use crate::semantic::storage::{EncodedMetadata, MetadataStorage, VectorStorage, VectorStorageError};

/// Errors that abort an index build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Corpus error: {0}")]
    Corpus(#[from] CorpusError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),
}

/// Summary of a finished build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub documents: usize,
    pub dimensions: usize,
    pub kind: IndexKind,
}

pub struct IndexBuilder {
    embedder: Arc<dyn Embedder>,
    paths: ArtifactPaths,
    batch_size: usize,
    backend: IndexBackend,
    show_progress: bool,
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn Embedder>, paths: ArtifactPaths) -> Self {
        Self {
            embedder,
            paths,
            batch_size: 256,
            backend: IndexBackend::Auto,
            show_progress: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_backend(mut self, backend: IndexBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Draw a progress bar on stderr while embedding.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Embed `docs` and replace the persisted artifacts.
    ///
    /// Nothing is written unless the corpus is non-empty and every document
    /// was embedded.
    pub fn build(&self, docs: &[RecipeDoc]) -> Result<BuildReport, BuildError> {
        if docs.is_empty() {
            return Err(CorpusError::Empty.into());
        }

        let texts: Vec<String> = docs.iter().map(document_text).collect();
        let vectors = self.embed_all(&texts)?;
        let dimensions = self.embedder.dimensions();
        let model_id = self.embedder.model_id_hash();
        let metadata = EncodedMetadata::encode(docs)?;
        let stamp = Stamp {
            model_id,
            metadata_checksum: metadata.checksum(),
            dimensions,
        };

        if let Some(dir) = self.paths.metadata.parent() {
            std::fs::create_dir_all(dir).map_err(VectorStorageError::from)?;
        }

        let kind = match self.backend {
            IndexBackend::Flat => {
                log::info!("flat index backend configured, skipping accelerated index");
                self.persist_flat(&stamp, &vectors)?
            }
            IndexBackend::Auto => {
                match self.persist_accelerated(&stamp, &vectors) {
                    Ok(kind) => kind,
                    Err(err) => {
                        log::warn!(
                            "accelerated index unavailable, running in degraded mode with a flat matrix: {err}"
                        );
                        self.persist_flat(&stamp, &vectors)?
                    }
                }
            }
        };

        MetadataStorage::new(self.paths.metadata.clone()).save(&metadata)?;

        log::info!(
            "built {kind} index over {} recipes ({dimensions} dimensions)",
            docs.len()
        );

        Ok(BuildReport {
            documents: docs.len(),
            dimensions,
            kind,
        })
    }

    /// Embed in chunks of `batch_size`, preserving input order, and normalize.
    fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BuildError> {
        let dimensions = self.embedder.dimensions();
        let progress = self.progress_bar(texts.len() as u64);
        let mut vectors = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.batch_size) {
            let embedded = self.embedder.embed_batch(chunk)?;
            if embedded.len() != chunk.len() {
                progress.abandon();
                return Err(EmbeddingError::EmbeddingFailed(format!(
                    "expected {} embeddings, got {}",
                    chunk.len(),
                    embedded.len()
                ))
                .into());
            }

            for mut vector in embedded {
                if vector.len() != dimensions {
                    progress.abandon();
                    return Err(IndexError::DimensionMismatch {
                        expected: dimensions,
                        got: vector.len(),
                    }
                    .into());
                }
                l2_normalize(&mut vector);
                vectors.push(vector);
            }

            progress.inc(chunk.len() as u64);
        }

        progress.finish_and_clear();
        Ok(vectors)
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} recipes embedded")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }

    fn persist_accelerated(
        &self,
        stamp: &Stamp,
        vectors: &[Vec<f32>],
    ) -> Result<IndexKind, BuildError> {
        let index = AcceleratedIndex::build(stamp.dimensions, vectors)?;
        let blob = index.to_bytes()?;

        VectorStorage::new(self.paths.index.clone()).save_accelerated(
            &stamp.model_id,
            stamp.metadata_checksum,
            stamp.dimensions,
            vectors.len(),
            &blob,
        )?;
        remove_stale(VectorStorage::new(self.paths.embeddings.clone()));

        Ok(IndexKind::Accelerated)
    }

    fn persist_flat(&self, stamp: &Stamp, vectors: &[Vec<f32>]) -> Result<IndexKind, BuildError> {
        let matrix: Vec<f32> = vectors.iter().flatten().copied().collect();

        VectorStorage::new(self.paths.embeddings.clone()).save_matrix(
            &stamp.model_id,
            stamp.metadata_checksum,
            stamp.dimensions,
            &matrix,
        )?;
        remove_stale(VectorStorage::new(self.paths.index.clone()));

        Ok(IndexKind::Flat)
    }
}

/// Identity written into every index artifact of one build.
struct Stamp {
    model_id: [u8; 32],
    metadata_checksum: u32,
    dimensions: usize,
}

/// Remove the artifact variant this build did not write.
///
/// A leftover file carries an older metadata checksum and is skipped at load.
fn remove_stale(storage: VectorStorage) {
    if let Err(err) = storage.delete() {
        log::warn!(
            "could not remove stale artifact {}: {err}",
            storage.path().display()
        );
    }
}
