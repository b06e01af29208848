use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{ArtifactPaths, IndexBackend};
use crate::recipes::RecipeDoc;
use crate::semantic::{BuildReport, Embedder, EmbeddingError, IndexBuilder};

/// Deterministic bag-of-words embedder.
///
/// Each whitespace token maps to a pseudo-random vector seeded by its CRC32;
/// a text embeds to the sum of its token vectors. Equal texts give equal
/// vectors and distinct token sets are close to orthogonal.
pub struct HashingEmbedder {
    dimensions: usize,
    calls: AtomicUsize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `embed_batch` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn token_vector(&self, token: &str) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(crc32fast::hash(token.as_bytes()) as u64);
        (0..self.dimensions)
            .map(|_| rng.random_range(-1.0f32..1.0))
            .collect()
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimensions];
        for token in text.split_whitespace() {
            for (acc, v) in vector.iter_mut().zip(self.token_vector(token)) {
                *acc += v;
            }
        }
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing-test-embedder"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

pub const DIMS: usize = 64;

pub fn embedder() -> Arc<HashingEmbedder> {
    Arc::new(HashingEmbedder::new(DIMS))
}

pub fn recipe(id: &str, name: &str, ingredients: &[&str], text: &str) -> RecipeDoc {
    RecipeDoc {
        id: id.to_string(),
        name: name.to_string(),
        ingredients: ingredients.iter().map(|i| i.to_string()).collect(),
        text: text.to_string(),
    }
}

pub fn sample_corpus() -> Vec<RecipeDoc> {
    vec![
        recipe("omelette", "Omelette", &["egg", "milk", "butter"], "Whisk and fry."),
        recipe("rice-beans", "Rice and beans", &["rice", "beans", "onion"], "Simmer."),
        recipe("pancakes", "Pancakes", &["flour", "egg", "milk", "sugar"], "Mix and fry."),
        recipe("salad", "Tomato salad", &["tomato", "onion", "olive oil"], "Chop and toss."),
        recipe("pasta", "Garlic pasta", &["pasta", "garlic", "olive oil"], "Boil and toss."),
        recipe("porridge", "Porridge", &["oats", "milk", "honey"], "Cook slowly."),
    ]
}

pub fn build(
    dir: &Path,
    embedder: Arc<HashingEmbedder>,
    docs: &[RecipeDoc],
    backend: IndexBackend,
) -> BuildReport {
    IndexBuilder::new(embedder, ArtifactPaths::in_dir(dir))
        .with_batch_size(2)
        .with_backend(backend)
        .build(docs)
        .unwrap()
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
