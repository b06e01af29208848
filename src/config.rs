use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

/// Default embedding model (compact and fast, 384 dimensions)
const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
/// Default number of texts per embedding batch
const DEFAULT_BATCH_SIZE: usize = 256;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
/// Default number of recipes returned per query
const DEFAULT_TOP_K: usize = 3;

/// Configuration for the embedding model
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_model")]
    pub model: String,

    /// Texts per embedding batch during index builds
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Where downloaded models are cached (defaults to the data dir)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            cache_dir: None,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

/// Which index variant the builder should produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    /// Accelerated index when available, flat matrix otherwise
    #[default]
    Auto,
    /// Always persist the flat matrix
    Flat,
}

/// Locations of the corpus and index artifacts, relative to the data dir
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub backend: IndexBackend,

    #[serde(default = "default_corpus")]
    pub corpus: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,

    #[serde(default = "default_embeddings_file")]
    pub embeddings_file: String,

    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Auto,
            corpus: default_corpus(),
            index_file: default_index_file(),
            embeddings_file: default_embeddings_file(),
            metadata_file: default_metadata_file(),
        }
    }
}

/// HTTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Allowed CORS origins, "*" allows any
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Results per query when the request does not say
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Fixed seed for quantity descriptions; random per request if unset
    #[serde(default)]
    pub quantity_seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cors_origins: default_cors_origins(),
            default_top_k: DEFAULT_TOP_K,
            quantity_seed: None,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_corpus() -> String {
    "recipes_clean.jsonl".to_string()
}

fn default_index_file() -> String {
    "recipes.index".to_string()
}

fn default_embeddings_file() -> String {
    "embeddings.bin".to_string()
}

fn default_metadata_file() -> String {
    "recipes_meta.json".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved paths of the persisted index artifacts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub index: PathBuf,
    pub embeddings: PathBuf,
    pub metadata: PathBuf,
}

#[cfg(test)]
impl ArtifactPaths {
    /// Default artifact names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        IndexConfig::default().artifacts(dir)
    }
}

impl IndexConfig {
    pub fn artifacts(&self, data_dir: &Path) -> ArtifactPaths {
        ArtifactPaths {
            index: data_dir.join(&self.index_file),
            embeddings: data_dir.join(&self.embeddings_file),
            metadata: data_dir.join(&self.metadata_file),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            server: ServerConfig::default(),
            log_level: default_log_level(),
            base_path: PathBuf::new(),
        }
    }
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }

        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be greater than 0");
        }

        if self.embedding.download_timeout_secs == 0 {
            bail!("embedding.download_timeout_secs must be greater than 0");
        }

        if self.server.default_top_k == 0 {
            bail!("server.default_top_k must be greater than 0");
        }

        let files = [
            &self.index.index_file,
            &self.index.embeddings_file,
            &self.index.metadata_file,
        ];
        if files.iter().any(|f| f.trim().is_empty()) {
            bail!("index file names must not be empty");
        }
        if self.index.index_file == self.index.embeddings_file {
            bail!("index.index_file and index.embeddings_file must differ");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if absent.
    pub fn load_with(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base_path = base_path.as_ref();
        let store = storage::BackendLocal::new(base_path)
            .with_context(|| format!("failed to create data dir {}", base_path.display()))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(
                CONFIG_FILE,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn artifacts(&self) -> ArtifactPaths {
        self.index.artifacts(&self.base_path)
    }

    pub fn corpus_path(&self) -> PathBuf {
        self.base_path.join(&self.index.corpus)
    }

    pub fn model_cache_dir(&self) -> PathBuf {
        self.embedding
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.base_path.clone())
    }
}
