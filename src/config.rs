//! TOML configuration parsing and validation.
//!
//! Only `[paths]` is required; every other section falls back to defaults
//! suitable for a local, offline run (hashing embeddings, enrichment
//! disabled, SQLite stores under the work directory).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::{Backoff, RetryPolicy};

/// Hard ceiling on any result-size parameter, regardless of caller input.
pub const MAX_RESULT_LIMIT: usize = 500;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub paths: PathsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Raw conversation export (JSON array or JSONL).
    pub input: PathBuf,
    /// Root for artifacts and manifests.
    pub work_dir: PathBuf,
}

impl PathsConfig {
    pub fn artifacts_dir(&self) -> PathBuf {
        self.work_dir.join("artifacts")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.work_dir.join("manifests")
    }

    pub fn manifest_for(&self, stage: &str) -> PathBuf {
        self.manifests_dir().join(format!("{}.log", stage))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_enrich_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_enrich_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub min_delay_ms: u64,
    #[serde(default = "default_true")]
    pub validate: bool,
    #[serde(default = "default_context_sample_size")]
    pub context_sample_size: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_retries: default_enrich_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff: Backoff::default(),
            timeout_secs: default_enrich_timeout(),
            workers: default_workers(),
            min_delay_ms: 0,
            validate: true,
            context_sample_size: default_context_sample_size(),
        }
    }
}

impl EnrichmentConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            delay: Duration::from_millis(self.retry_delay_ms),
            backoff: self.backoff,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or("disabled")
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_enrich_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_enrich_timeout() -> u64 {
    60
}
fn default_workers() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_context_sample_size() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            delay: Duration::from_secs(1),
            backoff: Backoff::Exponential,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
    #[serde(default)]
    pub min_samples: Option<usize>,
    #[serde(default)]
    pub selection: SelectionMethod,
    #[serde(default = "default_reduce_dims")]
    pub reduce_dims: usize,
    #[serde(default = "default_neighbors")]
    pub neighbors: usize,
    #[serde(default = "default_top_terms")]
    pub top_terms: usize,
    #[serde(default = "default_sample_titles")]
    pub sample_titles: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: default_min_cluster_size(),
            min_samples: None,
            selection: SelectionMethod::default(),
            reduce_dims: default_reduce_dims(),
            neighbors: default_neighbors(),
            top_terms: default_top_terms(),
            sample_titles: default_sample_titles(),
            seed: default_seed(),
        }
    }
}

/// How clusters are picked out of the HDBSCAN hierarchy.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    /// Excess of mass.
    #[default]
    Eom,
    /// Leaf clusters only.
    Leaf,
}

fn default_min_cluster_size() -> usize {
    5
}
fn default_reduce_dims() -> usize {
    5
}
fn default_neighbors() -> usize {
    15
}
fn default_top_terms() -> usize {
    10
}
fn default_sample_titles() -> usize {
    5
}
fn default_seed() -> u64 {
    42
}

#[derive(Debug, Deserialize, Clone)]
pub struct LayoutConfig {
    /// Preference order; `random` is always appended as the last resort.
    #[serde(default = "default_layout_algorithms")]
    pub algorithms: Vec<String>,
    #[serde(default = "default_layout_neighbors")]
    pub neighbors: usize,
    #[serde(default = "default_layout_seed")]
    pub seed: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            algorithms: default_layout_algorithms(),
            neighbors: default_layout_neighbors(),
            seed: default_layout_seed(),
        }
    }
}

fn default_layout_algorithms() -> Vec<String> {
    vec!["spectral".into(), "pca".into(), "random".into()]
}
fn default_layout_neighbors() -> usize {
    10
}
fn default_layout_seed() -> u64 {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoresConfig {
    /// `sqlite` or `memory`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub graph_path: Option<PathBuf>,
    #[serde(default)]
    pub vector_path: Option<PathBuf>,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            graph_path: None,
            vector_path: None,
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoadConfig {
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            write_concurrency: default_write_concurrency(),
        }
    }
}

fn default_write_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            page_size: default_page_size(),
        }
    }
}

fn default_limit() -> usize {
    10
}
fn default_page_size() -> usize {
    50
}

impl Config {
    /// Configuration with every section at its default, rooted at `work_dir`.
    pub fn for_work_dir(input: &Path, work_dir: &Path) -> Self {
        Self {
            paths: PathsConfig {
                input: input.to_path_buf(),
                work_dir: work_dir.to_path_buf(),
            },
            chunking: ChunkingConfig::default(),
            enrichment: EnrichmentConfig::default(),
            embedding: EmbeddingConfig::default(),
            clustering: ClusteringConfig::default(),
            layout: LayoutConfig::default(),
            stores: StoresConfig::default(),
            load: LoadConfig::default(),
            retrieval: RetrievalConfig::default(),
        }
    }

    pub fn graph_path(&self) -> PathBuf {
        self.stores
            .graph_path
            .clone()
            .unwrap_or_else(|| self.paths.work_dir.join("graph.sqlite"))
    }

    pub fn vector_path(&self) -> PathBuf {
        self.stores
            .vector_path
            .clone()
            .unwrap_or_else(|| self.paths.work_dir.join("vectors.sqlite"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }

        if self.enrichment.workers == 0 {
            bail!("enrichment.workers must be >= 1");
        }
        match self.enrichment.provider.as_str() {
            "disabled" => {}
            "ollama" | "openai" => {
                if self.enrichment.model.is_none() {
                    bail!(
                        "enrichment.model must be specified when provider is '{}'",
                        self.enrichment.provider
                    );
                }
            }
            other => bail!(
                "Unknown enrichment provider: '{}'. Must be disabled, ollama, or openai.",
                other
            ),
        }

        match self.embedding.provider.as_str() {
            "hashing" | "local" => {}
            "openai" | "ollama" => {
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hashing, openai, ollama, or local.",
                other
            ),
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        let c = &self.clustering;
        if c.min_cluster_size < 2 {
            bail!(
                "clustering.min_cluster_size must be >= 2, got {}",
                c.min_cluster_size
            );
        }
        if let Some(ms) = c.min_samples {
            if ms == 0 || ms > c.min_cluster_size {
                bail!(
                    "clustering.min_samples ({}) must be in 1..=min_cluster_size ({})",
                    ms,
                    c.min_cluster_size
                );
            }
        }
        if c.reduce_dims == 0 {
            bail!("clustering.reduce_dims must be > 0");
        }

        for algo in &self.layout.algorithms {
            if !matches!(algo.as_str(), "spectral" | "pca" | "random") {
                bail!(
                    "Unknown layout algorithm: '{}'. Must be spectral, pca, or random.",
                    algo
                );
            }
        }

        if !matches!(self.stores.backend.as_str(), "sqlite" | "memory") {
            bail!(
                "Unknown store backend: '{}'. Must be sqlite or memory.",
                self.stores.backend
            );
        }
        if self.load.write_concurrency == 0 {
            bail!("load.write_concurrency must be >= 1");
        }
        if self.retrieval.default_limit == 0 || self.retrieval.page_size == 0 {
            bail!("retrieval.default_limit and retrieval.page_size must be >= 1");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
