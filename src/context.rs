//! Shared handles for a pipeline run.
//!
//! A [`PipelineContext`] owns the configuration, both stores, the
//! embedding provider and the optional inference service. The CLI builds
//! one from config; tests assemble one from in-memory parts.

use std::sync::Arc;

use tracing::info;

use crate::audit::Auditor;
use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::graph::{GraphStore, InMemoryGraph, SqliteGraph};
use crate::inference::{create_service, InferenceService};
use crate::progress::{NoProgress, StageProgressReporter};
use crate::retrieval::RetrievalFacade;
use crate::vector::{InMemoryIndex, SqliteIndex, VectorIndex};

#[derive(Clone)]
pub struct PipelineContext {
    pub config: Config,
    pub graph: Arc<dyn GraphStore>,
    pub vectors: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub inference: Option<Arc<dyn InferenceService>>,
    pub progress: Arc<dyn StageProgressReporter>,
}

impl PipelineContext {
    /// Open the configured stores and providers.
    pub async fn from_config(config: Config) -> Result<Self> {
        let (graph, vectors): (Arc<dyn GraphStore>, Arc<dyn VectorIndex>) =
            match config.stores.backend.as_str() {
                "sqlite" => (
                    Arc::new(SqliteGraph::open(&config.graph_path()).await?),
                    Arc::new(SqliteIndex::open(&config.vector_path()).await?),
                ),
                "memory" => (Arc::new(InMemoryGraph::new()), Arc::new(InMemoryIndex::new())),
                other => {
                    return Err(Error::Config(format!("Unknown store backend: '{}'", other)));
                }
            };
        let embedder = create_provider(&config.embedding)?;
        let inference = create_service(&config.enrichment)?;
        info!(
            graph = graph.name(),
            vectors = vectors.name(),
            embedder = embedder.model_name(),
            enrichment = inference.is_some(),
            "pipeline context ready"
        );
        Ok(Self {
            config,
            graph,
            vectors,
            embedder,
            inference,
            progress: Arc::new(NoProgress),
        })
    }

    /// Context over caller-supplied stores, with the configured embedder
    /// and no inference service.
    pub fn with_stores(
        config: Config,
        graph: Arc<dyn GraphStore>,
        vectors: Arc<dyn VectorIndex>,
    ) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        Ok(Self {
            config,
            graph,
            vectors,
            embedder,
            inference: None,
            progress: Arc::new(NoProgress),
        })
    }

    pub fn with_inference(mut self, service: Arc<dyn InferenceService>) -> Self {
        self.inference = Some(service);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn StageProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn retrieval(&self) -> RetrievalFacade {
        RetrievalFacade::new(
            self.graph.clone(),
            self.vectors.clone(),
            self.embedder.clone(),
            self.config.retrieval.clone(),
        )
    }

    pub fn auditor(&self) -> Auditor<'_> {
        Auditor::new(self.graph.as_ref(), self.vectors.as_ref())
    }
}
