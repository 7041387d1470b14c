//! Cluster: embeddings → cluster assignments and summaries.
//!
//! One unit per run: the digest covers every input id with its embedding
//! model and width, plus the clustering parameters. An unchanged digest
//! skips the stage. Each committed run gets a fresh run id and a run
//! header, even when every point is noise; readers keep only that run.

use std::collections::HashMap;

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{close_run, input_path, open_manifest, open_output, output_path, read_upstream};
use crate::artifact::{
    latest_by_key, read_optional, ASSIGNMENTS, CHUNKS, CLUSTERS, CONVERSATIONS, EMBEDDINGS,
};
use crate::cluster::{cluster_chunks, ClusterInput};
use crate::config::ClusteringConfig;
use crate::context::PipelineContext;
use crate::error::Result;
use crate::hasher::{digest_value, is_processed, mark_processed};
use crate::models::{Chunk, Cluster, ClusterAssignment, Conversation, EmbeddingRecord};
use crate::pipeline::{RunOptions, Stage, StageIo, StageRun, UnitOutcome};

pub fn batch_digest(records: &[EmbeddingRecord], config: &ClusteringConfig) -> String {
    let mut inputs: Vec<String> = records
        .iter()
        .map(|r| format!("{}:{}:{}", r.id, r.model, r.dims))
        .collect();
    inputs.sort_unstable();
    digest_value(&json!({
        "inputs": inputs,
        "min_cluster_size": config.min_cluster_size,
        "min_samples": config.min_samples,
        "selection": format!("{:?}", config.selection),
        "reduce_dims": config.reduce_dims,
        "neighbors": config.neighbors,
        "seed": config.seed,
    }))
}

pub async fn run(
    ctx: &PipelineContext,
    io: &StageIo,
    opts: &RunOptions,
    run: &mut StageRun<'_>,
) -> Result<()> {
    let chunks: Vec<Chunk> = read_upstream(Stage::Cluster, &input_path(io, CHUNKS))?;
    let embeddings: Vec<EmbeddingRecord> =
        read_upstream(Stage::Cluster, &input_path(io, EMBEDDINGS))?;
    let titles: HashMap<String, String> =
        latest_by_key(read_optional::<Conversation>(&input_path(io, CONVERSATIONS))?)
            .into_iter()
            .map(|c| (c.id, c.title))
            .collect();
    let chunks: HashMap<&str, &Chunk> = chunks.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut records: Vec<EmbeddingRecord> = embeddings
        .into_iter()
        .filter(|r| chunks.contains_key(r.id.as_str()))
        .collect();
    records.sort_by(|a, b| a.id.cmp(&b.id));

    let config = &ctx.config.clustering;
    let mut manifest = open_manifest(Stage::Cluster, io, opts)?;
    let digest = batch_digest(&records, config);
    run.begin(1);
    if is_processed(&digest, &manifest) {
        info!(points = records.len(), "clustering inputs unchanged");
        run.record(UnitOutcome::Skipped);
        return Ok(());
    }

    let inputs: Vec<ClusterInput> = records
        .into_iter()
        .filter_map(|r| {
            let chunk = chunks.get(r.id.as_str())?;
            Some(ClusterInput {
                text: chunk.text.clone(),
                title: titles.get(&chunk.conversation_id).cloned().unwrap_or_default(),
                chunk_id: r.id,
                vector: r.vector,
            })
        })
        .collect();
    let outcome = cluster_chunks(&inputs, config)?;

    let run_id = Uuid::new_v4().to_string();
    let mut assignments = open_output(Stage::Cluster, &output_path(io, ASSIGNMENTS))?;
    let mut clusters = open_output(Stage::Cluster, &output_path(io, CLUSTERS))?;
    for (chunk_id, cluster_id) in &outcome.assignments {
        assignments.append(&ClusterAssignment {
            run: run_id.clone(),
            chunk_id: chunk_id.clone(),
            cluster_id: *cluster_id,
        })?;
    }
    for summary in &outcome.clusters {
        clusters.append(&Cluster {
            run: run_id.clone(),
            id: summary.id,
            size: summary.size,
            top_terms: summary.top_terms.clone(),
            sample_titles: summary.sample_titles.clone(),
            x: None,
            y: None,
            centroid: summary.centroid.clone(),
        })?;
    }
    close_run(
        Stage::Cluster,
        io,
        &run_id,
        outcome.assignments.len() + outcome.clusters.len(),
    )?;
    mark_processed(&digest, &mut manifest)?;
    info!(
        run = %run_id,
        clusters = outcome.clusters.len(),
        noise = outcome.noise_count(),
        "cluster run committed"
    );
    run.record(UnitOutcome::Written);
    Ok(())
}
