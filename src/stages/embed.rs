//! Embed: chunk texts → embedding records.
//!
//! Batches go to the configured provider. A batch the provider cannot
//! embed is written with feature-hashing vectors of the same width and
//! left unmarked, so the next run retries the real provider.

use serde_json::json;
use tracing::warn;

use super::{input_path, open_manifest, open_output, output_path, read_upstream};
use crate::artifact::{CHUNKS, EMBEDDINGS};
use crate::context::PipelineContext;
use crate::embedding::{EmbeddingProvider, HashingProvider, HASHING_MODEL};
use crate::error::Result;
use crate::hasher::{compute_hash, digest_value, is_processed, mark_processed};
use crate::models::{Chunk, EmbeddingRecord};
use crate::pipeline::{RunOptions, Stage, StageIo, StageRun, UnitOutcome};

pub fn unit_digest(chunk: &Chunk, provider: &dyn EmbeddingProvider) -> String {
    digest_value(&json!({
        "chunk": compute_hash(chunk),
        "model": provider.model_name(),
        "dims": provider.dims(),
    }))
}

pub async fn run(
    ctx: &PipelineContext,
    io: &StageIo,
    opts: &RunOptions,
    run: &mut StageRun<'_>,
) -> Result<()> {
    let chunks: Vec<Chunk> = read_upstream(Stage::Embed, &input_path(io, CHUNKS))?;
    let mut manifest = open_manifest(Stage::Embed, io, opts)?;
    let mut out = open_output(Stage::Embed, &output_path(io, EMBEDDINGS))?;
    let provider = ctx.embedder.as_ref();

    run.begin(chunks.len());
    let mut pending: Vec<(String, &Chunk)> = Vec::new();
    for chunk in &chunks {
        let digest = unit_digest(chunk, provider);
        if is_processed(&digest, &manifest) {
            run.record(UnitOutcome::Skipped);
        } else {
            pending.push((digest, chunk));
        }
    }

    let fallback = HashingProvider::new(provider.dims().max(1));
    for batch in pending.chunks(ctx.config.embedding.batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|(_, c)| c.text.clone()).collect();
        match provider.embed(&texts).await {
            Ok(vectors) => {
                for ((digest, chunk), vector) in batch.iter().zip(vectors) {
                    out.append(&EmbeddingRecord {
                        id: chunk.id.clone(),
                        model: provider.model_name().to_string(),
                        dims: vector.len(),
                        vector,
                    })?;
                    mark_processed(digest, &mut manifest)?;
                    run.record(UnitOutcome::Written);
                }
            }
            Err(e) => {
                warn!(
                    batch = batch.len(),
                    error = %e,
                    kind = ?e.kind(),
                    "embedding batch failed, using hashing vectors"
                );
                for (_, chunk) in batch {
                    let vector = fallback.embed_one(&chunk.text);
                    out.append(&EmbeddingRecord {
                        id: chunk.id.clone(),
                        model: HASHING_MODEL.to_string(),
                        dims: vector.len(),
                        vector,
                    })?;
                    run.record(UnitOutcome::Fallback);
                }
            }
        }
    }
    Ok(())
}
