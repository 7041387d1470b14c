//! Chunk: messages → paragraph chunks.

use tracing::debug;

use super::{input_path, open_manifest, open_output, output_path, read_upstream};
use crate::artifact::{CHUNKS, MESSAGES};
use crate::chunk::chunk_message;
use crate::context::PipelineContext;
use crate::error::Result;
use crate::hasher::{compute_hash, is_processed, mark_processed};
use crate::models::Message;
use crate::pipeline::{RunOptions, Stage, StageIo, StageRun, UnitOutcome};

pub async fn run(
    ctx: &PipelineContext,
    io: &StageIo,
    opts: &RunOptions,
    run: &mut StageRun<'_>,
) -> Result<()> {
    let messages: Vec<Message> = read_upstream(Stage::Chunk, &input_path(io, MESSAGES))?;
    let mut manifest = open_manifest(Stage::Chunk, io, opts)?;
    let mut out = open_output(Stage::Chunk, &output_path(io, CHUNKS))?;
    let max_tokens = ctx.config.chunking.max_tokens;

    run.begin(messages.len());
    for message in &messages {
        let digest = compute_hash(message);
        if is_processed(&digest, &manifest) {
            run.record(UnitOutcome::Skipped);
            continue;
        }
        let chunks = chunk_message(message, max_tokens);
        for chunk in &chunks {
            out.append(chunk)?;
        }
        mark_processed(&digest, &mut manifest)?;
        debug!(message = %message.id, chunks = chunks.len(), "message chunked");
        run.record(UnitOutcome::Written);
    }
    Ok(())
}
