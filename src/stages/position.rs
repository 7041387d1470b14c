//! Position: chunk texts → 2D coordinates.

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{close_run, input_path, open_manifest, open_output, output_path, read_upstream};
use crate::artifact::{CHUNKS, POSITIONS};
use crate::config::LayoutConfig;
use crate::context::PipelineContext;
use crate::error::Result;
use crate::hasher::{digest_value, is_processed, mark_processed};
use crate::layout::layout;
use crate::models::{Chunk, ChunkPosition};
use crate::pipeline::{RunOptions, Stage, StageIo, StageRun, UnitOutcome};

/// Chunk ids already cover their text, so the sorted ids plus the layout
/// settings identify a batch.
pub fn batch_digest(chunks: &[Chunk], config: &LayoutConfig) -> String {
    let mut ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
    ids.sort_unstable();
    digest_value(&json!({
        "inputs": ids,
        "algorithms": config.algorithms,
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
    let mut chunks: Vec<Chunk> = read_upstream(Stage::Position, &input_path(io, CHUNKS))?;
    chunks.sort_by(|a, b| a.id.cmp(&b.id));

    let config = &ctx.config.layout;
    let mut manifest = open_manifest(Stage::Position, io, opts)?;
    let digest = batch_digest(&chunks, config);
    run.begin(1);
    if is_processed(&digest, &manifest) {
        run.record(UnitOutcome::Skipped);
        return Ok(());
    }

    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    let placed = layout(&texts, config);
    let run_id = Uuid::new_v4().to_string();
    let mut out = open_output(Stage::Position, &output_path(io, POSITIONS))?;
    for (chunk, (x, y)) in chunks.iter().zip(&placed.points) {
        out.append(&ChunkPosition {
            run: run_id.clone(),
            chunk_id: chunk.id.clone(),
            x: *x,
            y: *y,
            method: placed.method,
        })?;
    }
    close_run(Stage::Position, io, &run_id, placed.points.len())?;
    mark_processed(&digest, &mut manifest)?;
    info!(
        run = %run_id,
        points = placed.points.len(),
        method = placed.method.as_str(),
        "positions committed"
    );
    run.record(UnitOutcome::Written);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{current_run, read_records, records_of_run, ArtifactWriter, RUNS};
    use crate::config::Config;
    use crate::graph::InMemoryGraph;
    use crate::progress::NoProgress;
    use crate::vector::InMemoryIndex;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_positions_in_unit_square() {
        let dir = TempDir::new().unwrap();
        let config = Config::for_work_dir(&dir.path().join("export.json"), dir.path());
        let io = StageIo::for_stage(&config, Stage::Position);
        let mut writer = ArtifactWriter::open(&io.input.join(CHUNKS)).unwrap();
        for i in 0..10 {
            let text = if i % 2 == 0 {
                format!("tokio runtime spawn task {}", i)
            } else {
                format!("banana bread oven recipe {}", i)
            };
            writer
                .append(&Chunk {
                    id: format!("c{}", i),
                    conversation_id: "conv".into(),
                    source_message_id: format!("m{}", i),
                    index: 0,
                    text,
                    cluster_id: None,
                    annotation: None,
                    embedding_ref: None,
                })
                .unwrap();
        }
        let ctx = PipelineContext::with_stores(
            config,
            Arc::new(InMemoryGraph::new()),
            Arc::new(InMemoryIndex::new()),
        )
        .unwrap();
        let progress = NoProgress;

        let mut state = StageRun::new(Stage::Position, &progress);
        run(&ctx, &io, &RunOptions::default(), &mut state).await.unwrap();
        let current = current_run(&io.output.join(RUNS), Stage::Position.as_str()).unwrap();
        assert!(current.is_some());
        let positions = records_of_run(
            read_records::<ChunkPosition>(&io.output.join(POSITIONS)).unwrap(),
            current.as_deref(),
        );
        assert_eq!(positions.len(), 10);
        assert!(positions
            .iter()
            .all(|p| (-1.0..=1.0).contains(&p.x) && (-1.0..=1.0).contains(&p.y)));

        let mut again = StageRun::new(Stage::Position, &progress);
        run(&ctx, &io, &RunOptions::default(), &mut again).await.unwrap();
        assert_eq!(again.report.skipped, 1);
    }
}
