//! Extract: raw export → conversation and message streams.

use tracing::{debug, warn};

use super::{open_manifest, open_output, output_path};
use crate::artifact::{CONVERSATIONS, MESSAGES};
use crate::context::PipelineContext;
use crate::corpus::{materialize, read_corpus};
use crate::error::{Error, Result};
use crate::hasher::{is_processed, mark_processed};
use crate::pipeline::{RunOptions, Stage, StageIo, StageRun, UnitOutcome};

pub async fn run(
    _ctx: &PipelineContext,
    io: &StageIo,
    opts: &RunOptions,
    run: &mut StageRun<'_>,
) -> Result<()> {
    let corpus =
        read_corpus(&io.input).map_err(|e| Error::stage_fatal(Stage::Extract.as_str(), e))?;
    if corpus.skipped > 0 {
        warn!(skipped = corpus.skipped, "export records could not be parsed");
    }

    let mut manifest = open_manifest(Stage::Extract, io, opts)?;
    let mut conversations = open_output(Stage::Extract, &output_path(io, CONVERSATIONS))?;
    let mut messages = open_output(Stage::Extract, &output_path(io, MESSAGES))?;

    run.begin(corpus.conversations.len());
    for raw in &corpus.conversations {
        let (conversation, turns) = materialize(raw);
        if is_processed(&conversation.id, &manifest) {
            run.record(UnitOutcome::Skipped);
            continue;
        }

        for message in &turns {
            messages.append(message)?;
        }
        conversations.append(&conversation)?;

        for message in &turns {
            mark_processed(&message.id, &mut manifest)?;
        }
        mark_processed(&conversation.id, &mut manifest)?;
        debug!(id = %conversation.id, messages = turns.len(), "conversation extracted");
        run.record(UnitOutcome::Written);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::read_latest;
    use crate::config::Config;
    use crate::graph::InMemoryGraph;
    use crate::manifest::read_entries;
    use crate::models::{Conversation, Message};
    use crate::progress::NoProgress;
    use crate::vector::InMemoryIndex;
    use std::sync::Arc;
    use tempfile::TempDir;

    const EXPORT: &str = r#"[
        {"title": "Borrowing", "messages": [
            {"role": "user", "content": "Why does the borrow checker complain?"},
            {"role": "assistant", "content": "Because two mutable borrows overlap."}
        ]},
        {"title": "Bread", "messages": [
            {"role": "user", "content": "How wet should sourdough be?"}
        ]}
    ]"#;

    fn ctx(dir: &TempDir) -> (PipelineContext, StageIo) {
        let input = dir.path().join("export.json");
        std::fs::write(&input, EXPORT).unwrap();
        let config = Config::for_work_dir(&input, &dir.path().join("work"));
        let io = StageIo::for_stage(&config, Stage::Extract);
        let ctx = PipelineContext::with_stores(
            config,
            Arc::new(InMemoryGraph::new()),
            Arc::new(InMemoryIndex::new()),
        )
        .unwrap();
        (ctx, io)
    }

    #[tokio::test]
    async fn test_extract_writes_then_skips() {
        let dir = TempDir::new().unwrap();
        let (ctx, io) = ctx(&dir);
        let progress = NoProgress;

        let mut first = StageRun::new(Stage::Extract, &progress);
        run(&ctx, &io, &RunOptions::default(), &mut first).await.unwrap();
        assert_eq!(first.report.written, 2);

        let conversations: Vec<Conversation> = read_latest(&io.output.join(CONVERSATIONS)).unwrap();
        let messages: Vec<Message> = read_latest(&io.output.join(MESSAGES)).unwrap();
        assert_eq!(conversations.len(), 2);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].parent_id.as_deref(), Some(messages[0].id.as_str()));
        // two conversation digests plus three message digests
        assert_eq!(read_entries(&io.manifest).unwrap().len(), 5);

        let mut second = StageRun::new(Stage::Extract, &progress);
        run(&ctx, &io, &RunOptions::default(), &mut second).await.unwrap();
        assert_eq!(second.report.written, 0);
        assert_eq!(second.report.skipped, 2);
        assert_eq!(read_entries(&io.manifest).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_missing_export_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (ctx, mut io) = ctx(&dir);
        io.input = dir.path().join("nope.json");
        let progress = NoProgress;
        let mut run_state = StageRun::new(Stage::Extract, &progress);
        let err = run(&ctx, &io, &RunOptions::default(), &mut run_state).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StageFatal);
    }
}
