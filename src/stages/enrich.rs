//! Enrich: chunks → annotated chunks.
//!
//! Runs the conversation pre-pass once per conversation with pending
//! chunks, then annotates pending chunks on a bounded worker pool. Results
//! are written and marked one at a time by this task, so the manifest
//! never runs ahead of the artifact.

use std::collections::{BTreeMap, HashMap};

use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{debug, info};

use super::{input_path, open_manifest, open_output, output_path, read_upstream};
use crate::artifact::{latest_by_key, read_optional, CHUNKS, CONVERSATIONS, ENRICHED};
use crate::context::PipelineContext;
use crate::enrich::EnrichmentClient;
use crate::error::Result;
use crate::hasher::{compute_hash, digest_value, is_processed, mark_processed};
use crate::models::{Annotation, Chunk, Conversation, ConversationContext};
use crate::pipeline::{RunOptions, Stage, StageIo, StageRun, UnitOutcome};

/// Digest of one enrichment unit: the chunk's identity plus the model that
/// annotates it, so switching models re-enriches.
pub fn unit_digest(chunk: &Chunk, enricher: &str) -> String {
    digest_value(&json!({
        "chunk": compute_hash(chunk),
        "enricher": enricher,
    }))
}

pub async fn run(
    ctx: &PipelineContext,
    io: &StageIo,
    opts: &RunOptions,
    run: &mut StageRun<'_>,
) -> Result<()> {
    let chunks: Vec<Chunk> = read_upstream(Stage::Enrich, &input_path(io, CHUNKS))?;
    let titles: HashMap<String, String> =
        latest_by_key(read_optional::<Conversation>(&input_path(io, CONVERSATIONS))?)
            .into_iter()
            .map(|c| (c.id, c.title))
            .collect();
    let mut manifest = open_manifest(Stage::Enrich, io, opts)?;
    let mut out = open_output(Stage::Enrich, &output_path(io, ENRICHED))?;

    let mut config = ctx.config.enrichment.clone();
    if let Some(workers) = opts.workers {
        config.workers = workers;
    }
    if let Some(delay) = opts.delay_ms {
        config.min_delay_ms = delay;
    }
    let client = ctx
        .inference
        .clone()
        .map(|service| EnrichmentClient::new(service, &config));
    let enricher = client.as_ref().map_or("disabled", |c| c.model()).to_string();
    if client.is_none() {
        info!("enrichment disabled, writing fallback annotations");
    }

    run.begin(chunks.len());
    let mut pending: Vec<(String, Chunk)> = Vec::new();
    for chunk in &chunks {
        let digest = unit_digest(chunk, &enricher);
        if is_processed(&digest, &manifest) {
            run.record(UnitOutcome::Skipped);
        } else {
            pending.push((digest, chunk.clone()));
        }
    }
    if pending.is_empty() {
        return Ok(());
    }

    let workers = config.workers.max(1);
    let contexts = match &client {
        Some(client) => classify_conversations(client, &chunks, &pending, &titles, workers).await,
        None => HashMap::new(),
    };

    let client = client.as_ref();
    let contexts = &contexts;
    let mut annotated = stream::iter(pending)
        .map(|(digest, chunk)| async move {
            let annotation = match client {
                Some(c) => {
                    let context = contexts.get(&chunk.conversation_id).and_then(Option::as_ref);
                    c.annotate(&chunk.text, context).await
                }
                None => Annotation::fallback(),
            };
            (digest, chunk, annotation)
        })
        .buffer_unordered(workers);

    while let Some((digest, mut chunk, annotation)) = annotated.next().await {
        let outcome = if annotation.is_fallback() {
            UnitOutcome::Fallback
        } else {
            UnitOutcome::Written
        };
        chunk.annotation = Some(annotation);
        out.append(&chunk)?;
        mark_processed(&digest, &mut manifest)?;
        run.record(outcome);
    }
    Ok(())
}

/// Pre-pass: one `{domain, topic}` per conversation that has pending
/// chunks, sampled from all of its chunks.
async fn classify_conversations(
    client: &EnrichmentClient,
    chunks: &[Chunk],
    pending: &[(String, Chunk)],
    titles: &HashMap<String, String>,
    workers: usize,
) -> HashMap<String, Option<ConversationContext>> {
    let mut siblings: BTreeMap<&str, Vec<&Chunk>> = BTreeMap::new();
    for chunk in chunks {
        siblings.entry(chunk.conversation_id.as_str()).or_default().push(chunk);
    }
    let wanted: Vec<&str> = {
        let mut ids: Vec<&str> = pending.iter().map(|(_, c)| c.conversation_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    };

    let results: Vec<(String, Option<ConversationContext>)> = stream::iter(wanted)
        .map(|conversation_id| {
            let mut members = siblings.get(conversation_id).cloned().unwrap_or_default();
            members.sort_by(|a, b| {
                a.source_message_id
                    .cmp(&b.source_message_id)
                    .then(a.index.cmp(&b.index))
            });
            let title = titles.get(conversation_id).map(String::as_str).unwrap_or("");
            async move {
                let texts: Vec<&str> = members.iter().map(|c| c.text.as_str()).collect();
                let context = client.classify_conversation(title, &texts).await;
                (conversation_id.to_string(), context)
            }
        })
        .buffer_unordered(workers)
        .collect()
        .await;
    debug!(conversations = results.len(), "conversation pre-pass done");
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{read_latest, ArtifactWriter};
    use crate::config::Config;
    use crate::graph::InMemoryGraph;
    use crate::inference::{ScriptStep, ScriptedService};
    use crate::models::{AnnotationSource, UNTAGGED};
    use crate::progress::NoProgress;
    use crate::vector::InMemoryIndex;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn chunk(id: &str, conversation: &str, text: &str) -> Chunk {
        Chunk {
            id: id.into(),
            conversation_id: conversation.into(),
            source_message_id: format!("msg-{}", id),
            index: 0,
            text: text.into(),
            cluster_id: None,
            annotation: None,
            embedding_ref: None,
        }
    }

    fn setup(dir: &TempDir) -> (Config, StageIo) {
        let mut config = Config::for_work_dir(&dir.path().join("export.json"), dir.path());
        config.enrichment.provider = "ollama".into();
        config.enrichment.model = Some("test-model".into());
        config.enrichment.retry_delay_ms = 1;
        config.enrichment.validate = false;
        let io = StageIo::for_stage(&config, Stage::Enrich);
        let mut writer = ArtifactWriter::open(&io.input.join(CHUNKS)).unwrap();
        writer.append(&chunk("c1", "conv-a", "fn main() {}")).unwrap();
        writer.append(&chunk("c2", "conv-a", "cargo build fails")).unwrap();
        writer.append(&chunk("c3", "conv-b", "proofing dough overnight")).unwrap();
        (config, io)
    }

    fn context(config: Config, service: Arc<ScriptedService>) -> PipelineContext {
        PipelineContext::with_stores(
            config,
            Arc::new(InMemoryGraph::new()),
            Arc::new(InMemoryIndex::new()),
        )
        .unwrap()
        .with_inference(service)
    }

    #[tokio::test]
    async fn test_annotates_every_chunk() {
        let dir = TempDir::new().unwrap();
        let (mut config, io) = setup(&dir);
        config.enrichment.context_sample_size = 0;
        let service = Arc::new(ScriptedService::always(
            r#"{"tags": ["Rust"], "category": "question",
                "confidence": "high", "domain": "programming"}"#,
        ));
        let ctx = context(config, service.clone());
        let progress = NoProgress;

        let mut state = StageRun::new(Stage::Enrich, &progress);
        run(&ctx, &io, &RunOptions::default(), &mut state).await.unwrap();
        assert_eq!(state.report.written, 3);
        assert_eq!(service.calls(), 3);

        let enriched: Vec<Chunk> = read_latest(&io.output.join(ENRICHED)).unwrap();
        assert_eq!(enriched.len(), 3);
        for c in &enriched {
            let a = c.annotation.as_ref().unwrap();
            assert_eq!(a.tags, vec!["#rust"]);
            assert_eq!(a.source, AnnotationSource::Model);
        }

        let mut again = StageRun::new(Stage::Enrich, &progress);
        run(&ctx, &io, &RunOptions::default(), &mut again).await.unwrap();
        assert_eq!(again.report.skipped, 3);
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test]
    async fn test_transient_failures_fall_back() {
        let dir = TempDir::new().unwrap();
        let (config, io) = setup(&dir);
        let service = Arc::new(ScriptedService::sequence(vec![ScriptStep::Transient]));
        let ctx = context(config, service);
        let progress = NoProgress;

        let opts = RunOptions {
            workers: Some(2),
            ..RunOptions::default()
        };
        let mut state = StageRun::new(Stage::Enrich, &progress);
        run(&ctx, &io, &opts, &mut state).await.unwrap();
        assert_eq!(state.report.fallback, 3);

        let enriched: Vec<Chunk> = read_latest(&io.output.join(ENRICHED)).unwrap();
        for c in &enriched {
            let a = c.annotation.as_ref().unwrap();
            assert_eq!(a.tags, vec![UNTAGGED]);
            assert_eq!(a.domain, "unknown");
        }
    }

    #[tokio::test]
    async fn test_disabled_enrichment_writes_fallbacks() {
        let dir = TempDir::new().unwrap();
        let (mut config, io) = setup(&dir);
        config.enrichment.provider = "disabled".into();
        let ctx = PipelineContext::with_stores(
            config,
            Arc::new(InMemoryGraph::new()),
            Arc::new(InMemoryIndex::new()),
        )
        .unwrap();
        let progress = NoProgress;
        let mut state = StageRun::new(Stage::Enrich, &progress);
        run(&ctx, &io, &RunOptions::default(), &mut state).await.unwrap();
        assert_eq!(state.report.fallback, 3);
    }

    #[test]
    fn test_unit_digest_tracks_model() {
        let c = chunk("c1", "conv", "text");
        assert_ne!(unit_digest(&c, "model-a"), unit_digest(&c, "model-b"));
        let mut annotated = c.clone();
        annotated.annotation = Some(Annotation::fallback());
        assert_eq!(unit_digest(&c, "m"), unit_digest(&annotated, "m"));
    }
}
