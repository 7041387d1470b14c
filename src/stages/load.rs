//! Load: artifacts → graph store and vector index.
//!
//! Every entity becomes one load unit whose digest covers its full
//! projection (props, vector, outgoing relationships), enrichment and
//! cluster fields included. A unit is skipped when its digest is in the
//! manifest and its node (and point, if any) is present in the stores.
//! Only units the writer reports as fully committed are logged and marked.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{input_path, open_manifest, open_output, output_path, read_upstream};
use crate::artifact::{
    current_run, latest_by_key, read_optional, records_of_run, ASSIGNMENTS, CHUNKS, CLUSTERS,
    CONVERSATIONS, EMBEDDINGS, ENRICHED, LOAD_LOG, MESSAGES, POSITIONS, RUNS,
};
use crate::context::PipelineContext;
use crate::embedding::vec_to_blob;
use crate::error::Result;
use crate::graph::{GraphStore, Node, NodeLabel, RelType};
use crate::hasher::{digest_value, is_processed, mark_processed, sha256_hex};
use crate::layout::cluster_centers;
use crate::models::{
    Chunk, ChunkPosition, Cluster, ClusterAssignment, Conversation, EmbeddingRecord, Message,
    NOISE_CLUSTER,
};
use crate::pipeline::{RunOptions, Stage, StageIo, StageRun, UnitOutcome};
use crate::vector::{self, Point, VectorIndex};
use crate::writer::{DualStoreWriter, EntityWrite, LoadPlan};

/// Latest state of every upstream stream, joined per chunk.
#[derive(Debug, Default)]
pub struct LoadInputs {
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
    /// Chunks with annotation, cluster id and embedding ref filled in.
    pub chunks: Vec<Chunk>,
    pub embeddings: HashMap<String, EmbeddingRecord>,
    pub clusters: Vec<Cluster>,
    pub positions: HashMap<String, ChunkPosition>,
}

impl LoadInputs {
    pub fn read(io: &StageIo) -> Result<Self> {
        let conversations: Vec<Conversation> =
            read_upstream(Stage::Load, &input_path(io, CONVERSATIONS))?;
        let messages: Vec<Message> = read_upstream(Stage::Load, &input_path(io, MESSAGES))?;
        let chunks: Vec<Chunk> = read_upstream(Stage::Load, &input_path(io, CHUNKS))?;

        let annotations: HashMap<String, Chunk> =
            latest_by_key(read_optional::<Chunk>(&input_path(io, ENRICHED))?)
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect();
        let embeddings: HashMap<String, EmbeddingRecord> =
            latest_by_key(read_optional::<EmbeddingRecord>(&input_path(io, EMBEDDINGS))?)
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect();
        let runs = input_path(io, RUNS);
        let cluster_run = current_run(&runs, Stage::Cluster.as_str())?;
        let position_run = current_run(&runs, Stage::Position.as_str())?;
        let assignments: HashMap<String, i64> = records_of_run(
            read_optional::<ClusterAssignment>(&input_path(io, ASSIGNMENTS))?,
            cluster_run.as_deref(),
        )
        .into_iter()
        .map(|a| (a.chunk_id, a.cluster_id))
        .collect();
        let mut clusters = records_of_run(
            read_optional::<Cluster>(&input_path(io, CLUSTERS))?,
            cluster_run.as_deref(),
        );
        let positions: HashMap<String, ChunkPosition> = latest_by_key(records_of_run(
            read_optional::<ChunkPosition>(&input_path(io, POSITIONS))?,
            position_run.as_deref(),
        ))
        .into_iter()
        .map(|p| (p.chunk_id.clone(), p))
        .collect();

        let chunks: Vec<Chunk> = chunks
            .into_iter()
            .map(|mut chunk| {
                chunk.annotation = annotations.get(&chunk.id).and_then(|c| c.annotation.clone());
                chunk.cluster_id = assignments.get(&chunk.id).copied();
                if embeddings.contains_key(&chunk.id) {
                    chunk.embedding_ref = Some(format!("{}/{}", vector::CHUNKS, chunk.id));
                }
                chunk
            })
            .collect();

        let centers = cluster_centers(chunks.iter().filter_map(|c| {
            let cluster = c.cluster_id?;
            let p = positions.get(&c.id)?;
            Some((cluster, (p.x, p.y)))
        }));
        for cluster in &mut clusters {
            if let Some((x, y)) = centers.get(&cluster.id) {
                cluster.x = Some(*x);
                cluster.y = Some(*y);
            }
        }

        Ok(Self {
            conversations,
            messages,
            chunks,
            embeddings,
            clusters,
            positions,
        })
    }

    /// Occurrences of each tag across annotated chunks.
    pub fn tag_counts(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for chunk in &self.chunks {
            for tag in chunk.tags() {
                *counts.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

fn props<I>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (&'static str, Value)>,
{
    pairs
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Digest of everything a unit would write.
pub fn unit_digest(write: &EntityWrite) -> String {
    let mut edges: Vec<(&str, &str)> = write
        .edges
        .iter()
        .map(|e| (e.rel.as_str(), e.to.as_str()))
        .collect();
    edges.sort_unstable();
    let vector = write
        .point
        .as_ref()
        .map(|(collection, p)| {
            json!({
                "collection": collection,
                "vector": sha256_hex(&vec_to_blob(&p.vector)),
                "payload": p.payload,
            })
        });
    digest_value(&json!({
        "label": write.node.label.as_str(),
        "id": write.node.id,
        "props": write.node.props,
        "point": vector,
        "edges": edges,
    }))
}

fn unit(node: Node) -> EntityWrite {
    EntityWrite::new(String::new(), node)
}

fn sealed(mut write: EntityWrite) -> EntityWrite {
    write.digest = unit_digest(&write);
    write
}

/// Project the inputs into load units, grouped by write phase.
pub fn build_plan(inputs: &LoadInputs) -> LoadPlan {
    let mut plan = LoadPlan::default();

    for c in &inputs.conversations {
        let node = Node::new(NodeLabel::Conversation, &c.id).with_props(props([
            ("title", json!(c.title)),
            ("create_time", json!(c.create_time)),
            ("message_count", json!(c.message_ids.len())),
        ]));
        let mut write = unit(node);
        for m in &c.message_ids {
            write = write.with_edge(RelType::HasMessage, m);
        }
        plan.raw.push(sealed(write));
    }

    for m in &inputs.messages {
        let node = Node::new(NodeLabel::Message, &m.id).with_props(props([
            ("conversation_id", json!(m.conversation_id)),
            ("role", json!(m.role)),
            ("content", json!(m.content)),
            ("timestamp", json!(m.timestamp)),
        ]));
        let mut write = unit(node);
        if let Some(parent) = &m.parent_id {
            write = write.with_edge(RelType::ReplyTo, parent);
        }
        plan.raw.push(sealed(write));
    }

    let cluster_ids: HashSet<i64> = inputs.clusters.iter().map(|c| c.id).collect();
    for chunk in &inputs.chunks {
        let annotation = chunk.annotation.as_ref();
        let position = inputs.positions.get(&chunk.id);
        let node = Node::new(NodeLabel::Chunk, &chunk.id).with_props(props([
            ("text", json!(chunk.text)),
            ("conversation_id", json!(chunk.conversation_id)),
            ("source_message_id", json!(chunk.source_message_id)),
            ("index", json!(chunk.index)),
            ("tags", json!(annotation.map(|a| &a.tags))),
            ("category", json!(annotation.map(|a| &a.category))),
            ("domain", json!(annotation.map(|a| a.domain.to_lowercase()))),
            ("confidence", json!(annotation.map(|a| a.confidence.as_str()))),
            ("annotation_source", json!(annotation.map(|a| a.source))),
            ("cluster_id", json!(chunk.cluster_id)),
            ("embedding_ref", json!(chunk.embedding_ref)),
            ("x", json!(position.map(|p| p.x))),
            ("y", json!(position.map(|p| p.y))),
            ("layout", json!(position.map(|p| p.method.as_str()))),
        ]));
        let mut write = unit(node)
            .with_edge(RelType::PartOf, &chunk.source_message_id)
            .replacing(RelType::Tagged)
            .replacing(RelType::InCluster);
        for tag in chunk.tags() {
            write = write.with_edge(RelType::Tagged, tag);
        }
        if let Some(cluster) = chunk
            .cluster_id
            .filter(|c| *c != NOISE_CLUSTER && cluster_ids.contains(c))
        {
            write = write.with_edge(RelType::InCluster, cluster.to_string());
        }
        if let Some(record) = inputs.embeddings.get(&chunk.id) {
            let payload = props([
                ("conversation_id", json!(chunk.conversation_id)),
                ("source_message_id", json!(chunk.source_message_id)),
                ("tags", json!(chunk.tags())),
                ("domain", json!(annotation.map(|a| a.domain.to_lowercase()))),
                ("category", json!(annotation.map(|a| &a.category))),
                ("cluster_id", json!(chunk.cluster_id)),
                ("model", json!(record.model)),
            ]);
            write = write.with_point(
                vector::CHUNKS,
                Point {
                    id: chunk.id.clone(),
                    vector: record.vector.clone(),
                    payload,
                },
            );
        }
        plan.chunks.push(sealed(write));
    }

    for (name, count) in inputs.tag_counts() {
        let node = Node::new(NodeLabel::Tag, &name).with_props(props([("count", json!(count))]));
        plan.semantic.push(sealed(unit(node)));
    }

    for cluster in &inputs.clusters {
        let node = Node::new(NodeLabel::Cluster, cluster.store_id()).with_props(props([
            ("run", json!(cluster.run)),
            ("size", json!(cluster.size)),
            ("top_terms", json!(cluster.top_terms)),
            ("sample_titles", json!(cluster.sample_titles)),
            ("x", json!(cluster.x)),
            ("y", json!(cluster.y)),
        ]));
        let mut write = unit(node);
        if !cluster.centroid.is_empty() {
            let payload = props([
                ("size", json!(cluster.size)),
                ("top_terms", json!(cluster.top_terms)),
                ("run", json!(cluster.run)),
            ]);
            write = write.with_point(
                vector::CLUSTERS,
                Point {
                    id: cluster.store_id(),
                    vector: cluster.centroid.clone(),
                    payload,
                },
            );
        }
        plan.semantic.push(sealed(write));
    }

    plan
}

/// Ids currently held by the stores, per label and collection.
struct Present {
    nodes: HashMap<NodeLabel, HashSet<String>>,
    points: HashMap<String, HashSet<String>>,
}

impl Present {
    async fn read(graph: &dyn GraphStore, vectors: &dyn VectorIndex) -> Result<Self> {
        let mut nodes = HashMap::new();
        for label in NodeLabel::ALL {
            nodes.insert(label, graph.node_ids(label).await?.into_iter().collect());
        }
        let mut points = HashMap::new();
        for collection in [vector::CHUNKS, vector::CLUSTERS] {
            let ids = vectors.ids(collection).await?.into_iter().collect();
            points.insert(collection.to_string(), ids);
        }
        Ok(Self { nodes, points })
    }

    fn holds(&self, write: &EntityWrite) -> bool {
        let node = self
            .nodes
            .get(&write.node.label)
            .is_some_and(|ids| ids.contains(&write.node.id));
        let point = write.point.as_ref().map_or(true, |(collection, p)| {
            self.points.get(collection).is_some_and(|ids| ids.contains(&p.id))
        });
        node && point
    }
}

#[derive(Debug, Serialize)]
struct LoadRecord<'a> {
    digest: &'a str,
    label: &'static str,
    id: &'a str,
}

pub async fn run(
    ctx: &PipelineContext,
    io: &StageIo,
    opts: &RunOptions,
    run: &mut StageRun<'_>,
) -> Result<()> {
    let inputs = LoadInputs::read(io)?;
    let mut plan = build_plan(&inputs);
    let mut manifest = open_manifest(Stage::Load, io, opts)?;
    let present = Present::read(ctx.graph.as_ref(), ctx.vectors.as_ref()).await?;

    run.begin(plan.len());
    for phase in [&mut plan.raw, &mut plan.chunks, &mut plan.semantic] {
        let before = phase.len();
        phase.retain(|w| !(is_processed(&w.digest, &manifest) && present.holds(w)));
        for _ in phase.len()..before {
            run.record(UnitOutcome::Skipped);
        }
    }

    if !plan.is_empty() {
        let writer = DualStoreWriter::new(
            ctx.graph.clone(),
            ctx.vectors.clone(),
            ctx.config.load.write_concurrency,
        );
        let report = writer.write(&plan).await;
        let committed: HashSet<&str> = report.committed.iter().map(String::as_str).collect();

        let mut log = open_output(Stage::Load, &output_path(io, LOAD_LOG))?;
        for write in plan.raw.iter().chain(&plan.chunks).chain(&plan.semantic) {
            if committed.contains(write.digest.as_str()) {
                log.append(&LoadRecord {
                    digest: &write.digest,
                    label: write.node.label.as_str(),
                    id: &write.node.id,
                })?;
                mark_processed(&write.digest, &mut manifest)?;
                run.record(UnitOutcome::Written);
            } else {
                run.record_failure();
            }
        }
        info!(
            nodes = report.nodes_written,
            points = report.points_written,
            edges = report.edges_written,
            edges_removed = report.edges_removed,
            entity_failures = report.entity_failures,
            integrity_violations = report.integrity_violations,
            edge_failures = report.edge_failures,
            "load written"
        );
    }

    let clusters: HashSet<String> = inputs.clusters.iter().map(|c| c.store_id()).collect();
    let tags: HashSet<String> = inputs.tag_counts().into_keys().collect();
    prune(ctx, NodeLabel::Cluster, Some(vector::CLUSTERS), &clusters).await;
    prune(ctx, NodeLabel::Tag, None, &tags).await;
    Ok(())
}

/// Delete nodes (and their points) that the latest artifacts no longer
/// produce, e.g. clusters from an earlier run.
async fn prune(
    ctx: &PipelineContext,
    label: NodeLabel,
    collection: Option<&str>,
    keep: &HashSet<String>,
) {
    let stale: Vec<String> = match ctx.graph.node_ids(label).await {
        Ok(ids) => ids.into_iter().filter(|id| !keep.contains(id)).collect(),
        Err(e) => {
            warn!(label = label.as_str(), error = %e, "cannot list nodes for pruning");
            return;
        }
    };
    let stale_points: Vec<String> = match collection {
        Some(collection) => match ctx.vectors.ids(collection).await {
            Ok(ids) => ids.into_iter().filter(|id| !keep.contains(id)).collect(),
            Err(e) => {
                warn!(collection, error = %e, "cannot list points for pruning");
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    if stale.is_empty() && stale_points.is_empty() {
        return;
    }
    if let Err(e) = ctx.graph.delete_nodes(label, &stale).await {
        warn!(label = label.as_str(), error = %e, "pruning stale nodes failed");
    }
    if let Some(collection) = collection {
        if let Err(e) = ctx.vectors.delete(collection, &stale_points).await {
            warn!(collection, error = %e, "pruning stale points failed");
        }
    }
    info!(
        label = label.as_str(),
        nodes = stale.len(),
        points = stale_points.len(),
        "pruned stale entities"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Annotation, AnnotationSource, Confidence, LayoutMethod};

    fn inputs() -> LoadInputs {
        let conversation = Conversation {
            id: "conv".into(),
            title: "Lifetimes".into(),
            create_time: Some(1_700_000_000),
            message_ids: vec!["m1".into(), "m2".into()],
        };
        let m1 = Message {
            id: "m1".into(),
            conversation_id: "conv".into(),
            role: "user".into(),
            content: "why".into(),
            timestamp: None,
            parent_id: None,
        };
        let m2 = Message {
            id: "m2".into(),
            parent_id: Some("m1".into()),
            role: "assistant".into(),
            content: "because".into(),
            ..m1.clone()
        };
        let chunk = Chunk {
            id: "c1".into(),
            conversation_id: "conv".into(),
            source_message_id: "m2".into(),
            index: 0,
            text: "because".into(),
            cluster_id: Some(0),
            annotation: Some(Annotation {
                tags: vec!["#rust".into(), "#lifetimes".into()],
                category: "explanation".into(),
                confidence: Confidence::High,
                domain: "Programming".into(),
                reasoning: None,
                source: AnnotationSource::Model,
            }),
            embedding_ref: Some("chunks/c1".into()),
        };
        let mut embeddings = HashMap::new();
        embeddings.insert(
            "c1".to_string(),
            EmbeddingRecord {
                id: "c1".into(),
                model: "hashing".into(),
                dims: 2,
                vector: vec![0.6, 0.8],
            },
        );
        let mut positions = HashMap::new();
        positions.insert(
            "c1".to_string(),
            ChunkPosition {
                run: "r".into(),
                chunk_id: "c1".into(),
                x: 0.5,
                y: -0.5,
                method: LayoutMethod::Pca,
            },
        );
        LoadInputs {
            conversations: vec![conversation],
            messages: vec![m1, m2],
            chunks: vec![chunk],
            embeddings,
            clusters: vec![Cluster {
                run: "r".into(),
                id: 0,
                size: 1,
                top_terms: vec!["because".into()],
                sample_titles: vec!["Lifetimes".into()],
                x: Some(0.5),
                y: Some(-0.5),
                centroid: vec![0.6, 0.8],
            }],
            positions,
        }
    }

    #[test]
    fn test_plan_shape() {
        let plan = build_plan(&inputs());
        assert_eq!(plan.raw.len(), 3);
        assert_eq!(plan.chunks.len(), 1);
        // two tags and one cluster
        assert_eq!(plan.semantic.len(), 3);

        let chunk = &plan.chunks[0];
        assert_eq!(chunk.node.str_prop("domain"), Some("programming"));
        assert!(chunk.point.is_some());
        let rels: Vec<RelType> = chunk.edges.iter().map(|e| e.rel).collect();
        assert_eq!(rels.iter().filter(|r| **r == RelType::Tagged).count(), 2);
        assert!(rels.contains(&RelType::InCluster));
        assert!(chunk.replace.contains(&RelType::Tagged));
    }

    #[test]
    fn test_digest_covers_enrichment() {
        let base = build_plan(&inputs());
        let mut changed = inputs();
        changed.chunks[0].annotation.as_mut().unwrap().category = "question".into();
        let plan = build_plan(&changed);
        assert_ne!(base.chunks[0].digest, plan.chunks[0].digest);
        assert_eq!(base.raw[0].digest, plan.raw[0].digest);
    }

    #[test]
    fn test_noise_chunk_has_no_cluster_edge() {
        let mut data = inputs();
        data.chunks[0].cluster_id = Some(NOISE_CLUSTER);
        let plan = build_plan(&data);
        assert!(!plan.chunks[0].edges.iter().any(|e| e.rel == RelType::InCluster));
        assert!(plan.chunks[0].replace.contains(&RelType::InCluster));
    }

    #[test]
    fn test_tag_counts() {
        let mut data = inputs();
        let mut second = data.chunks[0].clone();
        second.id = "c2".into();
        second.annotation.as_mut().unwrap().tags = vec!["#rust".into()];
        data.chunks.push(second);
        let counts = data.tag_counts();
        assert_eq!(counts.get("#rust"), Some(&2));
        assert_eq!(counts.get("#lifetimes"), Some(&1));
    }
}
