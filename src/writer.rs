//! Dual-store writer.
//!
//! Publishes entities to the graph store and, where they carry a vector,
//! to the vector index. Writes run in four barrier-separated phases:
//!
//! 1. raw: conversations, messages
//! 2. chunk: chunks (vector upsert first, then graph upsert)
//! 3. semantic: tags, clusters
//! 4. relationships
//!
//! Entity writes inside a phase run concurrently; no phase starts until the
//! previous one has been fully acknowledged, so no relationship is issued
//! before its endpoints have been written. Individual failures are logged
//! and counted, never fatal. The two stores are not updated atomically.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::graph::{Edge, GraphStore, Node, RelType};
use crate::vector::{Point, VectorIndex};

/// One entity to publish, with the relationships it owns.
#[derive(Debug, Clone)]
pub struct EntityWrite {
    /// Load-unit digest; reported back when the whole unit succeeded.
    pub digest: String,
    pub node: Node,
    /// `(collection, point)` written to the vector index before the node.
    pub point: Option<(String, Point)>,
    /// Outgoing relationships from this node.
    pub edges: Vec<Edge>,
    /// Relationship types whose outgoing set is replaced by `edges`:
    /// existing edges of these types not in `edges` are removed.
    pub replace: Vec<RelType>,
}

impl EntityWrite {
    pub fn new(digest: impl Into<String>, node: Node) -> Self {
        Self {
            digest: digest.into(),
            node,
            point: None,
            edges: Vec::new(),
            replace: Vec::new(),
        }
    }

    pub fn with_point(mut self, collection: &str, point: Point) -> Self {
        self.point = Some((collection.to_string(), point));
        self
    }

    pub fn with_edge(mut self, rel: RelType, to: impl Into<String>) -> Self {
        self.edges.push(Edge::new(rel, self.node.id.clone(), to));
        self
    }

    pub fn replacing(mut self, rel: RelType) -> Self {
        if !self.replace.contains(&rel) {
            self.replace.push(rel);
        }
        self
    }
}

/// Everything one load run publishes, grouped by phase.
#[derive(Debug, Clone, Default)]
pub struct LoadPlan {
    pub raw: Vec<EntityWrite>,
    pub chunks: Vec<EntityWrite>,
    pub semantic: Vec<EntityWrite>,
}

impl LoadPlan {
    pub fn len(&self) -> usize {
        self.raw.len() + self.chunks.len() + self.semantic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub nodes_written: usize,
    pub points_written: usize,
    pub edges_written: usize,
    pub edges_removed: usize,
    pub entity_failures: usize,
    pub integrity_violations: usize,
    pub edge_failures: usize,
    /// Digests of units whose node, point and every relationship landed.
    pub committed: Vec<String>,
}

enum EntityResult {
    Ok { point: bool },
    Failed,
}

pub struct DualStoreWriter {
    graph: Arc<dyn GraphStore>,
    vectors: Arc<dyn VectorIndex>,
    concurrency: usize,
}

impl DualStoreWriter {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        vectors: Arc<dyn VectorIndex>,
        concurrency: usize,
    ) -> Self {
        Self {
            graph,
            vectors,
            concurrency: concurrency.max(1),
        }
    }

    async fn write_entity(&self, write: &EntityWrite) -> EntityResult {
        let mut wrote_point = false;
        if let Some((collection, point)) = &write.point {
            if let Err(e) = self.vectors.upsert(collection, point).await {
                warn!(
                    label = write.node.label.as_str(),
                    id = %write.node.id,
                    error = %e,
                    "vector upsert failed"
                );
                return EntityResult::Failed;
            }
            wrote_point = true;
        }
        if let Err(e) = self.graph.upsert_node(&write.node).await {
            warn!(
                label = write.node.label.as_str(),
                id = %write.node.id,
                error = %e,
                "graph upsert failed"
            );
            return EntityResult::Failed;
        }
        EntityResult::Ok { point: wrote_point }
    }

    /// Write one phase concurrently. Returns the indices that succeeded.
    async fn write_phase(
        &self,
        phase: &str,
        writes: &[EntityWrite],
        report: &mut WriteReport,
    ) -> Vec<bool> {
        let results: Vec<(usize, EntityResult)> = stream::iter(writes.iter().enumerate())
            .map(|(i, w)| async move { (i, self.write_entity(w).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut ok = vec![false; writes.len()];
        for (i, result) in results {
            match result {
                EntityResult::Ok { point } => {
                    ok[i] = true;
                    report.nodes_written += 1;
                    if point {
                        report.points_written += 1;
                    }
                }
                EntityResult::Failed => report.entity_failures += 1,
            }
        }
        debug!(phase, entities = writes.len(), "phase acknowledged");
        ok
    }

    async fn write_edges(&self, write: &EntityWrite, report: &mut WriteReport) -> bool {
        let mut clean = true;
        for rel in &write.replace {
            let keep: Vec<String> = write
                .edges
                .iter()
                .filter(|e| e.rel == *rel)
                .map(|e| e.to.clone())
                .collect();
            match self.graph.retain_edges(*rel, &write.node.id, &keep).await {
                Ok(n) => report.edges_removed += n,
                Err(e) => {
                    warn!(
                        rel = rel.as_str(),
                        from = %write.node.id,
                        error = %e,
                        "edge pruning failed"
                    );
                    report.edge_failures += 1;
                    clean = false;
                }
            }
        }
        for edge in &write.edges {
            match self.graph.upsert_edge(edge).await {
                Ok(()) => report.edges_written += 1,
                Err(e) => {
                    clean = false;
                    if e.kind() == ErrorKind::ReferentialIntegrity {
                        report.integrity_violations += 1;
                        warn!(error = %e, "skipping relationship with missing endpoint");
                    } else {
                        report.edge_failures += 1;
                        warn!(
                            rel = edge.rel.as_str(),
                            from = %edge.from,
                            to = %edge.to,
                            error = %e,
                            "relationship upsert failed"
                        );
                    }
                }
            }
        }
        clean
    }

    /// Publish `plan`, phase by phase.
    pub async fn write(&self, plan: &LoadPlan) -> WriteReport {
        let mut report = WriteReport::default();

        let raw_ok = self.write_phase("raw", &plan.raw, &mut report).await;
        let chunk_ok = self.write_phase("chunk", &plan.chunks, &mut report).await;
        let semantic_ok = self.write_phase("semantic", &plan.semantic, &mut report).await;

        let phases = [
            (&plan.raw, raw_ok),
            (&plan.chunks, chunk_ok),
            (&plan.semantic, semantic_ok),
        ];
        for (writes, ok) in phases {
            for (write, entity_ok) in writes.iter().zip(ok) {
                if !entity_ok {
                    continue;
                }
                if self.write_edges(write, &mut report).await {
                    report.committed.push(write.digest.clone());
                }
            }
        }
        report
    }
}
