//! Cross-store consistency auditor.
//!
//! Diffs the identifier sets of entities held in both stores. Purely
//! diagnostic: nothing is repaired. Drift converges on the next load,
//! because units that failed in either store are never marked processed.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::graph::{GraphStore, NodeLabel};
use crate::vector::{self, VectorIndex};

/// How many ids of each one-sided set a report carries.
pub const SAMPLE_SIZE: usize = 10;

/// Entities present in both stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditEntity {
    Chunk,
    Cluster,
}

impl AuditEntity {
    pub const ALL: [AuditEntity; 2] = [AuditEntity::Chunk, AuditEntity::Cluster];

    pub fn label(&self) -> NodeLabel {
        match self {
            AuditEntity::Chunk => NodeLabel::Chunk,
            AuditEntity::Cluster => NodeLabel::Cluster,
        }
    }

    pub fn collection(&self) -> &'static str {
        match self {
            AuditEntity::Chunk => vector::CHUNKS,
            AuditEntity::Cluster => vector::CLUSTERS,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chunk" | "chunks" => Some(AuditEntity::Chunk),
            "cluster" | "clusters" => Some(AuditEntity::Cluster),
            _ => None,
        }
    }
}

impl fmt::Display for AuditEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label().as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub entity: AuditEntity,
    pub only_in_graph: usize,
    pub only_in_vector: usize,
    pub intersection: usize,
    pub sample_only_in_graph: Vec<String>,
    pub sample_only_in_vector: Vec<String>,
}

impl AuditReport {
    pub fn drift(&self) -> usize {
        self.only_in_graph + self.only_in_vector
    }

    pub fn is_consistent(&self) -> bool {
        self.drift() == 0
    }
}

pub fn diff(entity: AuditEntity, graph_ids: Vec<String>, vector_ids: Vec<String>) -> AuditReport {
    let graph: BTreeSet<String> = graph_ids.into_iter().collect();
    let vectors: BTreeSet<String> = vector_ids.into_iter().collect();
    let only_graph: Vec<&String> = graph.difference(&vectors).collect();
    let only_vector: Vec<&String> = vectors.difference(&graph).collect();
    AuditReport {
        entity,
        only_in_graph: only_graph.len(),
        only_in_vector: only_vector.len(),
        intersection: graph.intersection(&vectors).count(),
        sample_only_in_graph: only_graph
            .iter()
            .take(SAMPLE_SIZE)
            .map(|s| s.to_string())
            .collect(),
        sample_only_in_vector: only_vector
            .iter()
            .take(SAMPLE_SIZE)
            .map(|s| s.to_string())
            .collect(),
    }
}

pub struct Auditor<'a> {
    graph: &'a dyn GraphStore,
    vectors: &'a dyn VectorIndex,
}

impl<'a> Auditor<'a> {
    pub fn new(graph: &'a dyn GraphStore, vectors: &'a dyn VectorIndex) -> Self {
        Self { graph, vectors }
    }

    pub async fn audit(&self, entity: AuditEntity) -> Result<AuditReport> {
        let graph_ids = self.graph.node_ids(entity.label()).await?;
        let vector_ids = self.vectors.ids(entity.collection()).await?;
        let report = diff(entity, graph_ids, vector_ids);
        if report.is_consistent() {
            info!(entity = %entity, count = report.intersection, "stores consistent");
        } else {
            warn!(
                entity = %entity,
                only_in_graph = report.only_in_graph,
                only_in_vector = report.only_in_vector,
                sample_graph = ?report.sample_only_in_graph,
                sample_vector = ?report.sample_only_in_vector,
                "ConsistencyDriftWarning: stores disagree"
            );
        }
        Ok(report)
    }

    pub async fn audit_all(&self) -> Result<Vec<AuditReport>> {
        let mut reports = Vec::with_capacity(AuditEntity::ALL.len());
        for entity in AuditEntity::ALL {
            reports.push(self.audit(entity).await?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InMemoryGraph, Node};
    use crate::vector::{InMemoryIndex, Point};

    fn ids(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_counts() {
        let report = diff(AuditEntity::Chunk, ids(&["a", "b", "c"]), ids(&["b", "c", "d", "e"]));
        assert_eq!(report.only_in_graph, 1);
        assert_eq!(report.only_in_vector, 2);
        assert_eq!(report.intersection, 2);
        assert_eq!(report.sample_only_in_graph, vec!["a"]);
        assert_eq!(report.sample_only_in_vector, vec!["d", "e"]);
        assert_eq!(report.drift(), 3);
    }

    #[test]
    fn test_sample_is_capped() {
        let many: Vec<String> = (0..50).map(|i| format!("v{:02}", i)).collect();
        let report = diff(AuditEntity::Cluster, Vec::new(), many);
        assert_eq!(report.only_in_vector, 50);
        assert_eq!(report.sample_only_in_vector.len(), SAMPLE_SIZE);
    }

    #[tokio::test]
    async fn test_audit_reads_both_stores() {
        let graph = InMemoryGraph::new();
        let index = InMemoryIndex::new();
        graph.upsert_node(&Node::new(NodeLabel::Chunk, "c1")).await.unwrap();
        for id in ["c1", "c2"] {
            index
                .upsert(
                    vector::CHUNKS,
                    &Point {
                        id: id.into(),
                        vector: vec![1.0],
                        payload: Default::default(),
                    },
                )
                .await
                .unwrap();
        }
        let auditor = Auditor::new(&graph, &index);
        let reports = auditor.audit_all().await.unwrap();
        assert_eq!(reports[0].entity, AuditEntity::Chunk);
        assert_eq!(reports[0].only_in_vector, 1);
        assert_eq!(reports[0].sample_only_in_vector, vec!["c2"]);
        assert!(reports[1].is_consistent());
    }

    #[test]
    fn test_parse_entity() {
        assert_eq!(AuditEntity::parse("Chunk"), Some(AuditEntity::Chunk));
        assert_eq!(AuditEntity::parse("clusters"), Some(AuditEntity::Cluster));
        assert_eq!(AuditEntity::parse("tag"), None);
    }
}
