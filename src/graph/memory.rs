//! In-memory [`GraphStore`] for tests and throwaway runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{prop_matches, Direction, Edge, GraphStore, Node, NodeLabel, RelType};
use crate::error::Result;

type NodeKey = (NodeLabel, String);

#[derive(Default)]
pub struct InMemoryGraph {
    nodes: RwLock<BTreeMap<NodeKey, Map<String, Value>>>,
    edges: RwLock<BTreeSet<(RelType, String, String)>>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, label: NodeLabel, id: &str) -> Option<Node> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(&(label, id.to_string())).map(|props| Node {
            label,
            id: id.to_string(),
            props: props.clone(),
        })
    }

    fn exists(&self, label: NodeLabel, id: &str) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.contains_key(&(label, id.to_string()))
    }
}

#[async_trait]
impl GraphStore for InMemoryGraph {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert_node(&self, node: &Node) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.insert((node.label, node.id.clone()), node.props.clone());
        Ok(())
    }

    async fn upsert_edge(&self, edge: &Edge) -> Result<()> {
        let (from_label, to_label) = edge.rel.endpoints();
        if !self.exists(from_label, &edge.from) {
            return Err(edge.dangling(true));
        }
        if !self.exists(to_label, &edge.to) {
            return Err(edge.dangling(false));
        }
        let mut edges = self.edges.write().unwrap_or_else(|e| e.into_inner());
        edges.insert((edge.rel, edge.from.clone(), edge.to.clone()));
        Ok(())
    }

    async fn retain_edges(&self, rel: RelType, from: &str, keep: &[String]) -> Result<usize> {
        let mut edges = self.edges.write().unwrap_or_else(|e| e.into_inner());
        let before = edges.len();
        edges.retain(|(r, f, t)| !(*r == rel && f == from && !keep.contains(t)));
        Ok(before - edges.len())
    }

    async fn delete_nodes(&self, label: NodeLabel, ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            for id in ids {
                if nodes.remove(&(label, id.clone())).is_some() {
                    removed += 1;
                }
            }
        }
        let mut edges = self.edges.write().unwrap_or_else(|e| e.into_inner());
        edges.retain(|(rel, from, to)| {
            let (fl, tl) = rel.endpoints();
            !((fl == label && ids.contains(from)) || (tl == label && ids.contains(to)))
        });
        Ok(removed)
    }

    async fn node_ids(&self, label: NodeLabel) -> Result<Vec<String>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        Ok(nodes
            .keys()
            .filter(|(l, _)| *l == label)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn get_node(&self, label: NodeLabel, id: &str) -> Result<Option<Node>> {
        Ok(self.node(label, id))
    }

    async fn neighbors(
        &self,
        label: NodeLabel,
        id: &str,
        rel: RelType,
        direction: Direction,
    ) -> Result<Vec<Node>> {
        let (from_label, to_label) = rel.endpoints();
        let ids: Vec<String> = {
            let edges = self.edges.read().unwrap_or_else(|e| e.into_inner());
            match direction {
                Direction::Outgoing if label == from_label => edges
                    .iter()
                    .filter(|(r, f, _)| *r == rel && f == id)
                    .map(|(_, _, t)| t.clone())
                    .collect(),
                Direction::Incoming if label == to_label => edges
                    .iter()
                    .filter(|(r, _, t)| *r == rel && t == id)
                    .map(|(_, f, _)| f.clone())
                    .collect(),
                _ => Vec::new(),
            }
        };
        let other = match direction {
            Direction::Outgoing => to_label,
            Direction::Incoming => from_label,
        };
        let mut out: Vec<Node> = ids.iter().filter_map(|i| self.node(other, i)).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn find_nodes(&self, label: NodeLabel, key: &str, value: &str) -> Result<Vec<Node>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        Ok(nodes
            .iter()
            .filter(|((l, _), props)| {
                *l == label && props.get(key).is_some_and(|v| prop_matches(v, value))
            })
            .map(|((l, id), props)| Node {
                label: *l,
                id: id.clone(),
                props: props.clone(),
            })
            .collect())
    }

    async fn count_nodes(&self, label: NodeLabel) -> Result<u64> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        Ok(nodes.keys().filter(|(l, _)| *l == label).count() as u64)
    }

    async fn count_edges(&self, rel: RelType) -> Result<u64> {
        let edges = self.edges.read().unwrap_or_else(|e| e.into_inner());
        Ok(edges.iter().filter(|(r, _, _)| *r == rel).count() as u64)
    }
}
