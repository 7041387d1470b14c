//! Graph store abstraction.
//!
//! The [`GraphStore`] trait holds typed nodes keyed by `(label, id)` and
//! typed, directed relationships between them. Writes are upserts, so
//! loading the same entity twice leaves exactly one node. Relationship
//! endpoints must already exist; a dangling endpoint is reported as
//! [`Error::ReferentialIntegrity`](crate::error::Error::ReferentialIntegrity)
//! and nothing is written.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert_node`](GraphStore::upsert_node) | Insert or replace a node's properties |
//! | [`upsert_edge`](GraphStore::upsert_edge) | Insert a relationship between existing nodes |
//! | [`retain_edges`](GraphStore::retain_edges) | Drop outgoing edges of a type not in a keep-set |
//! | [`delete_nodes`](GraphStore::delete_nodes) | Remove nodes and their relationships |
//! | [`node_ids`](GraphStore::node_ids) | All ids under a label, sorted |
//! | [`get_node`](GraphStore::get_node) | Fetch one node |
//! | [`neighbors`](GraphStore::neighbors) | Nodes one hop away over a relationship type |
//! | [`find_nodes`](GraphStore::find_nodes) | Property-match lookup |
//! | [`count_nodes`](GraphStore::count_nodes) | Node count under a label |

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub use memory::InMemoryGraph;
pub use sqlite::SqliteGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeLabel {
    Conversation,
    Message,
    Chunk,
    Tag,
    Cluster,
}

impl NodeLabel {
    pub const ALL: [NodeLabel; 5] = [
        NodeLabel::Conversation,
        NodeLabel::Message,
        NodeLabel::Chunk,
        NodeLabel::Tag,
        NodeLabel::Cluster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::Conversation => "Conversation",
            NodeLabel::Message => "Message",
            NodeLabel::Chunk => "Chunk",
            NodeLabel::Tag => "Tag",
            NodeLabel::Cluster => "Cluster",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelType {
    /// Conversation → Message
    HasMessage,
    /// Message → parent Message
    ReplyTo,
    /// Chunk → Message
    PartOf,
    /// Chunk → Tag
    Tagged,
    /// Chunk → Cluster
    InCluster,
}

impl RelType {
    pub const ALL: [RelType; 5] = [
        RelType::HasMessage,
        RelType::ReplyTo,
        RelType::PartOf,
        RelType::Tagged,
        RelType::InCluster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelType::HasMessage => "HAS_MESSAGE",
            RelType::ReplyTo => "REPLY_TO",
            RelType::PartOf => "PART_OF",
            RelType::Tagged => "TAGGED",
            RelType::InCluster => "IN_CLUSTER",
        }
    }

    /// `(from, to)` labels this relationship connects.
    pub fn endpoints(&self) -> (NodeLabel, NodeLabel) {
        match self {
            RelType::HasMessage => (NodeLabel::Conversation, NodeLabel::Message),
            RelType::ReplyTo => (NodeLabel::Message, NodeLabel::Message),
            RelType::PartOf => (NodeLabel::Chunk, NodeLabel::Message),
            RelType::Tagged => (NodeLabel::Chunk, NodeLabel::Tag),
            RelType::InCluster => (NodeLabel::Chunk, NodeLabel::Cluster),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A node with free-form JSON properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub label: NodeLabel,
    pub id: String,
    #[serde(default)]
    pub props: Map<String, Value>,
}

impl Node {
    pub fn new(label: NodeLabel, id: impl Into<String>) -> Self {
        Self {
            label,
            id: id.into(),
            props: Map::new(),
        }
    }

    pub fn with_props(mut self, props: Map<String, Value>) -> Self {
        self.props = props;
        self
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    pub fn str_prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub rel: RelType,
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(rel: RelType, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            rel,
            from: from.into(),
            to: to.into(),
        }
    }

    pub(crate) fn dangling(&self, missing_from: bool) -> Error {
        let (from_label, to_label) = self.rel.endpoints();
        let from = format!("{}:{}", from_label.as_str(), self.from);
        let to = format!("{}:{}", to_label.as_str(), self.to);
        Error::ReferentialIntegrity {
            rel: self.rel.as_str().to_string(),
            missing: if missing_from { from.clone() } else { to.clone() },
            from,
            to,
        }
    }
}

/// Whether a stored property value equals `expected`, comparing
/// non-string values by their JSON text.
pub(crate) fn prop_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Array(items) => items.iter().any(|v| prop_matches(v, expected)),
        other => other.to_string() == expected,
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Backend name for logs and `status`.
    fn name(&self) -> &str;

    async fn upsert_node(&self, node: &Node) -> Result<()>;

    async fn upsert_edge(&self, edge: &Edge) -> Result<()>;

    /// Delete `from`'s outgoing `rel` edges whose target is not in `keep`.
    /// Returns the number removed.
    async fn retain_edges(&self, rel: RelType, from: &str, keep: &[String]) -> Result<usize>;

    /// Delete nodes and every relationship touching them.
    async fn delete_nodes(&self, label: NodeLabel, ids: &[String]) -> Result<usize>;

    async fn node_ids(&self, label: NodeLabel) -> Result<Vec<String>>;

    async fn get_node(&self, label: NodeLabel, id: &str) -> Result<Option<Node>>;

    /// Nodes one hop from `(label, id)` over `rel`, sorted by id.
    async fn neighbors(
        &self,
        label: NodeLabel,
        id: &str,
        rel: RelType,
        direction: Direction,
    ) -> Result<Vec<Node>>;

    /// Nodes under `label` whose `key` property equals `value` (or, for
    /// array properties, contains it), sorted by id.
    async fn find_nodes(&self, label: NodeLabel, key: &str, value: &str) -> Result<Vec<Node>>;

    async fn count_nodes(&self, label: NodeLabel) -> Result<u64>;

    async fn count_edges(&self, rel: RelType) -> Result<u64>;
}
