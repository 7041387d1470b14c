//! Retrieval façade over the two stores.
//!
//! [`RetrievalFacade::similar`] is vector-first: embed the query, take the
//! nearest chunks, then walk the graph for each hit's message, conversation,
//! tags and cluster. [`RetrievalFacade::filter`] is graph-first with
//! deterministic id ordering and paging. Every size parameter is capped at
//! [`MAX_RESULT_LIMIT`]; zero means "use the configured default".

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{RetrievalConfig, MAX_RESULT_LIMIT};
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::enrich::parse::normalize_tags;
use crate::error::Result;
use crate::graph::{Direction, GraphStore, Node, NodeLabel, RelType};
use crate::vector::{self, VectorIndex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Tag(String),
    Domain(String),
    Cluster(i64),
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRef {
    pub id: String,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationRef {
    pub id: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterRef {
    pub id: String,
    pub top_terms: Vec<String>,
}

/// A chunk with its graph neighbourhood.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    pub id: String,
    pub text: String,
    pub domain: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub message: Option<MessageRef>,
    pub conversation: Option<ConversationRef>,
    pub cluster: Option<ClusterRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarHit {
    pub score: f32,
    pub chunk: ChunkView,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

fn str_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Clamp a caller-supplied size: 0 means `default`, never above the cap.
pub fn effective_limit(requested: usize, default: usize) -> usize {
    let n = if requested == 0 { default } else { requested };
    n.clamp(1, MAX_RESULT_LIMIT)
}

pub struct RetrievalFacade {
    graph: Arc<dyn GraphStore>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

impl RetrievalFacade {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            graph,
            vectors,
            embedder,
            config,
        }
    }

    /// Nearest chunks to `query`, each expanded through the graph.
    pub async fn similar(&self, query: &str, limit: usize) -> Result<Vec<SimilarHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let k = effective_limit(limit, self.config.default_limit);
        let vector = embed_query(self.embedder.as_ref(), query).await?;
        let hits = self.vectors.search(vector::CHUNKS, &vector, k, None).await?;

        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let node = match self.graph.get_node(NodeLabel::Chunk, &hit.id).await? {
                Some(node) => node,
                None => {
                    debug!(id = %hit.id, "vector hit has no graph node, using payload");
                    Node::new(NodeLabel::Chunk, hit.id.clone()).with_props(hit.payload)
                }
            };
            out.push(SimilarHit {
                score: hit.score,
                chunk: self.expand(node).await?,
            });
        }
        Ok(out)
    }

    /// Chunks matching `filter`, ordered by id, one page at a time.
    /// Pages are numbered from 1; page 0 is treated as 1.
    pub async fn filter(
        &self,
        filter: &Filter,
        page: usize,
        page_size: usize,
    ) -> Result<Page<ChunkView>> {
        let page = page.max(1);
        let page_size = effective_limit(page_size, self.config.page_size);

        let mut nodes = match filter {
            Filter::Tag(tag) => {
                let Some(tag) = normalize_tags(&[tag.clone()]).into_iter().next() else {
                    return Ok(Page {
                        items: Vec::new(),
                        page,
                        page_size,
                        total: 0,
                    });
                };
                self.graph
                    .neighbors(NodeLabel::Tag, &tag, RelType::Tagged, Direction::Incoming)
                    .await?
            }
            Filter::Domain(domain) => {
                self.graph
                    .find_nodes(NodeLabel::Chunk, "domain", &domain.to_lowercase())
                    .await?
            }
            Filter::Cluster(id) => {
                self.graph
                    .neighbors(
                        NodeLabel::Cluster,
                        &id.to_string(),
                        RelType::InCluster,
                        Direction::Incoming,
                    )
                    .await?
            }
        };
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let total = nodes.len();
        let start = (page - 1).saturating_mul(page_size).min(total);
        let end = (start + page_size).min(total);
        let mut items = Vec::with_capacity(end - start);
        for node in nodes.drain(start..end) {
            items.push(self.expand(node).await?);
        }
        Ok(Page {
            items,
            page,
            page_size,
            total,
        })
    }

    async fn first_neighbor(
        &self,
        label: NodeLabel,
        id: &str,
        rel: RelType,
        dir: Direction,
    ) -> Result<Option<Node>> {
        Ok(self.graph.neighbors(label, id, rel, dir).await?.into_iter().next())
    }

    async fn expand(&self, node: Node) -> Result<ChunkView> {
        let message = self
            .first_neighbor(NodeLabel::Chunk, &node.id, RelType::PartOf, Direction::Outgoing)
            .await?;
        let conversation = match &message {
            Some(m) => {
                self.first_neighbor(
                    NodeLabel::Message,
                    &m.id,
                    RelType::HasMessage,
                    Direction::Incoming,
                )
                .await?
            }
            None => None,
        };
        let tags: Vec<String> = self
            .graph
            .neighbors(NodeLabel::Chunk, &node.id, RelType::Tagged, Direction::Outgoing)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let cluster = self
            .first_neighbor(NodeLabel::Chunk, &node.id, RelType::InCluster, Direction::Outgoing)
            .await?;

        Ok(ChunkView {
            text: node.str_prop("text").unwrap_or_default().to_string(),
            domain: node.str_prop("domain").map(str::to_string),
            category: node.str_prop("category").map(str::to_string),
            tags: if tags.is_empty() {
                str_list(node.prop("tags"))
            } else {
                tags
            },
            message: message.map(|m| MessageRef {
                role: m.str_prop("role").map(str::to_string),
                id: m.id,
            }),
            conversation: conversation.map(|c| ConversationRef {
                title: c.str_prop("title").map(str::to_string),
                id: c.id,
            }),
            cluster: cluster.map(|c| ClusterRef {
                top_terms: str_list(c.prop("top_terms")),
                id: c.id,
            }),
            id: node.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use crate::graph::{Edge, InMemoryGraph};
    use crate::vector::{InMemoryIndex, Point};
    use serde_json::{json, Map};

    fn props(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    async fn seeded() -> RetrievalFacade {
        let graph = Arc::new(InMemoryGraph::new());
        let index = Arc::new(InMemoryIndex::new());
        let embedder = Arc::new(HashingProvider::new(64));

        let conversation = Node::new(NodeLabel::Conversation, "conv")
            .with_props(props(&[("title", json!("Rust help"))]));
        graph.upsert_node(&conversation).await.unwrap();
        let message =
            Node::new(NodeLabel::Message, "m1").with_props(props(&[("role", json!("user"))]));
        graph.upsert_node(&message).await.unwrap();
        graph.upsert_edge(&Edge::new(RelType::HasMessage, "conv", "m1")).await.unwrap();
        let cluster = Node::new(NodeLabel::Cluster, "0")
            .with_props(props(&[("top_terms", json!(["borrow"]))]));
        graph.upsert_node(&cluster).await.unwrap();
        graph.upsert_node(&Node::new(NodeLabel::Tag, "#rust")).await.unwrap();

        for i in 0..12 {
            let id = format!("c{:02}", i);
            let text = if i % 2 == 0 {
                format!("borrow checker lifetimes {}", i)
            } else {
                format!("sourdough bread starter {}", i)
            };
            let domain = if i % 2 == 0 { "programming" } else { "cooking" };
            let node_props = props(&[("text", json!(text)), ("domain", json!(domain))]);
            let chunk = Node::new(NodeLabel::Chunk, id.clone()).with_props(node_props.clone());
            graph.upsert_node(&chunk).await.unwrap();
            graph.upsert_edge(&Edge::new(RelType::PartOf, id.clone(), "m1")).await.unwrap();
            if i % 2 == 0 {
                graph.upsert_edge(&Edge::new(RelType::Tagged, id.clone(), "#rust")).await.unwrap();
                graph.upsert_edge(&Edge::new(RelType::InCluster, id.clone(), "0")).await.unwrap();
            }
            index
                .upsert(
                    vector::CHUNKS,
                    &Point {
                        id,
                        vector: embedder.embed_one(&text),
                        payload: node_props,
                    },
                )
                .await
                .unwrap();
        }

        RetrievalFacade::new(graph, index, embedder, RetrievalConfig::default())
    }

    #[tokio::test]
    async fn test_similar_expands_through_graph() {
        let facade = seeded().await;
        let hits = facade.similar("borrow checker lifetimes", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        let top = &hits[0].chunk;
        assert_eq!(top.domain.as_deref(), Some("programming"));
        assert_eq!(top.tags, vec!["#rust"]);
        assert_eq!(top.message.as_ref().unwrap().role.as_deref(), Some("user"));
        assert_eq!(top.conversation.as_ref().unwrap().title.as_deref(), Some("Rust help"));
        assert_eq!(top.cluster.as_ref().unwrap().top_terms, vec!["borrow"]);
    }

    #[tokio::test]
    async fn test_zero_limit_uses_default_and_cap_applies() {
        let facade = seeded().await;
        assert_eq!(facade.similar("bread", 0).await.unwrap().len(), 10);
        assert_eq!(effective_limit(10_000, 10), MAX_RESULT_LIMIT);
        assert!(facade.similar("   ", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filter_pages_deterministically() {
        let facade = seeded().await;
        let first = facade.filter(&Filter::Tag("Rust".into()), 1, 4).await.unwrap();
        assert_eq!(first.total, 6);
        let ids: Vec<&str> = first.items.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c00", "c02", "c04", "c06"]);

        let second = facade.filter(&Filter::Tag("#rust".into()), 2, 4).await.unwrap();
        assert_eq!(second.items.len(), 2);

        let past_end = facade.filter(&Filter::Tag("#rust".into()), 9, 4).await.unwrap();
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 6);
    }

    #[tokio::test]
    async fn test_filter_by_domain_and_cluster() {
        let facade = seeded().await;
        let cooking = facade.filter(&Filter::Domain("Cooking".into()), 0, 0).await.unwrap();
        assert_eq!(cooking.total, 6);
        assert_eq!(cooking.page, 1);
        assert_eq!(cooking.page_size, 50);

        let cluster = facade.filter(&Filter::Cluster(0), 1, 100).await.unwrap();
        assert_eq!(cluster.total, 6);
        assert!(facade.filter(&Filter::Cluster(7), 1, 10).await.unwrap().items.is_empty());
    }
}
