//! Vector index abstraction.
//!
//! Points live in named collections (`chunks`, `clusters`) keyed by id and
//! carry a JSON payload. Search is brute-force cosine similarity, capped at
//! [`MAX_RESULT_LIMIT`] results.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::MAX_RESULT_LIMIT;
use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::graph::prop_matches;

pub use memory::InMemoryIndex;
pub use sqlite::SqliteIndex;

/// Collection holding one point per chunk.
pub const CHUNKS: &str = "chunks";
/// Collection holding one centroid per cluster.
pub const CLUSTERS: &str = "clusters";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    pub id: String,
    pub score: f32,
    pub payload: Map<String, Value>,
}

/// Restrict a search to points whose payload `key` matches `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFilter {
    pub key: String,
    pub value: String,
}

impl PayloadFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, payload: &Map<String, Value>) -> bool {
        payload
            .get(&self.key)
            .is_some_and(|v| prop_matches(v, &self.value))
    }
}

/// Score `candidates` against `query` and keep the best `k`, ties broken
/// by id.
pub(crate) fn rank<I>(
    candidates: I,
    query: &[f32],
    k: usize,
    filter: Option<&PayloadFilter>,
) -> Vec<Hit>
where
    I: IntoIterator<Item = Point>,
{
    let k = k.min(MAX_RESULT_LIMIT);
    let mut hits: Vec<Hit> = candidates
        .into_iter()
        .filter(|p| p.vector.len() == query.len())
        .filter(|p| filter.map_or(true, |f| f.matches(&p.payload)))
        .map(|p| Hit {
            score: cosine_similarity(query, &p.vector),
            id: p.id,
            payload: p.payload,
        })
        .collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(k);
    hits
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Insert or replace a point.
    async fn upsert(&self, collection: &str, point: &Point) -> Result<()>;

    /// Top `k` points by cosine similarity to `vector`.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<Hit>>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Point>>;

    /// All ids in a collection, sorted.
    async fn ids(&self, collection: &str) -> Result<Vec<String>>;

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize>;

    async fn count(&self, collection: &str) -> Result<u64>;
}
