//! In-memory [`VectorIndex`].

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{rank, Hit, PayloadFilter, Point, VectorIndex};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct InMemoryIndex {
    collections: RwLock<HashMap<String, BTreeMap<String, Point>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, collection: &str, point: &Point) -> Result<()> {
        if point.vector.is_empty() {
            return Err(Error::Store(format!("empty vector for point {}", point.id)));
        }
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(point.id.clone(), point.clone());
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<Hit>> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        let Some(points) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(rank(points.values().cloned(), vector, k, filter))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Point>> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn ids(&self, collection: &str) -> Result<Vec<String>> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        Ok(collections
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize> {
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        let Some(points) = collections.get_mut(collection) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| points.remove(*id).is_some()).count())
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        Ok(collections.get(collection).map_or(0, |c| c.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{CHUNKS, CLUSTERS};
    use serde_json::Map;

    fn point(id: &str, v: Vec<f32>) -> Point {
        Point {
            id: id.into(),
            vector: v,
            payload: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_upsert_twice_keeps_one_point() {
        let index = InMemoryIndex::new();
        index.upsert(CHUNKS, &point("c1", vec![1.0, 0.0])).await.unwrap();
        index.upsert(CHUNKS, &point("c1", vec![0.0, 1.0])).await.unwrap();
        assert_eq!(index.count(CHUNKS).await.unwrap(), 1);
        let stored = index.get(CHUNKS, "c1").await.unwrap().unwrap();
        assert_eq!(stored.vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_collections_are_separate() {
        let index = InMemoryIndex::new();
        index.upsert(CHUNKS, &point("1", vec![1.0])).await.unwrap();
        index.upsert(CLUSTERS, &point("1", vec![1.0])).await.unwrap();
        index.delete(CLUSTERS, &["1".to_string()]).await.unwrap();
        assert_eq!(index.ids(CHUNKS).await.unwrap(), vec!["1"]);
        assert!(index.ids(CLUSTERS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_empty_vector() {
        let index = InMemoryIndex::new();
        assert!(index.upsert(CHUNKS, &point("c", vec![])).await.is_err());
    }
}
