//! SQLite-backed [`VectorIndex`].
//!
//! Vectors are stored as little-endian `f32` blobs in a single `points`
//! table; search loads the collection and ranks it in process.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};

use super::{rank, Hit, PayloadFilter, Point, VectorIndex};
use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};
use crate::migrate;

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::migrate_vectors(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let pool = db::connect_memory().await?;
        migrate::migrate_vectors(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_point(row: &sqlx::sqlite::SqliteRow) -> Result<Point> {
    let blob: Vec<u8> = row.get("vector");
    let payload: String = row.get("payload");
    let payload = match serde_json::from_str::<Value>(&payload) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            return Err(Error::Store(format!(
                "payload for point {} is not a JSON object",
                row.get::<String, _>("id")
            )))
        }
    };
    Ok(Point {
        id: row.get("id"),
        vector: blob_to_vec(&blob),
        payload,
    })
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, collection: &str, point: &Point) -> Result<()> {
        if point.vector.is_empty() {
            return Err(Error::Store(format!("empty vector for point {}", point.id)));
        }
        sqlx::query(
            r#"
            INSERT INTO points (collection, id, dims, vector, payload, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                dims = excluded.dims,
                vector = excluded.vector,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(&point.id)
        .bind(point.vector.len() as i64)
        .bind(vec_to_blob(&point.vector))
        .bind(serde_json::to_string(&point.payload)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<Hit>> {
        let rows = sqlx::query(
            "SELECT id, vector, payload FROM points WHERE collection = ? AND dims = ?",
        )
        .bind(collection)
        .bind(vector.len() as i64)
        .fetch_all(&self.pool)
        .await?;
        let points = rows.iter().map(row_to_point).collect::<Result<Vec<_>>>()?;
        Ok(rank(points, vector, k, filter))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Point>> {
        let row = sqlx::query(
            "SELECT id, vector, payload FROM points WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_point).transpose()
    }

    async fn ids(&self, collection: &str) -> Result<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM points WHERE collection = ? ORDER BY id")
                .bind(collection)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM points WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM points WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::CHUNKS;
    use serde_json::json;

    fn point(id: &str, v: Vec<f32>, tag: &str) -> Point {
        let mut payload = Map::new();
        payload.insert("tags".into(), json!([tag]));
        Point {
            id: id.into(),
            vector: v,
            payload,
        }
    }

    #[tokio::test]
    async fn test_search_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let index = SqliteIndex::open(&dir.path().join("vectors.sqlite")).await.unwrap();
        index.upsert(CHUNKS, &point("near", vec![0.9, 0.1], "#a")).await.unwrap();
        index.upsert(CHUNKS, &point("far", vec![0.0, 1.0], "#b")).await.unwrap();
        index.upsert(CHUNKS, &point("near", vec![1.0, 0.0], "#a")).await.unwrap();

        assert_eq!(index.count(CHUNKS).await.unwrap(), 2);
        let hits = index.search(CHUNKS, &[1.0, 0.0], 5, None).await.unwrap();
        assert_eq!(hits[0].id, "near");
        assert!((hits[0].score - 1.0).abs() < 1e-6);

        let filter = PayloadFilter::new("tags", "#b");
        let hits = index.search(CHUNKS, &[1.0, 0.0], 5, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "far");
    }

    #[tokio::test]
    async fn test_get_delete_ids() {
        let index = SqliteIndex::open_in_memory().await.unwrap();
        index.upsert(CHUNKS, &point("b", vec![1.0], "#x")).await.unwrap();
        index.upsert(CHUNKS, &point("a", vec![1.0], "#x")).await.unwrap();
        assert_eq!(index.ids(CHUNKS).await.unwrap(), vec!["a", "b"]);
        let got = index.get(CHUNKS, "a").await.unwrap().unwrap();
        assert_eq!(got.vector, vec![1.0]);
        assert_eq!(index.delete(CHUNKS, &["a".to_string()]).await.unwrap(), 1);
        assert!(index.get(CHUNKS, "a").await.unwrap().is_none());
    }
}
