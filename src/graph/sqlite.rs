//! SQLite-backed [`GraphStore`].
//!
//! Nodes live in one `nodes` table keyed by `(label, id)` with JSON
//! properties; relationships in an `edges` table keyed by
//! `(rel, src, dst)`. Upserts map to `INSERT ... ON CONFLICT DO UPDATE`,
//! which gives the same merge-by-key semantics as a graph `MERGE`.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};

use super::{Direction, Edge, GraphStore, Node, NodeLabel, RelType};
use crate::db;
use crate::error::{Error, Result};
use crate::migrate;

pub struct SqliteGraph {
    pool: SqlitePool,
}

impl SqliteGraph {
    /// Open the database at `path`, creating the schema if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::migrate_graph(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let pool = db::connect_memory().await?;
        migrate::migrate_graph(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn exists(&self, label: NodeLabel, id: &str) -> Result<bool> {
        let found: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM nodes WHERE label = ? AND id = ?")
                .bind(label.as_str())
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(found)
    }
}

fn decode_props(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::Store(format!("node properties are not an object: {}", other))),
        Err(e) => Err(Error::Store(format!("node properties are not JSON: {}", e))),
    }
}

fn row_to_node(label: NodeLabel, row: &sqlx::sqlite::SqliteRow) -> Result<Node> {
    let id: String = row.get("id");
    let props: String = row.get("props");
    Ok(Node {
        label,
        id,
        props: decode_props(&props)?,
    })
}

#[async_trait]
impl GraphStore for SqliteGraph {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert_node(&self, node: &Node) -> Result<()> {
        let props = serde_json::to_string(&node.props)?;
        sqlx::query(
            r#"
            INSERT INTO nodes (label, id, props, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(label, id) DO UPDATE SET
                props = excluded.props,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(node.label.as_str())
        .bind(&node.id)
        .bind(props)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_edge(&self, edge: &Edge) -> Result<()> {
        let (from_label, to_label) = edge.rel.endpoints();
        if !self.exists(from_label, &edge.from).await? {
            return Err(edge.dangling(true));
        }
        if !self.exists(to_label, &edge.to).await? {
            return Err(edge.dangling(false));
        }
        sqlx::query("INSERT OR IGNORE INTO edges (rel, src, dst) VALUES (?, ?, ?)")
            .bind(edge.rel.as_str())
            .bind(&edge.from)
            .bind(&edge.to)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retain_edges(&self, rel: RelType, from: &str, keep: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let targets: Vec<String> =
            sqlx::query_scalar("SELECT dst FROM edges WHERE rel = ? AND src = ?")
                .bind(rel.as_str())
                .bind(from)
                .fetch_all(&mut *tx)
                .await?;
        let mut removed = 0;
        for dst in targets.iter().filter(|t| !keep.contains(t)) {
            sqlx::query("DELETE FROM edges WHERE rel = ? AND src = ? AND dst = ?")
                .bind(rel.as_str())
                .bind(from)
                .bind(dst)
                .execute(&mut *tx)
                .await?;
            removed += 1;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn delete_nodes(&self, label: NodeLabel, ids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            for rel in RelType::ALL {
                let (fl, tl) = rel.endpoints();
                if fl == label {
                    sqlx::query("DELETE FROM edges WHERE rel = ? AND src = ?")
                        .bind(rel.as_str())
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                if tl == label {
                    sqlx::query("DELETE FROM edges WHERE rel = ? AND dst = ?")
                        .bind(rel.as_str())
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            let result = sqlx::query("DELETE FROM nodes WHERE label = ? AND id = ?")
                .bind(label.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn node_ids(&self, label: NodeLabel) -> Result<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM nodes WHERE label = ? ORDER BY id")
                .bind(label.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    async fn get_node(&self, label: NodeLabel, id: &str) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT id, props FROM nodes WHERE label = ? AND id = ?")
            .bind(label.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_node(label, &r)).transpose()
    }

    async fn neighbors(
        &self,
        label: NodeLabel,
        id: &str,
        rel: RelType,
        direction: Direction,
    ) -> Result<Vec<Node>> {
        let (from_label, to_label) = rel.endpoints();
        let (anchor, other, sql) = match direction {
            Direction::Outgoing => (
                from_label,
                to_label,
                "SELECT n.id, n.props FROM edges e JOIN nodes n ON n.label = ? AND n.id = e.dst \
                 WHERE e.rel = ? AND e.src = ? ORDER BY n.id",
            ),
            Direction::Incoming => (
                to_label,
                from_label,
                "SELECT n.id, n.props FROM edges e JOIN nodes n ON n.label = ? AND n.id = e.src \
                 WHERE e.rel = ? AND e.dst = ? ORDER BY n.id",
            ),
        };
        if anchor != label {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(sql)
            .bind(other.as_str())
            .bind(rel.as_str())
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| row_to_node(other, r)).collect()
    }

    async fn find_nodes(&self, label: NodeLabel, key: &str, value: &str) -> Result<Vec<Node>> {
        // json_each over a scalar yields the scalar itself, over an array
        // its elements.
        let rows = sqlx::query(
            r#"
            SELECT id, props FROM nodes
            WHERE label = ?
              AND EXISTS (
                  SELECT 1 FROM json_each(nodes.props, ?)
                  WHERE CAST(json_each.value AS TEXT) = ?
              )
            ORDER BY id
            "#,
        )
        .bind(label.as_str())
        .bind(format!("$.{}", key))
        .bind(value)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| row_to_node(label, r)).collect()
    }

    async fn count_nodes(&self, label: NodeLabel) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes WHERE label = ?")
            .bind(label.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn count_edges(&self, rel: RelType) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edges WHERE rel = ?")
            .bind(rel.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
