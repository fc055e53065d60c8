use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{NewNodeRecord, NodeStore, NodeWriteRepo, RepoError};
use crate::domain::node::{Node, NodeId};

use super::PostgresNodeStore;
use super::util::{like_prefix, map_sqlx_error};

const NODE_COLUMNS: &str = "id, parent_id, name, position, depth, path, active, deleted_at";

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: i64,
    parent_id: Option<i64>,
    name: String,
    position: i32,
    depth: i32,
    path: String,
    active: bool,
    deleted_at: Option<OffsetDateTime>,
}

impl From<NodeRow> for Node {
    fn from(row: NodeRow) -> Self {
        Self {
            id: row.id,
            parent_id: row.parent_id,
            name: row.name,
            position: row.position,
            depth: row.depth,
            path: row.path,
            active: row.active,
            deleted_at: row.deleted_at,
        }
    }
}

fn into_nodes(rows: Vec<NodeRow>) -> Vec<Node> {
    rows.into_iter().map(Node::from).collect()
}

#[async_trait]
impl NodeStore for PostgresNodeStore {
    async fn get_by_id(&self, id: NodeId) -> Result<Option<Node>, RepoError> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM categories WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(Node::from))
    }

    async fn get_many(&self, ids: &[NodeId]) -> Result<Vec<Node>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM categories WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(into_nodes(rows))
    }

    async fn get_children(&self, parent_id: Option<NodeId>) -> Result<Vec<Node>, RepoError> {
        let rows = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM categories \
             WHERE parent_id IS NOT DISTINCT FROM $1 AND deleted_at IS NULL \
             ORDER BY position, id"
        ))
        .bind(parent_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(into_nodes(rows))
    }

    async fn get_by_path_prefix(&self, prefix: &str) -> Result<Vec<Node>, RepoError> {
        let rows = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM categories \
             WHERE path LIKE $1 AND deleted_at IS NULL \
             ORDER BY depth, position, id"
        ))
        .bind(like_prefix(prefix))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(into_nodes(rows))
    }

    async fn get_subtree(&self, prefix: &str) -> Result<Vec<Node>, RepoError> {
        let rows = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM categories \
             WHERE path LIKE $1 \
             ORDER BY depth, position, id"
        ))
        .bind(like_prefix(prefix))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(into_nodes(rows))
    }

    async fn list_nodes(&self, active_only: bool) -> Result<Vec<Node>, RepoError> {
        let rows = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM categories \
             WHERE deleted_at IS NULL AND (active OR NOT $1) \
             ORDER BY depth, position, id"
        ))
        .bind(active_only)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(into_nodes(rows))
    }
}

#[async_trait]
impl NodeWriteRepo for PostgresNodeStore {
    async fn insert_node(&self, record: NewNodeRecord) -> Result<Node, RepoError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_error)?;

        let id = match record.id {
            Some(id) => id,
            None => sqlx::query_scalar::<_, i64>(
                "SELECT nextval(pg_get_serial_sequence('categories', 'id'))",
            )
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?,
        };

        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "INSERT INTO categories (id, parent_id, name, position, depth, path, active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {NODE_COLUMNS}"
        ))
        .bind(id)
        .bind(record.parent_id)
        .bind(&record.name)
        .bind(record.position)
        .bind(record.depth)
        .bind(format!("{}/{id}", record.path_prefix))
        .bind(record.active)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match map_sqlx_error(err) {
            RepoError::Integrity { message } if message.starts_with("duplicate key") => {
                RepoError::Duplicate { id }
            }
            other => other,
        })?;

        if record.id.is_some() {
            // Keep later store-assigned ids clear of explicitly chosen ones.
            sqlx::query(
                "SELECT setval(pg_get_serial_sequence('categories', 'id'), \
                 GREATEST((SELECT MAX(id) FROM categories), 1))",
            )
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(row.into())
    }

    async fn update_node(&self, node: Node) -> Result<Node, RepoError> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "UPDATE categories SET name = $2, active = $3 WHERE id = $1 \
             RETURNING {NODE_COLUMNS}"
        ))
        .bind(node.id)
        .bind(&node.name)
        .bind(node.active)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }

    async fn save_nodes(&self, nodes: Vec<Node>) -> Result<(), RepoError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_error)?;

        for node in &nodes {
            let updated = sqlx::query(
                "UPDATE categories \
                 SET parent_id = $2, position = $3, depth = $4, path = $5 \
                 WHERE id = $1",
            )
            .bind(node.id)
            .bind(node.parent_id)
            .bind(node.position)
            .bind(node.depth)
            .bind(&node.path)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            if updated.rows_affected() == 0 {
                return Err(RepoError::integrity(format!(
                    "category `{}` vanished during save",
                    node.id
                )));
            }
        }

        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn soft_delete(&self, id: NodeId) -> Result<Node, RepoError> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "UPDATE categories SET deleted_at = COALESCE(deleted_at, now()) WHERE id = $1 \
             RETURNING {NODE_COLUMNS}"
        ))
        .bind(id)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }

    async fn restore(&self, id: NodeId) -> Result<Node, RepoError> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "UPDATE categories SET deleted_at = NULL WHERE id = $1 RETURNING {NODE_COLUMNS}"
        ))
        .bind(id)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }

    async fn force_delete(&self, id: NodeId) -> Result<Node, RepoError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_error)?;

        let path = sqlx::query_scalar::<_, String>("SELECT path FROM categories WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(RepoError::NotFound)?;

        sqlx::query("DELETE FROM categories WHERE path LIKE $1 AND deleted_at IS NOT NULL")
            .bind(like_prefix(&format!("{path}/")))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "DELETE FROM categories WHERE id = $1 RETURNING {NODE_COLUMNS}"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(row.into())
    }
}
