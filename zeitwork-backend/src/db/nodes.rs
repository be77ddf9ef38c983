use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::{Node, NodeState};

const COLUMNS: &str = "id, organisation_id, region_id, hostname, private_address, state, \
     vcpus, memory_mib, created_at, updated_at, deleted_at";

/// List all nodes
pub async fn list(pool: &PgPool) -> Result<Vec<Node>> {
    let nodes = sqlx::query_as::<_, Node>(&format!(
        "SELECT {COLUMNS} FROM nodes WHERE deleted_at IS NULL ORDER BY id"
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list nodes")?;

    Ok(nodes)
}

/// Find node by UUID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Node>> {
    let node = sqlx::query_as::<_, Node>(&format!(
        "SELECT {COLUMNS} FROM nodes WHERE id = $1 AND deleted_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to find node by ID")?;

    Ok(node)
}

/// Register a node (operator-initiated)
pub async fn create(
    pool: &PgPool,
    organisation_id: Uuid,
    region_id: Uuid,
    hostname: &str,
    private_address: &str,
    vcpus: i32,
    memory_mib: i64,
) -> Result<Node> {
    let node = sqlx::query_as::<_, Node>(&format!(
        "INSERT INTO nodes \
             (id, organisation_id, region_id, hostname, private_address, state, vcpus, memory_mib) \
         VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7) \
         RETURNING {COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(organisation_id)
    .bind(region_id)
    .bind(hostname)
    .bind(private_address)
    .bind(vcpus)
    .bind(memory_mib)
    .fetch_one(pool)
    .await
    .context("Failed to create node")?;

    Ok(node)
}

/// Agent heartbeat: refresh the node's advertised facts and bump
/// `updated_at`. The first heartbeat moves a pending node to ready.
pub async fn heartbeat(
    pool: &PgPool,
    id: Uuid,
    hostname: &str,
    private_address: &str,
    vcpus: i32,
    memory_mib: i64,
) -> Result<Option<Node>> {
    let node = sqlx::query_as::<_, Node>(&format!(
        "UPDATE nodes \
         SET hostname = $2, private_address = $3, vcpus = $4, memory_mib = $5, \
             state = CASE WHEN state = 'pending' THEN 'ready' ELSE state END, \
             updated_at = NOW() \
         WHERE id = $1 AND deleted_at IS NULL \
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(hostname)
    .bind(private_address)
    .bind(vcpus)
    .bind(memory_mib)
    .fetch_optional(pool)
    .await
    .context("Failed to heartbeat node")?;

    Ok(node)
}

/// Operator-driven lifecycle change (ready, draining, gone)
pub async fn update_state(pool: &PgPool, id: Uuid, state: NodeState) -> Result<Option<Node>> {
    let node = sqlx::query_as::<_, Node>(&format!(
        "UPDATE nodes SET state = $2 WHERE id = $1 AND deleted_at IS NULL RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(state.to_string())
    .fetch_optional(pool)
    .await
    .context("Failed to update node state")?;

    Ok(node)
}

/// Soft-delete a node
pub async fn soft_delete(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE nodes SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to delete node")?;

    Ok(result.rows_affected() > 0)
}
