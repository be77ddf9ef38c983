use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::Region;

const COLUMNS: &str = "id, organisation_id, name, ordinal, load_balancer_ipv4, \
     created_at, updated_at, deleted_at";

/// List regions ordered by their stable ordinal
pub async fn list(pool: &PgPool) -> Result<Vec<Region>> {
    let regions = sqlx::query_as::<_, Region>(&format!(
        "SELECT {COLUMNS} FROM regions WHERE deleted_at IS NULL ORDER BY ordinal"
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list regions")?;

    Ok(regions)
}

/// Find region by UUID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Region>> {
    let region = sqlx::query_as::<_, Region>(&format!(
        "SELECT {COLUMNS} FROM regions WHERE id = $1 AND deleted_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to find region by ID")?;

    Ok(region)
}

/// Find region by name within an organisation
pub async fn find_by_name(
    pool: &PgPool,
    organisation_id: Uuid,
    name: &str,
) -> Result<Option<Region>> {
    let region = sqlx::query_as::<_, Region>(&format!(
        "SELECT {COLUMNS} FROM regions \
         WHERE organisation_id = $1 AND name = $2 AND deleted_at IS NULL"
    ))
    .bind(organisation_id)
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("Failed to find region by name")?;

    Ok(region)
}
