use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::Image;

const COLUMNS: &str =
    "id, organisation_id, registry, repository, tag, digest, created_at, updated_at, deleted_at";

/// Find image by UUID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Image>> {
    let image = sqlx::query_as::<_, Image>(&format!(
        "SELECT {COLUMNS} FROM images WHERE id = $1 AND deleted_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to find image by ID")?;

    Ok(image)
}

/// Register an externally produced image.
///
/// Idempotent on the full `(registry, repository, tag, digest)` identity.
pub async fn insert(
    pool: &PgPool,
    organisation_id: Uuid,
    registry: &str,
    repository: &str,
    tag: &str,
    digest: &str,
) -> Result<Image> {
    let image = sqlx::query_as::<_, Image>(&format!(
        "INSERT INTO images (id, organisation_id, registry, repository, tag, digest) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (registry, repository, tag, digest) \
             DO UPDATE SET updated_at = NOW() \
         RETURNING {COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(organisation_id)
    .bind(registry)
    .bind(repository)
    .bind(tag)
    .bind(digest)
    .fetch_one(pool)
    .await
    .context("Failed to insert image")?;

    Ok(image)
}
