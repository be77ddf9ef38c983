use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::Environment;

const COLUMNS: &str =
    "id, organisation_id, project_id, name, branch, created_at, updated_at, deleted_at";

/// Find environment by UUID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Environment>> {
    let environment = sqlx::query_as::<_, Environment>(&format!(
        "SELECT {COLUMNS} FROM environments WHERE id = $1 AND deleted_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to find environment by ID")?;

    Ok(environment)
}

/// Find the environment a branch deploys to within a project
pub async fn find_for_branch(
    pool: &PgPool,
    project_id: Uuid,
    branch: &str,
) -> Result<Option<Environment>> {
    let environment = sqlx::query_as::<_, Environment>(&format!(
        "SELECT {COLUMNS} FROM environments \
         WHERE project_id = $1 AND branch = $2 AND deleted_at IS NULL"
    ))
    .bind(project_id)
    .bind(branch)
    .fetch_optional(pool)
    .await
    .context("Failed to find environment for branch")?;

    Ok(environment)
}

/// Create an environment, or return the existing one with the same name
pub async fn ensure(
    pool: &PgPool,
    organisation_id: Uuid,
    project_id: Uuid,
    name: &str,
    branch: &str,
) -> Result<Environment> {
    let environment = sqlx::query_as::<_, Environment>(&format!(
        "INSERT INTO environments (id, organisation_id, project_id, name, branch) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (project_id, name) DO UPDATE SET branch = EXCLUDED.branch \
         RETURNING {COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(organisation_id)
    .bind(project_id)
    .bind(name)
    .bind(branch)
    .fetch_one(pool)
    .await
    .context("Failed to ensure environment")?;

    Ok(environment)
}
