use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::{Deployment, DeploymentStatus};

const COLUMNS: &str = "id, organisation_id, project_id, environment_id, deployment_slug, \
     commit_sha, status, build_id, image_id, error_message, \
     created_at, updated_at, deleted_at";

/// Create a new deployment in `queued`
pub async fn create(
    pool: &PgPool,
    organisation_id: Uuid,
    project_id: Uuid,
    environment_id: Uuid,
    deployment_slug: &str,
    commit_sha: &str,
) -> Result<Deployment> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "INSERT INTO deployments \
             (id, organisation_id, project_id, environment_id, deployment_slug, commit_sha, status) \
         VALUES ($1, $2, $3, $4, $5, $6, 'queued') \
         RETURNING {COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(organisation_id)
    .bind(project_id)
    .bind(environment_id)
    .bind(deployment_slug)
    .bind(commit_sha)
    .fetch_one(pool)
    .await
    .context("Failed to create deployment")?;

    Ok(deployment)
}

/// Find deployment by UUID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Deployment>> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "SELECT {COLUMNS} FROM deployments WHERE id = $1 AND deleted_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to find deployment by ID")?;

    Ok(deployment)
}

/// Find deployment by its short human-readable slug
pub async fn find_by_slug(pool: &PgPool, slug: &str) -> Result<Option<Deployment>> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "SELECT {COLUMNS} FROM deployments WHERE deployment_slug = $1 AND deleted_at IS NULL"
    ))
    .bind(slug)
    .fetch_optional(pool)
    .await
    .context("Failed to find deployment by slug")?;

    Ok(deployment)
}

/// List deployments for a project, newest first
pub async fn list_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Deployment>> {
    let deployments = sqlx::query_as::<_, Deployment>(&format!(
        "SELECT {COLUMNS} FROM deployments \
         WHERE project_id = $1 AND deleted_at IS NULL \
         ORDER BY id DESC"
    ))
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("Failed to list deployments for project")?;

    Ok(deployments)
}

/// List all deployments in a given status
pub async fn find_by_status(pool: &PgPool, status: DeploymentStatus) -> Result<Vec<Deployment>> {
    let deployments = sqlx::query_as::<_, Deployment>(&format!(
        "SELECT {COLUMNS} FROM deployments \
         WHERE status = $1 AND deleted_at IS NULL \
         ORDER BY id"
    ))
    .bind(status.to_string())
    .fetch_all(pool)
    .await
    .context("Failed to list deployments by status")?;

    Ok(deployments)
}

/// Find a non-failed deployment for the same (project, commit, environment).
///
/// Used by the webhook path to make duplicate deliveries a no-op.
pub async fn find_duplicate(
    pool: &PgPool,
    project_id: Uuid,
    environment_id: Uuid,
    commit_sha: &str,
) -> Result<Option<Deployment>> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "SELECT {COLUMNS} FROM deployments \
         WHERE project_id = $1 AND environment_id = $2 AND commit_sha = $3 \
           AND status <> 'failed' AND deleted_at IS NULL \
         ORDER BY id DESC \
         LIMIT 1"
    ))
    .bind(project_id)
    .bind(environment_id)
    .bind(commit_sha)
    .fetch_optional(pool)
    .await
    .context("Failed to check for duplicate deployment")?;

    Ok(deployment)
}

/// Deployments waiting on a given build
pub async fn find_by_build(pool: &PgPool, build_id: Uuid) -> Result<Vec<Deployment>> {
    let deployments = sqlx::query_as::<_, Deployment>(&format!(
        "SELECT {COLUMNS} FROM deployments \
         WHERE build_id = $1 AND deleted_at IS NULL \
         ORDER BY id"
    ))
    .bind(build_id)
    .fetch_all(pool)
    .await
    .context("Failed to list deployments for build")?;

    Ok(deployments)
}

/// Conditionally transition a deployment between states.
///
/// Returns `None` when the row was no longer in `from` - a concurrent
/// reconciler got there first, which callers treat as success.
pub async fn transition(
    pool: &PgPool,
    id: Uuid,
    from: DeploymentStatus,
    to: DeploymentStatus,
) -> Result<Option<Deployment>> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "UPDATE deployments SET status = $3 \
         WHERE id = $1 AND status = $2 AND deleted_at IS NULL \
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(from.to_string())
    .bind(to.to_string())
    .fetch_optional(pool)
    .await
    .context("Failed to transition deployment status")?;

    Ok(deployment)
}

/// Link the build created for a queued deployment and move it to `building`
pub async fn set_build(pool: &PgPool, id: Uuid, build_id: Uuid) -> Result<Option<Deployment>> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "UPDATE deployments SET build_id = $2, status = 'building' \
         WHERE id = $1 AND status = 'queued' AND deleted_at IS NULL \
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(build_id)
    .fetch_optional(pool)
    .await
    .context("Failed to link build to deployment")?;

    Ok(deployment)
}

/// Record the image produced by the deployment's build
pub async fn set_image(pool: &PgPool, id: Uuid, image_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE deployments SET image_id = $2 \
         WHERE id = $1 AND image_id IS NULL AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(image_id)
    .execute(pool)
    .await
    .context("Failed to set deployment image")?;

    Ok(())
}

/// Mark a deployment as failed with a reason.
///
/// No-op when the deployment already reached a terminal state.
pub async fn mark_failed(pool: &PgPool, id: Uuid, error_message: &str) -> Result<Option<Deployment>> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "UPDATE deployments SET status = 'failed', error_message = $2 \
         WHERE id = $1 AND status NOT IN ('failed', 'inactive') AND deleted_at IS NULL \
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(error_message)
    .fetch_optional(pool)
    .await
    .context("Failed to mark deployment as failed")?;

    Ok(deployment)
}
