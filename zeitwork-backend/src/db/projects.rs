use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::Project;

const COLUMNS: &str = "id, organisation_id, name, slug, repository, default_branch, \
     root_directory, dockerfile_path, created_at, updated_at, deleted_at";

/// List projects for an organisation
pub async fn list(pool: &PgPool, organisation_id: Uuid) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(&format!(
        "SELECT {COLUMNS} FROM projects \
         WHERE organisation_id = $1 AND deleted_at IS NULL \
         ORDER BY name"
    ))
    .bind(organisation_id)
    .fetch_all(pool)
    .await
    .context("Failed to list projects")?;

    Ok(projects)
}

/// Find project by UUID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>(&format!(
        "SELECT {COLUMNS} FROM projects WHERE id = $1 AND deleted_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to find project by ID")?;

    Ok(project)
}

/// Find project by its Git repository (e.g. `acme/web`)
pub async fn find_by_repository(pool: &PgPool, repository: &str) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>(&format!(
        "SELECT {COLUMNS} FROM projects WHERE repository = $1 AND deleted_at IS NULL"
    ))
    .bind(repository)
    .fetch_optional(pool)
    .await
    .context("Failed to find project by repository")?;

    Ok(project)
}

/// Create a new project
#[allow(clippy::too_many_arguments)]
pub async fn create(
    pool: &PgPool,
    organisation_id: Uuid,
    name: &str,
    slug: &str,
    repository: &str,
    default_branch: &str,
    root_directory: Option<&str>,
    dockerfile_path: Option<&str>,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(&format!(
        "INSERT INTO projects \
             (id, organisation_id, name, slug, repository, default_branch, root_directory, dockerfile_path) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING {COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(organisation_id)
    .bind(name)
    .bind(slug)
    .bind(repository)
    .bind(default_branch)
    .bind(root_directory)
    .bind(dockerfile_path)
    .fetch_one(pool)
    .await
    .context("Failed to create project")?;

    Ok(project)
}
