use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::{Build, BuildStatus, Image};

const COLUMNS: &str = "id, organisation_id, project_id, repository, commit_sha, \
     root_directory, dockerfile_path, status, image_id, vm_id, error_message, \
     created_at, updated_at, deleted_at";

/// Queue a new build
pub async fn create(
    pool: &PgPool,
    organisation_id: Uuid,
    project_id: Uuid,
    repository: &str,
    commit_sha: &str,
    root_directory: Option<&str>,
    dockerfile_path: Option<&str>,
) -> Result<Build> {
    let build = sqlx::query_as::<_, Build>(&format!(
        "INSERT INTO builds \
             (id, organisation_id, project_id, repository, commit_sha, root_directory, dockerfile_path, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, 'queued') \
         RETURNING {COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(organisation_id)
    .bind(project_id)
    .bind(repository)
    .bind(commit_sha)
    .bind(root_directory)
    .bind(dockerfile_path)
    .fetch_one(pool)
    .await
    .context("Failed to create build")?;

    Ok(build)
}

/// Find build by UUID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Build>> {
    let build = sqlx::query_as::<_, Build>(&format!(
        "SELECT {COLUMNS} FROM builds WHERE id = $1 AND deleted_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to find build by ID")?;

    Ok(build)
}

/// Atomically claim the oldest queued build for a worker.
///
/// The conditional update is the claim: losing the race returns `None` and
/// the worker sleeps until the next poll.
pub async fn claim_next(pool: &PgPool, worker_id: &str) -> Result<Option<Build>> {
    let build = sqlx::query_as::<_, Build>(&format!(
        "UPDATE builds SET status = 'initializing', vm_id = $1 \
         WHERE id = ( \
             SELECT id FROM builds \
             WHERE status = 'queued' AND deleted_at IS NULL \
             ORDER BY id \
             FOR UPDATE SKIP LOCKED \
             LIMIT 1 \
         ) AND status = 'queued' \
         RETURNING {COLUMNS}"
    ))
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .context("Failed to claim build")?;

    Ok(build)
}

/// Conditionally transition a build between states
pub async fn transition(
    pool: &PgPool,
    id: Uuid,
    from: BuildStatus,
    to: BuildStatus,
) -> Result<Option<Build>> {
    let build = sqlx::query_as::<_, Build>(&format!(
        "UPDATE builds SET status = $3 \
         WHERE id = $1 AND status = $2 AND deleted_at IS NULL \
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(from.to_string())
    .bind(to.to_string())
    .fetch_optional(pool)
    .await
    .context("Failed to transition build status")?;

    Ok(build)
}

/// Record a successful build: insert the image row and flip the build to
/// `ready` in one transaction.
///
/// The image insert is idempotent on `(registry, repository, tag, digest)`,
/// so a duplicate build of the same commit publishes the same digest.
pub async fn complete(
    pool: &PgPool,
    build_id: Uuid,
    organisation_id: Uuid,
    registry: &str,
    repository: &str,
    tag: &str,
    digest: &str,
) -> Result<Image> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let image = sqlx::query_as::<_, Image>(
        "INSERT INTO images (id, organisation_id, registry, repository, tag, digest) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (registry, repository, tag, digest) \
             DO UPDATE SET updated_at = NOW() \
         RETURNING id, organisation_id, registry, repository, tag, digest, \
                   created_at, updated_at, deleted_at",
    )
    .bind(Uuid::now_v7())
    .bind(organisation_id)
    .bind(registry)
    .bind(repository)
    .bind(tag)
    .bind(digest)
    .fetch_one(&mut *tx)
    .await
    .context("Failed to insert image")?;

    sqlx::query(
        "UPDATE builds SET status = 'ready', image_id = $2 \
         WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(build_id)
    .bind(image.id)
    .execute(&mut *tx)
    .await
    .context("Failed to mark build ready")?;

    tx.commit().await.context("Failed to commit build completion")?;

    Ok(image)
}

/// Mark a build as errored with a reason
pub async fn mark_error(pool: &PgPool, id: Uuid, error_message: &str) -> Result<()> {
    sqlx::query(
        "UPDATE builds SET status = 'error', error_message = $2 \
         WHERE id = $1 AND status NOT IN ('ready', 'canceled', 'error') AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(error_message)
    .execute(pool)
    .await
    .context("Failed to mark build as errored")?;

    Ok(())
}

/// Fail builds that have not made progress for longer than the timeout.
///
/// Returns the builds that were flipped so the caller can fail dependent
/// deployments.
pub async fn fail_stale(pool: &PgPool, timeout_secs: i64) -> Result<Vec<Build>> {
    let builds = sqlx::query_as::<_, Build>(&format!(
        "UPDATE builds \
         SET status = 'error', error_message = 'build timed out' \
         WHERE status IN ('queued', 'initializing', 'building') \
           AND updated_at < NOW() - make_interval(secs => $1) \
           AND deleted_at IS NULL \
         RETURNING {COLUMNS}"
    ))
    .bind(timeout_secs as f64)
    .fetch_all(pool)
    .await
    .context("Failed to fail stale builds")?;

    Ok(builds)
}
