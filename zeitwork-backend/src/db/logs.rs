use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::BuildLog;

/// Append one line to a build's log stream
pub async fn append_build_log(
    pool: &PgPool,
    build_id: Uuid,
    level: &str,
    message: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO build_logs (id, build_id, level, message) VALUES ($1, $2, $3, $4)")
        .bind(Uuid::now_v7())
        .bind(build_id)
        .bind(level)
        .bind(message)
        .execute(pool)
        .await
        .context("Failed to append build log")?;

    Ok(())
}

/// Last `limit` lines of a build log, oldest first
pub async fn build_log_tail(pool: &PgPool, build_id: Uuid, limit: i64) -> Result<Vec<BuildLog>> {
    let lines = sqlx::query_as::<_, BuildLog>(
        "SELECT id, build_id, level, message, created_at FROM ( \
             SELECT id, build_id, level, message, created_at \
             FROM build_logs \
             WHERE build_id = $1 \
             ORDER BY created_at DESC, id DESC \
             LIMIT $2 \
         ) tail ORDER BY created_at, id",
    )
    .bind(build_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to read build log tail")?;

    Ok(lines)
}

/// Append one line to a deployment's log stream
pub async fn append_deployment_log(
    pool: &PgPool,
    deployment_id: Uuid,
    level: &str,
    message: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO deployment_logs (id, deployment_id, level, message) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::now_v7())
    .bind(deployment_id)
    .bind(level)
    .bind(message)
    .execute(pool)
    .await
    .context("Failed to append deployment log")?;

    Ok(())
}
