use anyhow::{Context, Result};
use sqlx::PgPool;

/// Try to take (or renew) a named lease for `holder`.
///
/// A lease is free when it has no holder, its TTL expired, or `holder`
/// already owns it. Returns whether `holder` holds the lease afterwards.
/// Duplicate leadership during the TTL race window is tolerated because
/// every state transition the leader makes is a conditional update.
pub async fn acquire(pool: &PgPool, name: &str, holder: &str, ttl_secs: i64) -> Result<bool> {
    // Bootstrap the row; a no-op once it exists.
    sqlx::query("INSERT INTO leases (name, holder, expires_at) VALUES ($1, NULL, NOW()) ON CONFLICT (name) DO NOTHING")
        .bind(name)
        .execute(pool)
        .await
        .context("Failed to ensure lease row")?;

    let row = sqlx::query_scalar::<_, String>(
        "UPDATE leases \
         SET holder = $2, expires_at = NOW() + make_interval(secs => $3) \
         WHERE name = $1 AND (holder IS NULL OR holder = $2 OR expires_at < NOW()) \
         RETURNING holder",
    )
    .bind(name)
    .bind(holder)
    .bind(ttl_secs as f64)
    .fetch_optional(pool)
    .await
    .context("Failed to acquire lease")?;

    Ok(row.is_some())
}

/// Give the lease up early so another candidate can take it without
/// waiting out the TTL.
pub async fn release(pool: &PgPool, name: &str, holder: &str) -> Result<()> {
    sqlx::query(
        "UPDATE leases SET holder = NULL, expires_at = NOW() \
         WHERE name = $1 AND holder = $2",
    )
    .bind(name)
    .bind(holder)
    .execute(pool)
    .await
    .context("Failed to release lease")?;

    Ok(())
}
