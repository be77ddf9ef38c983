use anyhow::{Context, Result};
use sqlx::PgPool;

/// Read a value from shared certificate storage
pub async fn get(pool: &PgPool, key: &str) -> Result<Option<Vec<u8>>> {
    let value = sqlx::query_scalar::<_, Vec<u8>>(
        "SELECT value FROM certmagic_data WHERE key = $1",
    )
    .bind(key)
    .fetch_optional(pool)
    .await
    .context("Failed to read certificate storage")?;

    Ok(value)
}

/// Write a value to shared certificate storage
pub async fn put(pool: &PgPool, key: &str, value: &[u8]) -> Result<()> {
    sqlx::query(
        "INSERT INTO certmagic_data (key, value, modified_at) VALUES ($1, $2, NOW()) \
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, modified_at = NOW()",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("Failed to write certificate storage")?;

    Ok(())
}

/// List stored keys under a prefix (e.g. `certificates/`)
pub async fn list_keys(pool: &PgPool, prefix: &str) -> Result<Vec<String>> {
    let keys = sqlx::query_scalar::<_, String>(
        "SELECT key FROM certmagic_data WHERE key LIKE $1 || '%' ORDER BY key",
    )
    .bind(prefix)
    .fetch_all(pool)
    .await
    .context("Failed to list certificate storage keys")?;

    Ok(keys)
}

/// Take a distributed per-hostname issuance lock.
///
/// Expired locks are reaped in the same statement, so a crashed locker
/// self-heals after the TTL.
pub async fn lock_acquire(pool: &PgPool, key: &str, holder: &str, ttl_secs: i64) -> Result<bool> {
    let mut tx = pool.begin().await.context("Failed to begin lock transaction")?;

    sqlx::query("DELETE FROM certmagic_locks WHERE key = $1 AND expires_at < NOW()")
        .bind(key)
        .execute(&mut *tx)
        .await
        .context("Failed to reap expired lock")?;

    let result = sqlx::query(
        "INSERT INTO certmagic_locks (key, holder, expires_at) \
         VALUES ($1, $2, NOW() + make_interval(secs => $3)) \
         ON CONFLICT (key) DO NOTHING",
    )
    .bind(key)
    .bind(holder)
    .bind(ttl_secs as f64)
    .execute(&mut *tx)
    .await
    .context("Failed to acquire lock")?;

    tx.commit().await.context("Failed to commit lock acquisition")?;

    Ok(result.rows_affected() > 0)
}

/// Release a held lock
pub async fn lock_release(pool: &PgPool, key: &str, holder: &str) -> Result<()> {
    sqlx::query("DELETE FROM certmagic_locks WHERE key = $1 AND holder = $2")
        .bind(key)
        .bind(holder)
        .execute(pool)
        .await
        .context("Failed to release lock")?;

    Ok(())
}
