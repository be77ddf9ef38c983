use anyhow::{Context, Result};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::db::models::Domain;

const COLUMNS: &str = "id, organisation_id, name, internal, verification_token, verified_at, \
     deployment_id, created_at, updated_at, deleted_at";

/// One row of the edge routing join: a verified hostname and a running
/// backend serving it.
#[derive(Debug, Clone, FromRow)]
pub struct RouteRow {
    pub domain_name: String,
    pub instance_id: Uuid,
    pub ipv6_address: String,
    pub default_port: i32,
}

/// Create a domain claim.
///
/// Internal (platform-owned) domains are implicitly verified at creation;
/// external domains receive a verification token to publish as a TXT record.
pub async fn create(
    pool: &PgPool,
    organisation_id: Uuid,
    name: &str,
    internal: bool,
    verification_token: Option<&str>,
) -> Result<Domain> {
    let domain = sqlx::query_as::<_, Domain>(&format!(
        "INSERT INTO domains \
             (id, organisation_id, name, internal, verification_token, verified_at) \
         VALUES ($1, $2, $3, $4, $5, CASE WHEN $4 THEN NOW() ELSE NULL END) \
         RETURNING {COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(organisation_id)
    .bind(name)
    .bind(internal)
    .bind(verification_token)
    .fetch_one(pool)
    .await
    .context("Failed to create domain")?;

    Ok(domain)
}

/// Find domain by hostname
pub async fn find_by_name(pool: &PgPool, name: &str) -> Result<Option<Domain>> {
    let domain = sqlx::query_as::<_, Domain>(&format!(
        "SELECT {COLUMNS} FROM domains WHERE name = $1 AND deleted_at IS NULL"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("Failed to find domain by name")?;

    Ok(domain)
}

/// List domains for an organisation
pub async fn list(pool: &PgPool, organisation_id: Uuid) -> Result<Vec<Domain>> {
    let domains = sqlx::query_as::<_, Domain>(&format!(
        "SELECT {COLUMNS} FROM domains \
         WHERE organisation_id = $1 AND deleted_at IS NULL \
         ORDER BY name"
    ))
    .bind(organisation_id)
    .fetch_all(pool)
    .await
    .context("Failed to list domains")?;

    Ok(domains)
}

/// External domains still awaiting their TXT proof
pub async fn list_pending_verification(pool: &PgPool) -> Result<Vec<Domain>> {
    let domains = sqlx::query_as::<_, Domain>(&format!(
        "SELECT {COLUMNS} FROM domains \
         WHERE internal = FALSE AND verified_at IS NULL \
           AND verification_token IS NOT NULL AND deleted_at IS NULL \
         ORDER BY id"
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list domains pending verification")?;

    Ok(domains)
}

/// Record a successful TXT verification. Monotonic: never clears an
/// existing timestamp.
pub async fn set_verified(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE domains SET verified_at = NOW() \
         WHERE id = $1 AND verified_at IS NULL AND deleted_at IS NULL",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to mark domain verified")?;

    Ok(())
}

/// Point a domain at a deployment
pub async fn link_deployment(pool: &PgPool, id: Uuid, deployment_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE domains SET deployment_id = $2 WHERE id = $1 AND deleted_at IS NULL")
        .bind(id)
        .bind(deployment_id)
        .execute(pool)
        .await
        .context("Failed to link domain to deployment")?;

    Ok(())
}

/// Repoint every domain of a `(project, environment)` at the deployment
/// that just became ready. Routing follows on the next edge refresh.
pub async fn relink_for_environment(
    pool: &PgPool,
    project_id: Uuid,
    environment_id: Uuid,
    new_deployment_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE domains SET deployment_id = $3 \
         WHERE deployment_id IN ( \
             SELECT id FROM deployments \
             WHERE project_id = $1 AND environment_id = $2 \
         ) \
           AND deployment_id <> $3 AND deleted_at IS NULL",
    )
    .bind(project_id)
    .bind(environment_id)
    .bind(new_deployment_id)
    .execute(pool)
    .await
    .context("Failed to relink domains")?;

    Ok(result.rows_affected())
}

/// Soft-delete a domain
pub async fn soft_delete(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE domains SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to delete domain")?;

    Ok(result.rows_affected() > 0)
}

/// The edge routing join: verified domains linked to a ready deployment
/// with at least one running, addressable instance.
pub async fn list_routes(pool: &PgPool) -> Result<Vec<RouteRow>> {
    let routes = sqlx::query_as::<_, RouteRow>(
        "SELECT dom.name AS domain_name, i.id AS instance_id, \
                i.ipv6_address, i.default_port \
         FROM domains dom \
         JOIN deployments d ON d.id = dom.deployment_id \
         JOIN deployment_instances di ON di.deployment_id = d.id \
         JOIN instances i ON i.id = di.instance_id \
         WHERE dom.verified_at IS NOT NULL \
           AND dom.deleted_at IS NULL \
           AND d.status = 'ready' AND d.deleted_at IS NULL \
           AND i.state = 'running' AND i.ipv6_address IS NOT NULL \
           AND i.deleted_at IS NULL \
         ORDER BY dom.name, i.id",
    )
    .fetch_all(pool)
    .await
    .context("Failed to load routing table")?;

    Ok(routes)
}
