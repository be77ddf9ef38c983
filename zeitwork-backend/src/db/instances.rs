use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::{Instance, InstanceState};

const COLUMNS: &str = "id, organisation_id, region_id, node_id, image_id, state, \
     vcpus, memory_mib, default_port, ipv6_address, env_vars, \
     created_at, updated_at, deleted_at";

/// Create a pending instance on the chosen node and link it to its
/// deployment in one transaction.
#[allow(clippy::too_many_arguments)]
pub async fn create_for_deployment(
    pool: &PgPool,
    deployment_id: Uuid,
    organisation_id: Uuid,
    region_id: Uuid,
    node_id: Uuid,
    image_id: Uuid,
    vcpus: i32,
    memory_mib: i64,
    default_port: i32,
    env_vars: &serde_json::Value,
) -> Result<Instance> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let instance = sqlx::query_as::<_, Instance>(&format!(
        "INSERT INTO instances \
             (id, organisation_id, region_id, node_id, image_id, state, vcpus, memory_mib, default_port, env_vars) \
         VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, $9) \
         RETURNING {COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(organisation_id)
    .bind(region_id)
    .bind(node_id)
    .bind(image_id)
    .bind(vcpus)
    .bind(memory_mib)
    .bind(default_port)
    .bind(env_vars)
    .fetch_one(&mut *tx)
    .await
    .context("Failed to create instance")?;

    sqlx::query(
        "INSERT INTO deployment_instances (deployment_id, instance_id) VALUES ($1, $2)",
    )
    .bind(deployment_id)
    .bind(instance.id)
    .execute(&mut *tx)
    .await
    .context("Failed to link instance to deployment")?;

    tx.commit().await.context("Failed to commit instance allocation")?;

    Ok(instance)
}

/// Find instance by UUID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Instance>> {
    let instance = sqlx::query_as::<_, Instance>(&format!(
        "SELECT {COLUMNS} FROM instances WHERE id = $1 AND deleted_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to find instance by ID")?;

    Ok(instance)
}

/// List all instances
pub async fn list(pool: &PgPool) -> Result<Vec<Instance>> {
    let instances = sqlx::query_as::<_, Instance>(&format!(
        "SELECT {COLUMNS} FROM instances WHERE deleted_at IS NULL ORDER BY id"
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list instances")?;

    Ok(instances)
}

/// Desired state for a node agent: every non-terminated instance assigned
/// to the node.
pub async fn list_desired_for_node(pool: &PgPool, node_id: Uuid) -> Result<Vec<Instance>> {
    let instances = sqlx::query_as::<_, Instance>(&format!(
        "SELECT {COLUMNS} FROM instances \
         WHERE node_id = $1 AND state <> 'terminated' AND deleted_at IS NULL \
         ORDER BY id"
    ))
    .bind(node_id)
    .fetch_all(pool)
    .await
    .context("Failed to load desired instances for node")?;

    Ok(instances)
}

/// Instances currently holding capacity anywhere in the fleet
pub async fn list_capacity_consuming(pool: &PgPool) -> Result<Vec<Instance>> {
    let instances = sqlx::query_as::<_, Instance>(&format!(
        "SELECT {COLUMNS} FROM instances \
         WHERE state IN ('pending', 'starting', 'running') AND deleted_at IS NULL"
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list capacity-consuming instances")?;

    Ok(instances)
}

/// Instances in a given state
pub async fn find_by_state(pool: &PgPool, state: InstanceState) -> Result<Vec<Instance>> {
    let instances = sqlx::query_as::<_, Instance>(&format!(
        "SELECT {COLUMNS} FROM instances \
         WHERE state = $1 AND deleted_at IS NULL \
         ORDER BY id"
    ))
    .bind(state.to_string())
    .fetch_all(pool)
    .await
    .context("Failed to list instances by state")?;

    Ok(instances)
}

/// Instances serving a deployment
pub async fn list_for_deployment(pool: &PgPool, deployment_id: Uuid) -> Result<Vec<Instance>> {
    let instances = sqlx::query_as::<_, Instance>(
        "SELECT i.id, i.organisation_id, i.region_id, i.node_id, i.image_id, i.state, \
                i.vcpus, i.memory_mib, i.default_port, i.ipv6_address, i.env_vars, \
                i.created_at, i.updated_at, i.deleted_at \
         FROM instances i \
         JOIN deployment_instances di ON di.instance_id = i.id \
         WHERE di.deployment_id = $1 AND i.deleted_at IS NULL \
         ORDER BY i.id",
    )
    .bind(deployment_id)
    .fetch_all(pool)
    .await
    .context("Failed to list instances for deployment")?;

    Ok(instances)
}

/// Conditionally transition an instance between states
pub async fn transition(
    pool: &PgPool,
    id: Uuid,
    from: InstanceState,
    to: InstanceState,
) -> Result<Option<Instance>> {
    let instance = sqlx::query_as::<_, Instance>(&format!(
        "UPDATE instances SET state = $3 \
         WHERE id = $1 AND state = $2 AND deleted_at IS NULL \
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(from.to_string())
    .bind(to.to_string())
    .fetch_optional(pool)
    .await
    .context("Failed to transition instance state")?;

    Ok(instance)
}

/// Force an instance into a state regardless of its current one.
///
/// Reserved for the lifecycle owner (the node agent) and the failure paths.
pub async fn set_state(pool: &PgPool, id: Uuid, state: InstanceState) -> Result<()> {
    sqlx::query("UPDATE instances SET state = $2 WHERE id = $1 AND deleted_at IS NULL")
        .bind(id)
        .bind(state.to_string())
        .execute(pool)
        .await
        .context("Failed to set instance state")?;

    Ok(())
}

/// Record the private address an instance is reachable at
pub async fn set_ipv6_address(pool: &PgPool, id: Uuid, address: &str) -> Result<()> {
    sqlx::query("UPDATE instances SET ipv6_address = $2 WHERE id = $1 AND deleted_at IS NULL")
        .bind(id)
        .bind(address)
        .execute(pool)
        .await
        .context("Failed to set instance address")?;

    Ok(())
}

/// Fail every instance still holding capacity on a node.
///
/// Used when a node is declared gone; its agent is no longer trusted to
/// wind anything down.
pub async fn fail_for_node(pool: &PgPool, node_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE instances SET state = 'failed' \
         WHERE node_id = $1 \
           AND state IN ('pending', 'starting', 'running') \
           AND deleted_at IS NULL",
    )
    .bind(node_id)
    .execute(pool)
    .await
    .context("Failed to fail instances on node")?;

    Ok(result.rows_affected())
}

/// Mark every instance of a deployment as stopping, skipping instances
/// already on their way down.
///
/// Returns the number of instances affected.
pub async fn mark_stopping_for_deployment(pool: &PgPool, deployment_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE instances SET state = 'stopping' \
         WHERE id IN ( \
             SELECT instance_id FROM deployment_instances WHERE deployment_id = $1 \
         ) \
           AND state NOT IN ('stopping', 'stopped', 'terminated') \
           AND deleted_at IS NULL",
    )
    .bind(deployment_id)
    .execute(pool)
    .await
    .context("Failed to mark deployment instances stopping")?;

    Ok(result.rows_affected())
}
