use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::db::instances;
use crate::db::models::{Instance, InstanceState};

use super::NodeAgentState;

/// Error body shape shared by all endpoints
pub fn error_body(code: &str, message: String) -> Json<serde_json::Value> {
    Json(json!({ "code": code, "message": message }))
}

pub async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize)]
pub struct NodeInfo {
    pub node_id: Uuid,
    pub address: String,
    pub region: Option<String>,
    pub hostname: String,
}

pub async fn node_info(State(state): State<NodeAgentState>) -> Json<NodeInfo> {
    Json(NodeInfo {
        node_id: state.settings.id,
        address: state.settings.ip.clone(),
        region: state.settings.region.clone(),
        hostname: super::local_hostname(),
    })
}

#[derive(Serialize)]
pub struct NodeResources {
    pub vcpus: i32,
    pub memory_mib: i64,
    pub instances: usize,
}

pub async fn node_resources(
    State(state): State<NodeAgentState>,
) -> Result<Json<NodeResources>, (StatusCode, Json<serde_json::Value>)> {
    let desired = instances::list_desired_for_node(&state.db_pool, state.settings.id)
        .await
        .map_err(|e| {
            error!("Failed to load node instances: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal", "failed to load instances".to_string()),
            )
        })?;

    Ok(Json(NodeResources {
        vcpus: super::detect_vcpus(),
        memory_mib: super::detect_memory_mib(),
        instances: desired.len(),
    }))
}

pub async fn list_instances(
    State(state): State<NodeAgentState>,
) -> Result<Json<Vec<Instance>>, (StatusCode, Json<serde_json::Value>)> {
    let desired = instances::list_desired_for_node(&state.db_pool, state.settings.id)
        .await
        .map_err(|e| {
            error!("Failed to list instances: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal", "failed to list instances".to_string()),
            )
        })?;
    Ok(Json(desired))
}

pub async fn get_instance(
    State(state): State<NodeAgentState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Instance>, (StatusCode, Json<serde_json::Value>)> {
    let instance = instances::find_by_id(&state.db_pool, id)
        .await
        .map_err(|e| {
            error!("Failed to load instance {}: {:#}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal", "failed to load instance".to_string()),
            )
        })?
        .filter(|i| i.node_id == state.settings.id)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                error_body("not_found", format!("instance {} not found on this node", id)),
            )
        })?;
    Ok(Json(instance))
}

#[derive(Deserialize)]
pub struct CreateInstanceRequest {
    pub organisation_id: Uuid,
    pub region_id: Uuid,
    pub image_id: Uuid,
    pub deployment_id: Uuid,
    #[serde(default)]
    pub vcpus: Option<i32>,
    #[serde(default)]
    pub memory_mib: Option<i64>,
    #[serde(default)]
    pub default_port: Option<i32>,
    #[serde(default)]
    pub env_vars: Option<serde_json::Value>,
}

/// Direct operator-to-agent instance creation, pinned to this node
pub async fn create_instance(
    State(state): State<NodeAgentState>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<Instance>), (StatusCode, Json<serde_json::Value>)> {
    let env_vars = request.env_vars.unwrap_or_else(|| json!({}));
    let instance = instances::create_for_deployment(
        &state.db_pool,
        request.deployment_id,
        request.organisation_id,
        request.region_id,
        state.settings.id,
        request.image_id,
        request.vcpus.unwrap_or(2),
        request.memory_mib.unwrap_or(2048),
        request.default_port.unwrap_or(3000),
        &env_vars,
    )
    .await
    .map_err(|e| {
        error!("Failed to create instance: {:#}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("internal", "failed to create instance".to_string()),
        )
    })?;

    info!("Operator created instance {} on this node", instance.id);
    Ok((StatusCode::CREATED, Json(instance)))
}

/// Wind an instance down; the reconcile loop does the actual teardown
pub async fn delete_instance(
    State(state): State<NodeAgentState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let instance = instances::find_by_id(&state.db_pool, id)
        .await
        .map_err(|e| {
            error!("Failed to load instance {}: {:#}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal", "failed to load instance".to_string()),
            )
        })?
        .filter(|i| i.node_id == state.settings.id)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                error_body("not_found", format!("instance {} not found on this node", id)),
            )
        })?;

    instances::set_state(&state.db_pool, instance.id, InstanceState::Stopping)
        .await
        .map_err(|e| {
            error!("Failed to stop instance {}: {:#}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal", "failed to stop instance".to_string()),
            )
        })?;

    Ok(StatusCode::ACCEPTED)
}
