use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::models::{
    Deployment, Domain, Instance, InstanceState, Node, NodeState, Project,
};
use crate::db::{
    deployments, domains, environments, instances, logs, nodes, projects,
};
use crate::events;
use crate::ids;
use crate::state::AppState;

/// Platform suffix for implicitly verified internal domains
const INTERNAL_DOMAIN_SUFFIX: &str = ".zeitwork.app";

type ApiError = (StatusCode, Json<serde_json::Value>);

fn error_body(code: &str, message: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "code": code, "message": message.into() }))
}

fn internal_error(context: &str, e: anyhow::Error) -> ApiError {
    error!("{}: {:#}", context, e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        error_body("internal", context),
    )
}

fn not_found(what: &str) -> ApiError {
    (StatusCode::NOT_FOUND, error_body("not_found", what))
}

// --- webhook ---

#[derive(Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: PushRepository,
}

#[derive(Deserialize)]
struct PushRepository {
    full_name: String,
}

/// GitHub push webhook: the entry point of the deployment pipeline.
///
/// Duplicate deliveries are absorbed by the
/// `(project, commit, environment)` dedup check, so redelivered events
/// never enqueue a second deployment.
pub async fn webhook_github(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if let Some(githost) = &state.githost {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !githost.verify_webhook_signature(&body, signature) {
            warn!("Rejected webhook with bad signature");
            return Err((
                StatusCode::UNAUTHORIZED,
                error_body("bad_signature", "webhook signature verification failed"),
            ));
        }
    }

    let event: PushEvent = serde_json::from_slice(&body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            error_body("malformed_payload", format!("cannot parse push event: {}", e)),
        )
    })?;

    // Branch deletions push an all-zero head.
    if event.after.chars().all(|c| c == '0') {
        return Ok((StatusCode::OK, Json(json!({ "ignored": "branch deleted" }))));
    }
    let Some(branch) = event.git_ref.strip_prefix("refs/heads/") else {
        return Ok((StatusCode::OK, Json(json!({ "ignored": "not a branch push" }))));
    };

    let project = projects::find_by_repository(&state.db_pool, &event.repository.full_name)
        .await
        .map_err(|e| internal_error("failed to look up project", e))?
        .ok_or_else(|| not_found("no project for this repository"))?;

    let Some(environment) =
        environments::find_for_branch(&state.db_pool, project.id, branch)
            .await
            .map_err(|e| internal_error("failed to look up environment", e))?
    else {
        return Ok((
            StatusCode::OK,
            Json(json!({ "ignored": format!("no environment deploys {}", branch) })),
        ));
    };

    let deployment =
        enqueue_deployment(&state, &project, environment.id, &event.after).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "deployment": deployment.deployment_slug })),
    ))
}

/// Shared enqueue path for webhooks and manual deploys
async fn enqueue_deployment(
    state: &AppState,
    project: &Project,
    environment_id: Uuid,
    commit_sha: &str,
) -> Result<Deployment, ApiError> {
    let pool = &state.db_pool;

    if let Some(existing) =
        deployments::find_duplicate(pool, project.id, environment_id, commit_sha)
            .await
            .map_err(|e| internal_error("failed to check for duplicates", e))?
    {
        info!(
            "Commit {} already deploying as {}, ignoring duplicate",
            commit_sha, existing.deployment_slug
        );
        return Ok(existing);
    }

    let slug = ids::short_slug();
    let deployment = deployments::create(
        pool,
        project.organisation_id,
        project.id,
        environment_id,
        &slug,
        commit_sha,
    )
    .await
    .map_err(|e| internal_error("failed to create deployment", e))?;

    // Make sure the platform subdomain exists and rides this pipeline.
    let internal_name = format!("{}{}", project.slug, INTERNAL_DOMAIN_SUFFIX);
    match domains::find_by_name(pool, &internal_name).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            match domains::create(pool, project.organisation_id, &internal_name, true, None).await
            {
                Ok(domain) => {
                    domains::link_deployment(pool, domain.id, deployment.id)
                        .await
                        .ok();
                }
                Err(e) => warn!("Failed to create internal domain {}: {:#}", internal_name, e),
            }
        }
        Err(e) => warn!("Failed to check internal domain {}: {:#}", internal_name, e),
    }

    info!(
        "Deployment {} queued for {}@{}",
        deployment.deployment_slug, project.repository, commit_sha
    );
    events::publish_quiet(pool, "deployments", deployment.id).await;
    Ok(deployment)
}

// --- projects ---

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub organisation_id: Uuid,
    pub name: String,
    pub repository: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub root_directory: Option<String>,
    #[serde(default)]
    pub dockerfile_path: Option<String>,
}

#[derive(Deserialize)]
pub struct OrganisationQuery {
    pub organisation_id: Uuid,
}

pub async fn list_projects(
    State(state): State<AppState>,
    Query(query): Query<OrganisationQuery>,
) -> Result<Json<Vec<Project>>, ApiError> {
    let projects = projects::list(&state.db_pool, query.organisation_id)
        .await
        .map_err(|e| internal_error("failed to list projects", e))?;
    Ok(Json(projects))
}

pub async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    if request.name.trim().is_empty() || !request.repository.contains('/') {
        return Err((
            StatusCode::BAD_REQUEST,
            error_body("invalid_input", "name and owner/repo repository are required"),
        ));
    }

    let default_branch = request.default_branch.as_deref().unwrap_or("main");
    let slug = slugify(&request.name);

    let project = projects::create(
        &state.db_pool,
        request.organisation_id,
        request.name.trim(),
        &slug,
        &request.repository,
        default_branch,
        request.root_directory.as_deref(),
        request.dockerfile_path.as_deref(),
    )
    .await
    .map_err(|e| internal_error("failed to create project", e))?;

    // Every project deploys its default branch to production.
    environments::ensure(
        &state.db_pool,
        project.organisation_id,
        project.id,
        "production",
        default_branch,
    )
    .await
    .map_err(|e| internal_error("failed to create production environment", e))?;

    info!("Project {} created ({})", project.name, project.repository);
    Ok((StatusCode::CREATED, Json(project)))
}

// --- deployments ---

#[derive(Deserialize)]
pub struct ListDeploymentsQuery {
    pub project_id: Uuid,
}

pub async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    let deployments = deployments::list_for_project(&state.db_pool, query.project_id)
        .await
        .map_err(|e| internal_error("failed to list deployments", e))?;
    Ok(Json(deployments))
}

#[derive(Deserialize)]
pub struct CreateDeploymentRequest {
    pub project_id: Uuid,
    pub commit_sha: String,
    #[serde(default)]
    pub environment: Option<String>,
}

pub async fn create_deployment(
    State(state): State<AppState>,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    let project = projects::find_by_id(&state.db_pool, request.project_id)
        .await
        .map_err(|e| internal_error("failed to look up project", e))?
        .ok_or_else(|| not_found("project"))?;

    let environment_name = request.environment.as_deref().unwrap_or("production");
    let environment = environments::ensure(
        &state.db_pool,
        project.organisation_id,
        project.id,
        environment_name,
        &project.default_branch,
    )
    .await
    .map_err(|e| internal_error("failed to resolve environment", e))?;

    let deployment =
        enqueue_deployment(&state, &project, environment.id, &request.commit_sha).await?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

/// Lookup by UUID or by short slug
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment = match id.parse::<Uuid>() {
        Ok(uuid) => deployments::find_by_id(&state.db_pool, uuid)
            .await
            .map_err(|e| internal_error("failed to load deployment", e))?,
        Err(_) => deployments::find_by_slug(&state.db_pool, &id)
            .await
            .map_err(|e| internal_error("failed to load deployment", e))?,
    };

    deployment.map(Json).ok_or_else(|| not_found("deployment"))
}

/// Tail of the deployment's build log (failures surface their log here)
pub async fn deployment_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = match id.parse::<Uuid>() {
        Ok(uuid) => deployments::find_by_id(&state.db_pool, uuid)
            .await
            .map_err(|e| internal_error("failed to load deployment", e))?,
        Err(_) => deployments::find_by_slug(&state.db_pool, &id)
            .await
            .map_err(|e| internal_error("failed to load deployment", e))?,
    }
    .ok_or_else(|| not_found("deployment"))?;

    let lines = match deployment.build_id {
        Some(build_id) => logs::build_log_tail(&state.db_pool, build_id, 200)
            .await
            .map_err(|e| internal_error("failed to read build log", e))?,
        None => Vec::new(),
    };

    Ok(Json(json!({
        "deployment": deployment.deployment_slug,
        "status": deployment.status,
        "error_message": deployment.error_message,
        "log": lines,
    })))
}

// --- domains ---

pub async fn list_domains(
    State(state): State<AppState>,
    Query(query): Query<OrganisationQuery>,
) -> Result<Json<Vec<Domain>>, ApiError> {
    let domains = domains::list(&state.db_pool, query.organisation_id)
        .await
        .map_err(|e| internal_error("failed to list domains", e))?;
    Ok(Json(domains))
}

#[derive(Deserialize)]
pub struct CreateDomainRequest {
    pub organisation_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub deployment_id: Option<Uuid>,
}

pub async fn create_domain(
    State(state): State<AppState>,
    Json(request): Json<CreateDomainRequest>,
) -> Result<(StatusCode, Json<Domain>), ApiError> {
    let name = request.name.trim().to_ascii_lowercase();
    if name.is_empty() || !name.contains('.') {
        return Err((
            StatusCode::BAD_REQUEST,
            error_body("invalid_input", "a fully qualified hostname is required"),
        ));
    }

    let internal = name.ends_with(INTERNAL_DOMAIN_SUFFIX);
    let verification_token = if internal {
        None
    } else {
        Some(generate_verification_token())
    };

    let domain = domains::create(
        &state.db_pool,
        request.organisation_id,
        &name,
        internal,
        verification_token.as_deref(),
    )
    .await
    .map_err(|e| internal_error("failed to create domain", e))?;

    if let Some(deployment_id) = request.deployment_id {
        domains::link_deployment(&state.db_pool, domain.id, deployment_id)
            .await
            .map_err(|e| internal_error("failed to link domain", e))?;
    }

    Ok((StatusCode::CREATED, Json(domain)))
}

pub async fn delete_domain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let deleted = domains::soft_delete(&state.db_pool, id)
        .await
        .map_err(|e| internal_error("failed to delete domain", e))?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("domain"))
    }
}

// --- nodes ---

pub async fn list_nodes(State(state): State<AppState>) -> Result<Json<Vec<Node>>, ApiError> {
    let nodes = nodes::list(&state.db_pool)
        .await
        .map_err(|e| internal_error("failed to list nodes", e))?;
    Ok(Json(nodes))
}

#[derive(Deserialize)]
pub struct CreateNodeRequest {
    pub organisation_id: Uuid,
    pub region_id: Uuid,
    pub hostname: String,
    pub private_address: String,
    pub vcpus: i32,
    pub memory_mib: i64,
}

pub async fn create_node(
    State(state): State<AppState>,
    Json(request): Json<CreateNodeRequest>,
) -> Result<(StatusCode, Json<Node>), ApiError> {
    let node = nodes::create(
        &state.db_pool,
        request.organisation_id,
        request.region_id,
        &request.hostname,
        &request.private_address,
        request.vcpus,
        request.memory_mib,
    )
    .await
    .map_err(|e| internal_error("failed to create node", e))?;

    info!("Node {} registered in region {}", node.id, node.region_id);
    Ok((StatusCode::CREATED, Json(node)))
}

pub async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let deleted = nodes::soft_delete(&state.db_pool, id)
        .await
        .map_err(|e| internal_error("failed to delete node", e))?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("node"))
    }
}

#[derive(Deserialize)]
pub struct UpdateNodeStateRequest {
    pub state: NodeState,
}

pub async fn update_node_state(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateNodeStateRequest>,
) -> Result<Json<Node>, ApiError> {
    let node = nodes::update_state(&state.db_pool, id, request.state)
        .await
        .map_err(|e| internal_error("failed to update node", e))?
        .ok_or_else(|| not_found("node"))?;

    events::publish_quiet(&state.db_pool, "nodes", node.id).await;
    Ok(Json(node))
}

// --- instances ---

pub async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<Vec<Instance>>, ApiError> {
    let instances = instances::list(&state.db_pool)
        .await
        .map_err(|e| internal_error("failed to list instances", e))?;
    Ok(Json(instances))
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Instance>, ApiError> {
    let instance = instances::find_by_id(&state.db_pool, id)
        .await
        .map_err(|e| internal_error("failed to load instance", e))?
        .ok_or_else(|| not_found("instance"))?;
    Ok(Json(instance))
}

#[derive(Deserialize)]
pub struct UpdateInstanceStateRequest {
    pub state: InstanceState,
}

pub async fn update_instance_state(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateInstanceStateRequest>,
) -> Result<Json<Instance>, ApiError> {
    instances::set_state(&state.db_pool, id, request.state)
        .await
        .map_err(|e| internal_error("failed to update instance", e))?;

    let instance = instances::find_by_id(&state.db_pool, id)
        .await
        .map_err(|e| internal_error("failed to load instance", e))?
        .ok_or_else(|| not_found("instance"))?;

    events::publish_quiet(&state.db_pool, "instances", instance.id).await;
    Ok(Json(instance))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let instance = instances::find_by_id(&state.db_pool, id)
        .await
        .map_err(|e| internal_error("failed to load instance", e))?
        .ok_or_else(|| not_found("instance"))?;

    instances::set_state(&state.db_pool, instance.id, InstanceState::Stopping)
        .await
        .map_err(|e| internal_error("failed to stop instance", e))?;

    events::publish_quiet(&state.db_pool, "instances", instance.id).await;
    Ok(StatusCode::ACCEPTED)
}

// --- helpers ---

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

fn generate_verification_token() -> String {
    let mut rng = rand::thread_rng();
    let token: String = (0..32)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rng.gen_range(0..chars.len())] as char
        })
        .collect();
    format!("zw-verify-{}", token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Web App"), "my-web-app");
        assert_eq!(slugify("api_v2!"), "api-v2");
        assert_eq!(slugify("  spaces  "), "spaces");
        assert_eq!(slugify("UPPER"), "upper");
    }

    #[test]
    fn test_verification_token_shape() {
        let token = generate_verification_token();
        assert!(token.starts_with("zw-verify-"));
        assert_eq!(token.len(), "zw-verify-".len() + 32);
    }

    #[test]
    fn test_internal_domain_detection() {
        assert!("myapp.zeitwork.app".ends_with(INTERNAL_DOMAIN_SUFFIX));
        assert!(!"example.com".ends_with(INTERNAL_DOMAIN_SUFFIX));
    }

    #[test]
    fn test_push_event_parses() {
        let payload = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc123def456",
            "repository": { "full_name": "acme/web" },
        });
        let event: PushEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.git_ref, "refs/heads/main");
        assert_eq!(event.repository.full_name, "acme/web");
    }
}
