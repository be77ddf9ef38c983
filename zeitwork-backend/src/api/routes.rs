use axum::routing::{delete, get, post, put};
use axum::Router;

use super::handlers;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/webhook/github", post(handlers::webhook_github))
        .route("/v1/projects", get(handlers::list_projects))
        .route("/v1/projects", post(handlers::create_project))
        .route("/v1/deployments", get(handlers::list_deployments))
        .route("/v1/deployments", post(handlers::create_deployment))
        .route("/v1/deployments/{id}", get(handlers::get_deployment))
        .route("/v1/deployments/{id}/logs", get(handlers::deployment_logs))
        .route("/v1/domains", get(handlers::list_domains))
        .route("/v1/domains", post(handlers::create_domain))
        .route("/v1/domains/{id}", delete(handlers::delete_domain))
        .route("/v1/nodes", get(handlers::list_nodes))
        .route("/v1/nodes", post(handlers::create_node))
        .route("/v1/nodes/{id}", delete(handlers::delete_node))
        .route("/v1/nodes/{id}/state", put(handlers::update_node_state))
        .route("/v1/instances", get(handlers::list_instances))
        .route("/v1/instances/{id}", get(handlers::get_instance))
        .route("/v1/instances/{id}", put(handlers::update_instance_state))
        .route("/v1/instances/{id}", delete(handlers::delete_instance))
}
