use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};

use super::{auth, handlers, NodeAgentState};

pub fn routes(state: NodeAgentState) -> Router {
    let public = Router::new().route("/v1/health", get(handlers::health));

    let protected = Router::new()
        .route("/v1/node/info", get(handlers::node_info))
        .route("/v1/node/resources", get(handlers::node_resources))
        .route("/v1/instances", get(handlers::list_instances))
        .route("/v1/instances", post(handlers::create_instance))
        .route("/v1/instances/{id}", get(handlers::get_instance))
        .route("/v1/instances/{id}", delete(handlers::delete_instance))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_middleware,
        ));

    public.merge(protected).with_state(state)
}

/// Extract the bearer token from the Authorization header
fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, (StatusCode, String)> {
    let auth_header = headers
        .get("Authorization")
        .ok_or((
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header".to_string(),
        ))?
        .to_str()
        .map_err(|_| {
            (
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization header".to_string(),
            )
        })?;

    auth_header.strip_prefix("Bearer ").ok_or((
        StatusCode::UNAUTHORIZED,
        "Invalid Authorization header format".to_string(),
    ))
}

/// Validate the caller's JWT against the node's `NODE_JWT` secret and
/// inject the claims into request extensions. With no secret configured
/// the agent API is open (development setups).
async fn jwt_auth_middleware(
    State(state): State<NodeAgentState>,
    headers: HeaderMap,
    mut req: Request,
    next: Next,
) -> Result<Response, (StatusCode, String)> {
    let Some(secret) = state.settings.jwt.as_deref() else {
        return Ok(next.run(req).await);
    };

    let token = extract_bearer_token(&headers)?;

    let claims = auth::validate_token(token, secret).map_err(|e| {
        tracing::warn!("Node API token validation failed: {}", e);
        (StatusCode::UNAUTHORIZED, "Invalid token".to_string())
    })?;

    tracing::debug!("Node API request from {}", claims.sub);
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}
