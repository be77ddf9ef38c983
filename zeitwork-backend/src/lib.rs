pub mod api;
pub mod builder;
pub mod db;
pub mod edgeproxy;
pub mod events;
pub mod githost;
pub mod ids;
pub mod nodeagent;
pub mod reconciler;
pub mod settings;
pub mod state;

#[cfg(test)]
mod lib_tests;

use anyhow::Result;
use axum::Router;
use state::{AppState, ControllerState};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Run the operator/tenant HTTP API with an embedded deployment
/// reconciler.
///
/// The reconciler elects itself through the shared lease, so running it
/// embedded here and standalone elsewhere is safe.
pub async fn run_api(settings: settings::Settings) -> Result<()> {
    let state = AppState::new_for_server(&settings).await?;

    info!("Starting embedded deployment reconciler");
    let controller_state = Arc::new(ControllerState {
        db_pool: state.db_pool.clone(),
    });
    let recon = Arc::new(reconciler::DeploymentReconciler::new(
        controller_state,
        settings.reconciler.clone(),
        settings.registry.clone(),
        settings.database.url.clone(),
    )?);
    recon.start();

    let app = Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::routes::routes())
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let addr = settings.server.listen_addr.clone();
    info!("HTTP API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP API shutdown complete");
    Ok(())
}

/// Run a standalone deployment reconciler
pub async fn run_reconciler(settings: settings::Settings) -> Result<()> {
    let state = Arc::new(ControllerState::new(&settings.database.url, 5).await?);

    let recon = Arc::new(reconciler::DeploymentReconciler::new(
        state,
        settings.reconciler.clone(),
        settings.registry.clone(),
        settings.database.url.clone(),
    )?);
    recon.start();
    info!("Deployment reconciler started");

    shutdown_signal().await;
    info!("Deployment reconciler shutdown complete");
    Ok(())
}

/// Run one build worker process
pub async fn run_builder(settings: settings::Settings) -> Result<()> {
    let state = Arc::new(ControllerState::new(&settings.database.url, 3).await?);
    let registry = settings.require_registry()?.clone();

    let githost: Option<Arc<dyn githost::GitHost>> = match &settings.github {
        Some(github) => Some(Arc::new(githost::GitHubApp::new(github)?)),
        None => {
            tracing::warn!("No GitHub App configured - private repositories cannot be cloned");
            None
        }
    };

    let worker = Arc::new(builder::BuildWorker::new(
        state,
        settings.builder.clone(),
        registry,
        githost,
    ));
    tokio::spawn(worker.run());
    info!("Build worker started");

    shutdown_signal().await;
    info!("Build worker shutdown complete");
    Ok(())
}

/// Run the per-node agent: local reconciler plus the node HTTP API
pub async fn run_node_agent(settings: settings::Settings) -> Result<()> {
    let node_settings = Arc::new(settings.require_node()?.clone());
    let state = Arc::new(ControllerState::new(&settings.database.url, 3).await?);

    let runtime: Arc<dyn nodeagent::runtime::ContainerRuntime> =
        Arc::new(nodeagent::runtime::DockerRuntime::new()?);

    let agent = Arc::new(nodeagent::NodeAgent::new(
        state.clone(),
        node_settings.clone(),
        runtime,
        settings.database.url.clone(),
    ));
    agent.start();

    let api_state = nodeagent::NodeAgentState {
        db_pool: state.db_pool.clone(),
        settings: node_settings.clone(),
    };
    let app = nodeagent::routes::routes(api_state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let addr = node_settings.listen_addr.clone();
    info!("Node agent API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Node agent shutdown complete");
    Ok(())
}

/// Run one edge proxy
pub async fn run_edge_proxy(settings: settings::Settings) -> Result<()> {
    let edge_settings = settings.require_edge()?.clone();
    let state = Arc::new(ControllerState::new(&settings.database.url, 5).await?);

    let proxy = Arc::new(edgeproxy::EdgeProxy::new(
        state,
        edge_settings,
        settings.database.url.clone(),
    )?);

    tokio::select! {
        result = proxy.run() => result,
        _ = shutdown_signal() => {
            info!("Edge proxy shutdown complete");
            Ok(())
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}

/// Wait for a shutdown signal (SIGTERM or SIGINT)
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
