use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

use crate::githost::{GitHost, GitHubApp};
use crate::settings::Settings;

/// Minimal state shared by the controller loops - database access only
#[derive(Clone)]
pub struct ControllerState {
    pub db_pool: PgPool,
}

impl ControllerState {
    /// Connect with a role-appropriate pool size
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        tracing::info!(
            "Connecting to PostgreSQL with {} max connections...",
            max_connections
        );

        let db_pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        tracing::info!("Successfully connected to PostgreSQL");
        Ok(Self { db_pool })
    }
}

/// Full state for the HTTP API server
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub settings: Arc<Settings>,
    pub githost: Option<Arc<dyn GitHost>>,
}

impl AppState {
    async fn run_migrations(pool: &PgPool) -> Result<()> {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .context("Failed to run migrations")?;
        tracing::info!("Migrations completed successfully");
        Ok(())
    }

    /// Initialize state for the API server; runs migrations
    pub async fn new_for_server(settings: &Settings) -> Result<Self> {
        tracing::info!("Initializing AppState for HTTP server");

        let db_pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&settings.database.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        tracing::info!("Successfully connected to PostgreSQL");

        Self::run_migrations(&db_pool).await?;

        let githost: Option<Arc<dyn GitHost>> = match &settings.github {
            Some(github) => {
                let app = GitHubApp::new(github).context("Failed to initialize GitHub App")?;
                tracing::info!("Initialized GitHub App integration");
                Some(Arc::new(app))
            }
            None => {
                tracing::warn!("No GitHub App configured - webhook signatures cannot be verified");
                None
            }
        };

        Ok(Self {
            db_pool,
            settings: Arc::new(settings.clone()),
            githost,
        })
    }
}
