use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zeitwork_backend::settings::Settings;

#[derive(Parser, Debug)]
#[command(author, version, about = "Zeitwork control-plane daemons")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Operator/tenant HTTP API with an embedded deployment reconciler
    Api,
    /// Standalone deployment reconciler
    Reconciler,
    /// Image-build worker
    Builder,
    /// Per-node local reconciler and node API
    NodeAgent,
    /// TLS-terminating edge proxy
    EdgeProxy,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Api => zeitwork_backend::run_api(settings).await,
        Commands::Reconciler => zeitwork_backend::run_reconciler(settings).await,
        Commands::Builder => zeitwork_backend::run_builder(settings).await,
        Commands::NodeAgent => zeitwork_backend::run_node_agent(settings).await,
        Commands::EdgeProxy => zeitwork_backend::run_edge_proxy(settings).await,
    };

    if let Err(e) = result {
        tracing::error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}
