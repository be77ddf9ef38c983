use anyhow::Result;
use clap::{Parser, Subcommand};

mod infra;
mod ops;
mod run;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cluster operations for the Zeitwork platform")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the local cluster infrastructure
    #[command(subcommand)]
    Infra(InfraCommands),
    /// Bring the cluster up and run the test suite against it
    Run {
        /// Only run tests matching this pattern
        #[arg(long)]
        test: Option<String>,
        /// Deploy the infrastructure without running tests
        #[arg(long)]
        deploy_only: bool,
        /// Keep existing cluster state instead of resetting it
        #[arg(long)]
        no_reset: bool,
    },
    /// Open an interactive shell on a node
    Ssh {
        /// Node hostname or address
        node: String,
    },
    /// Tail the node-agent logs of a node
    Logs {
        /// Node hostname or address
        node: String,
    },
    /// Open a psql shell against the cluster database
    Db,
}

#[derive(Subcommand, Debug)]
enum InfraCommands {
    /// Start the local infrastructure
    Up,
    /// Stop the local infrastructure
    Down,
    /// Show infrastructure status
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result: Result<()> = match cli.command {
        Commands::Infra(InfraCommands::Up) => infra::up().await,
        Commands::Infra(InfraCommands::Down) => infra::down().await,
        Commands::Infra(InfraCommands::Status) => infra::status().await,
        Commands::Run {
            test,
            deploy_only,
            no_reset,
        } => run::run(test.as_deref(), deploy_only, no_reset).await,
        Commands::Ssh { node } => ops::ssh(&node).await,
        Commands::Logs { node } => ops::logs(&node).await,
        Commands::Db => ops::db().await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", console::style("error:").red().bold(), e);
        std::process::exit(1);
    }
}
