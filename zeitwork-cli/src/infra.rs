use anyhow::{bail, Context, Result};
use console::style;
use tokio::process::Command;

/// Compose file describing the local cluster (database, registry, nodes)
pub fn compose_file() -> String {
    std::env::var("ZEITWORK_COMPOSE_FILE").unwrap_or_else(|_| "infra/compose.yaml".to_string())
}

pub async fn up() -> Result<()> {
    println!("{} starting infrastructure...", style("infra").cyan().bold());
    compose(&["up", "-d", "--wait"]).await?;
    println!("{} infrastructure is up", style("infra").cyan().bold());
    Ok(())
}

pub async fn down() -> Result<()> {
    println!("{} stopping infrastructure...", style("infra").cyan().bold());
    compose(&["down"]).await?;
    Ok(())
}

/// Full reset: containers and volumes
pub async fn reset() -> Result<()> {
    println!("{} resetting infrastructure...", style("infra").cyan().bold());
    compose(&["down", "-v"]).await?;
    compose(&["up", "-d", "--wait"]).await?;
    Ok(())
}

pub async fn status() -> Result<()> {
    compose(&["ps"]).await
}

async fn compose(args: &[&str]) -> Result<()> {
    let file = compose_file();
    let status = Command::new("docker")
        .arg("compose")
        .arg("-f")
        .arg(&file)
        .args(args)
        .status()
        .await
        .context("Failed to run docker compose (is Docker installed?)")?;

    if !status.success() {
        bail!("docker compose {} exited with {}", args.join(" "), status);
    }
    Ok(())
}
