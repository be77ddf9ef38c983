use anyhow::{bail, Context, Result};
use tokio::process::Command;

fn ssh_user() -> String {
    std::env::var("ZEITWORK_SSH_USER").unwrap_or_else(|_| "root".to_string())
}

/// Interactive shell on a node
pub async fn ssh(node: &str) -> Result<()> {
    let status = Command::new("ssh")
        .arg(format!("{}@{}", ssh_user(), node))
        .status()
        .await
        .context("Failed to run ssh")?;
    if !status.success() {
        bail!("ssh exited with {}", status);
    }
    Ok(())
}

/// Tail the node agent's journal on a node
pub async fn logs(node: &str) -> Result<()> {
    let status = Command::new("ssh")
        .arg(format!("{}@{}", ssh_user(), node))
        .arg("journalctl -u zeitwork-node-agent -f -n 200")
        .status()
        .await
        .context("Failed to run ssh")?;
    if !status.success() {
        bail!("ssh exited with {}", status);
    }
    Ok(())
}

/// psql against DATABASE_URL
pub async fn db() -> Result<()> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;

    let status = Command::new("psql")
        .arg(&database_url)
        .status()
        .await
        .context("Failed to run psql (is it installed?)")?;
    if !status.success() {
        bail!("psql exited with {}", status);
    }
    Ok(())
}
