use anyhow::{bail, Context, Result};
use console::style;
use tokio::process::Command;

use crate::infra;

/// Bring the cluster up (optionally from scratch) and run the test suite.
pub async fn run(test_pattern: Option<&str>, deploy_only: bool, no_reset: bool) -> Result<()> {
    if no_reset {
        infra::up().await?;
    } else {
        infra::reset().await?;
    }

    if deploy_only {
        println!("{} deploy complete, skipping tests", style("run").green().bold());
        return Ok(());
    }

    println!("{} running tests...", style("run").green().bold());

    let mut command = Command::new("cargo");
    command.arg("test").arg("--workspace");
    if let Some(pattern) = test_pattern {
        command.arg(pattern);
    }

    let status = command
        .status()
        .await
        .context("Failed to run cargo test")?;
    if !status.success() {
        bail!("tests failed ({})", status);
    }

    println!("{} all tests passed", style("run").green().bold());
    Ok(())
}
