use anyhow::{Context as _, Result};
use clap::Args;

use crate::cli::Context;

#[derive(Debug, Args)]
pub struct CancelArgs {
    #[arg(long, short = 'p', help = "Project whose running extraction to cancel")]
    pub project: Option<String>,
}

pub async fn handle_cancel(args: CancelArgs, ctx: &Context) -> Result<()> {
    let project = args
        .project
        .or_else(|| ctx.config.catalog.project_id.clone())
        .ok_or_else(|| {
            anyhow::anyhow!("--project is required (no catalog.project_id configured)")
        })?;

    let run = ctx
        .client()
        .cancel(&project)
        .await
        .with_context(|| format!("failed to cancel extraction for {project}"))?;

    let formatter = ctx.formatter();
    print!(
        "{}",
        formatter.format_message(&format!("Cancellation requested for run {}", run.run_id))
    );
    Ok(())
}

pub async fn handle_stats(ctx: &Context) -> Result<()> {
    let stats = ctx.client().stats().await.context("failed to read index stats")?;
    print!("{}", ctx.formatter().format_stats(&stats));
    Ok(())
}

pub async fn handle_health(ctx: &Context) -> Result<()> {
    let client = ctx.client();
    client.ensure_running().await?;
    let health = client.health().await?;
    print!("{}", ctx.formatter().format_health(&health));

    if !health.all_healthy() {
        anyhow::bail!("one or more components are unhealthy");
    }
    Ok(())
}
