use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};

use crate::cli::Context;
use crate::models::{ExtractRequest, ExtractionRun, OutputFormat, RunStatus};

#[derive(Debug, Args)]
pub struct ExtractArgs {
    #[arg(long, short = 'p', help = "Catalog project (defaults to catalog.project_id)")]
    pub project: Option<String>,

    #[arg(long, help = "Re-embed every column instead of reusing unchanged vectors")]
    pub force_refresh: bool,

    #[arg(long, short = 'w', help = "Wait for the run to finish")]
    pub wait: bool,
}

pub async fn handle_extract(args: ExtractArgs, ctx: &Context) -> Result<()> {
    let client = ctx.client();
    let formatter = ctx.formatter();

    let request = ExtractRequest {
        project_id: args.project,
        force_refresh: args.force_refresh,
    };
    let run = client
        .extract(request)
        .await
        .context("failed to start extraction")?;

    if !args.wait {
        print!("{}", formatter.format_run(&run));
        return Ok(());
    }

    let poll = Duration::from_millis(ctx.config.daemon.poll_interval_ms.max(50));
    let pb = (ctx.format == OutputFormat::Text).then(|| spinner(&run));

    let mut current = run;
    while current.status.is_active() {
        tokio::time::sleep(poll).await;
        current = client
            .run_status(Some(current.run_id.clone()), None)
            .await
            .context("failed to poll run status")?;
        if let Some(ref pb) = pb {
            pb.set_message(progress_message(&current));
        }
    }

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    print!("{}", formatter.format_run(&current));

    if current.status == RunStatus::Failed {
        anyhow::bail!(
            "extraction failed: {}",
            current.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn spinner(run: &ExtractionRun) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) =
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")
    {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(progress_message(run));
    pb
}

fn progress_message(run: &ExtractionRun) -> String {
    format!(
        "{} {}: {} datasets, {} tables, {} records",
        run.project_id,
        run.status,
        run.datasets_processed,
        run.tables_processed,
        run.records_processed
    )
}
