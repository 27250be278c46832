use anyhow::Result;
use clap::Args;

use crate::cli::Context;
use crate::cli::output::StatusInfo;

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long, help = "Show a specific run")]
    pub run_id: Option<String>,

    #[arg(long, short = 'p', help = "Latest run of this project")]
    pub project: Option<String>,
}

pub async fn handle_status(args: StatusArgs, ctx: &Context) -> Result<()> {
    let client = ctx.client();
    let formatter = ctx.formatter();

    // a specific run: report just that run
    if args.run_id.is_some() || args.project.is_some() {
        let run = client.run_status(args.run_id, args.project).await?;
        print!("{}", formatter.format_run(&run));
        return Ok(());
    }

    let daemon_running = client.is_running();
    let status = if daemon_running {
        StatusInfo {
            daemon_running,
            socket_path: client.socket_path().display().to_string(),
            health: client.health().await.ok(),
            stats: client.stats().await.ok(),
            latest_run: client.run_status(None, None).await.ok(),
        }
    } else {
        StatusInfo {
            daemon_running,
            socket_path: client.socket_path().display().to_string(),
            health: None,
            stats: None,
            latest_run: None,
        }
    };

    print!("{}", formatter.format_status(&status));

    if !daemon_running {
        eprintln!();
        eprintln!("Hint: daemon not running. It starts automatically on extract/search,");
        eprintln!("      or start it manually with: dbvec serve");
    }

    Ok(())
}
