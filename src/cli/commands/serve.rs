use anyhow::Result;
use clap::{Args, Subcommand};

use crate::cli::Context;
use crate::client::stop_daemon;
use crate::error::DaemonError;
use crate::models::Config;
use crate::server::run_daemon;

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[command(subcommand)]
    pub command: Option<ServeCommand>,

    #[arg(long, hide = true)]
    pub daemon: bool,

    #[arg(long, help = "Run in the foreground, logging to stderr")]
    pub foreground: bool,
}

#[derive(Debug, Subcommand)]
pub enum ServeCommand {
    /// Stop the running daemon
    Stop,
    /// Stop, then start the daemon
    Restart,
}

/// True when this invocation runs the daemon itself.
pub fn runs_daemon(args: &ServeArgs) -> bool {
    args.command.is_none() && (args.daemon || args.foreground)
}

pub async fn handle_serve(args: ServeArgs, ctx: &Context) -> Result<()> {
    if runs_daemon(&args) {
        run_daemon(ctx.config.clone()).await?;
        return Ok(());
    }

    match args.command {
        Some(ServeCommand::Stop) => handle_stop(&ctx.config),
        Some(ServeCommand::Restart) => handle_restart(ctx).await,
        None => handle_start(ctx),
    }
}

fn handle_start(ctx: &Context) -> Result<()> {
    let client = ctx.client();

    if client.is_running() {
        println!("Daemon is already running");
        return Ok(());
    }

    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(&exe);
    if let Some(ref path) = ctx.config_path {
        command.arg("--config").arg(path);
    }
    command
        .args(["serve", "--daemon"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    println!("Daemon started");
    println!("Socket: {}", ctx.config.socket_path().display());
    println!("Log:    {}", ctx.config.log_path().display());
    Ok(())
}

fn handle_stop(config: &Config) -> Result<()> {
    match stop_daemon(config) {
        Ok(_) => {
            println!("Daemon stopped");
            Ok(())
        }
        Err(DaemonError::NotRunning) => {
            println!("Daemon is not running");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn handle_restart(ctx: &Context) -> Result<()> {
    let _ = stop_daemon(&ctx.config);
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    handle_start(ctx)
}
