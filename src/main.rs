use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use dbvec::cli::commands::{
    handle_cancel, handle_config, handle_extract, handle_health, handle_search, handle_serve,
    handle_stats, handle_status, runs_daemon,
};
use dbvec::cli::{Cli, Commands, Context};
use dbvec::models::Config;

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_or_default(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load().context("failed to load config"),
    }
}

fn init_logging(config: &Config, verbose: bool, daemon: bool) -> Result<()> {
    let default_level = match (verbose, daemon) {
        (true, _) => "dbvec=debug",
        (false, true) => "dbvec=info",
        (false, false) => "dbvec=warn",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if daemon {
        let log_path = config.log_path();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open {}", log_path.display()))?;
        builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to set tracing subscriber: {e}"))
    } else {
        builder
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to set tracing subscriber: {e}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let is_daemon = matches!(cli.command, Commands::Serve(ref args) if runs_daemon(args));
    let file_logging = matches!(cli.command, Commands::Serve(ref args) if args.daemon);
    init_logging(&config, cli.verbose, file_logging)?;

    let ctx = Context {
        format: cli.format.unwrap_or(config.search.default_format),
        verbose: cli.verbose,
        config_path: cli.config,
        config,
    };

    // the daemon installs its own signal handling and cleans up on exit
    if is_daemon {
        return run_command(cli.command, &ctx).await;
    }

    tokio::select! {
        result = run_command(cli.command, &ctx) => {
            result?;
        }
        _ = shutdown_signal() => {
            eprintln!("\nInterrupted");
        }
    }

    Ok(())
}

async fn run_command(command: Commands, ctx: &Context) -> Result<()> {
    match command {
        Commands::Serve(args) => handle_serve(args, ctx).await,
        Commands::Extract(args) => handle_extract(args, ctx).await,
        Commands::Status(args) => handle_status(args, ctx).await,
        Commands::Cancel(args) => handle_cancel(args, ctx).await,
        Commands::Stats => handle_stats(ctx).await,
        Commands::Search(args) => handle_search(args, ctx).await,
        Commands::Health => handle_health(ctx).await,
        Commands::Config(cmd) => handle_config(cmd, ctx).await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
