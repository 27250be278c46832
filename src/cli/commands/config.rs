use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Subcommand;

use crate::cli::Context;
use crate::models::{Config, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    #[command(about = "Write a default configuration file")]
    Init {
        #[arg(long, short = 'f', help = "Force overwrite existing config")]
        force: bool,
    },
    #[command(about = "Show the effective configuration")]
    Show,
    #[command(about = "Show configuration and data paths")]
    Path,
}

pub async fn handle_config(cmd: ConfigCommand, ctx: &Context) -> Result<()> {
    match cmd {
        ConfigCommand::Init { force } => handle_init(force, ctx),
        ConfigCommand::Show => handle_show(ctx),
        ConfigCommand::Path => handle_path(ctx),
    }
}

fn target_path(ctx: &Context) -> Result<PathBuf> {
    ctx.config_path
        .clone()
        .or_else(Config::config_path)
        .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))
}

fn handle_init(force: bool, ctx: &Context) -> Result<()> {
    let path = target_path(ctx)?;
    if path.exists() && !force {
        anyhow::bail!(
            "Config already exists at: {}\nUse --force to overwrite.",
            path.display()
        );
    }

    Config::default()
        .save_to(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    print!(
        "{}",
        ctx.formatter()
            .format_message(&format!("Created config at: {}", path.display()))
    );
    Ok(())
}

/// Effective config with secrets masked.
fn redacted(config: &Config) -> Config {
    let mask = |secret: &Option<String>| secret.as_ref().map(|_| "********".to_string());
    let mut config = config.clone();
    config.embedding.api_key = mask(&config.embedding.api_key);
    config.catalog.access_token = mask(&config.catalog.access_token);
    config.catalog.database_url = mask(&config.catalog.database_url);
    config.index.url = mask(&config.index.url);
    config
}

fn handle_show(ctx: &Context) -> Result<()> {
    let config = redacted(&ctx.config);

    if ctx.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if let Ok(path) = target_path(ctx)
        && path.exists()
    {
        println!("# Config: {}", path.display());
        println!();
    }
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn handle_path(ctx: &Context) -> Result<()> {
    let config_path = target_path(ctx)?;

    if ctx.format == OutputFormat::Json {
        let output = serde_json::json!({
            "config": config_path,
            "config_exists": config_path.exists(),
            "index": ctx.config.index_path(),
            "socket": ctx.config.socket_path(),
            "pid": ctx.config.pid_path(),
            "log": ctx.config.log_path(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let state = if config_path.exists() {
        "active"
    } else {
        "would be"
    };
    println!("Config ({state}): {}", config_path.display());
    println!("Index:         {}", ctx.config.index_path().display());
    println!("Socket:        {}", ctx.config.socket_path().display());
    println!("PID file:      {}", ctx.config.pid_path().display());
    println!("Daemon log:    {}", ctx.config.log_path().display());

    if let Ok(cwd) = std::env::current_dir() {
        let env_path = cwd.join(".env");
        if env_path.exists() {
            println!(".env (active): {}", env_path.display());
        }
    }
    Ok(())
}
