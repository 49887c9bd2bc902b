//! Prompt Sync - command line front end
//!
//! Opens the relational store, the flat store and the cloud manager from the
//! config file, then runs one command.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use prompt_sync::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { config.log_level.as_str() }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let app = cli::App::open(config)?;

    match cli.command {
        Commands::Status => app.status()?,
        Commands::Migrate => app.migrate()?,
        Commands::Rollback => app.rollback()?,
        Commands::List { query, favorites } => app.list(query.as_deref(), favorites)?,
        Commands::Export { file } => app.export(&file)?,
        Commands::Push => app.push().await?,
        Commands::Pull => app.pull().await?,
        Commands::Sync => app.sync().await?,
        Commands::Resolve { choice } => app.resolve(choice).await?,
        Commands::Watch { auto_sync } => app.watch(auto_sync).await?,
        Commands::TestConnection => app.test_connection().await?,
        Commands::Cloud { action } => app.configure_cloud(action).await?,
    }

    Ok(())
}
