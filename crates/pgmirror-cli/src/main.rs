use anyhow::{Context, Result};
use clap::Parser;

mod cli;
mod commands;
mod env;

use cli::{Cli, Commands};
use commands::{cmd_check, cmd_query, cmd_reset, cmd_run};
use pgmirror_config::ProjectConfig;

/// Reported to the server as `application_name`.
pub const APPLICATION_NAME: &str = "pgmirror";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pgmirror=info".parse().context("Invalid log directive")?),
        )
        .init();

    let cli = Cli::parse();
    env::load_dotenv(cli.env.as_deref())?;

    let config = ProjectConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config: {}", cli.config.display()))?;

    match cli.command {
        Commands::Run { keep_slot } => cmd_run(config, keep_slot).await,
        Commands::Check => cmd_check(config).await,
        Commands::Reset { yes } => cmd_reset(config, yes).await,
        Commands::Query { sql } => cmd_query(config, &sql),
    }
}
