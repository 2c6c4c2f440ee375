use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pgmirror")]
#[command(about = "Mirror Postgres tables into SQLite through logical replication")]
#[command(version)]
pub struct Cli {
    /// Environment to load (loads .env.{ENV} instead of .env)
    #[arg(short, long, global = true)]
    pub env: Option<String>,

    /// Path to pgmirror.toml config file
    #[arg(short, long, global = true, default_value = "pgmirror.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register the configured tables and stream changes until Ctrl-C
    Run {
        /// Keep the slot and publication on shutdown, overriding drop_on_shutdown
        #[arg(long)]
        keep_slot: bool,
    },

    /// Validate the config and report slot, publication and table status
    Check,

    /// Drop the replication slot and publication
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Run a read query against the local store
    Query {
        /// SQL to execute
        sql: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["pgmirror", "run", "--config", "mirror.toml", "--env", "staging"]);
        assert_eq!(cli.config, PathBuf::from("mirror.toml"));
        assert_eq!(cli.env.as_deref(), Some("staging"));
        assert!(matches!(cli.command, Commands::Run { keep_slot: false }));
    }

    #[test]
    fn test_reset_flags() {
        let cli = Cli::parse_from(["pgmirror", "reset", "-y"]);
        assert!(matches!(cli.command, Commands::Reset { yes: true }));
        assert_eq!(cli.config, PathBuf::from("pgmirror.toml"));
    }
}
