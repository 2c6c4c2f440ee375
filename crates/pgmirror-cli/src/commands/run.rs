use anyhow::{Context, Result};
use colored::Colorize;
use pgmirror_config::{ProjectConfig, ReplicationConfig};
use pgmirror_pg::{format_lsn, PgSource};
use pgmirror_replica::{Engine, EngineConfig};
use pgmirror_store::LocalStore;
use tracing::{info, warn};

use crate::APPLICATION_NAME;

pub fn engine_config(replication: &ReplicationConfig) -> EngineConfig {
    EngineConfig {
        slot_name: replication.slot_name.clone(),
        publication_name: replication.publication_name().to_string(),
        status_interval: replication.status_interval(),
        reconnect_backoff: replication.reconnect_backoff(),
        max_backoff: replication.max_backoff(),
        max_reconnect_attempts: replication.max_reconnect_attempts,
    }
}

pub async fn cmd_run(config: ProjectConfig, keep_slot: bool) -> Result<()> {
    info!("Starting pgmirror replication");

    let connection_string = config.connection_string()?;
    let source = PgSource::connect(&connection_string, APPLICATION_NAME)
        .await
        .context("Failed to connect to Postgres")?;
    let store = LocalStore::open(&config.store.path)
        .with_context(|| format!("Failed to open local store: {}", config.store.path))?;

    let engine = Engine::new(source, store, engine_config(&config.replication));
    let mut session = engine
        .start()
        .await
        .context("Failed to start replication")?;

    if config.tables.is_empty() {
        println!("{}", "No tables configured; streaming with an empty registry.".yellow());
    }
    for table in &config.tables {
        match engine
            .register_table(&table.name, table.snapshot, table.filter_query.as_deref())
            .await
        {
            Ok(()) => println!("  {} {}", "✓".green(), table.name),
            Err(e) => eprintln!("  {} {}: {}", "✗".red(), table.name, e),
        }
    }

    println!(
        "{}",
        format!("Replicating into {} (Ctrl-C to stop)", config.store.path).green()
    );

    let lsn = session.subscribe_lsn();
    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            None
        }
        result = session.wait() => Some(result),
    };

    let result = match finished {
        Some(result) => result,
        None => {
            println!("\nShutting down...");
            session.shutdown().await
        }
    };
    let lsn = *lsn.borrow();
    info!(lsn = %format_lsn(lsn), "Replication stopped");

    // A failed session keeps its slot so the next run resumes from it.
    if let Err(e) = result {
        return Err(e).context("Replication session failed");
    }

    if config.replication.drop_on_shutdown && !keep_slot {
        engine
            .close()
            .await
            .context("Failed to drop replication slot and publication")?;
        println!("{}", "Dropped replication slot and publication.".green());
    } else {
        warn!(
            slot = %config.replication.slot_name,
            "Replication slot kept; it retains WAL until the next run"
        );
    }
    Ok(())
}
