use anyhow::{Context, Result};
use colored::Colorize;
use dialoguer::Confirm;
use pgmirror_config::ProjectConfig;
use pgmirror_pg::{PgError, PgSource, Source};

use crate::APPLICATION_NAME;

pub async fn cmd_reset(config: ProjectConfig, yes: bool) -> Result<()> {
    let slot = &config.replication.slot_name;
    let publication = config.replication.publication_name();

    println!("This will drop from the source database:");
    println!("  - replication slot '{}'", slot);
    println!("  - publication '{}'", publication);
    println!("The next run starts over with fresh snapshots.\n");

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt("Drop the slot and publication?")
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let source = PgSource::connect(&config.connection_string()?, APPLICATION_NAME)
        .await
        .context("Failed to connect to Postgres")?;

    match source.drop_slot(slot).await {
        Ok(()) => println!("  {} Dropped slot '{}'", "✓".green(), slot),
        Err(PgError::SlotNotFound(_)) => println!("  - Slot '{}' did not exist", slot),
        Err(e) => return Err(e).context("Failed to drop replication slot"),
    }
    source
        .drop_publication(publication)
        .await
        .context("Failed to drop publication")?;
    println!("  {} Dropped publication '{}'", "✓".green(), publication);

    println!("\n{}", "Reset complete!".green());
    Ok(())
}
