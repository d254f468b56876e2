// Drain command: stop every worker and delete every record

use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;
use warmpool::{DrainController, PoolConfig};

use super::{connect_store, execution_service};
use crate::output::{print_field, OutputFormat};

fn confirm(partition: &str) -> Result<bool> {
    print!(
        "Stop every worker and delete every record in partition '{}'? [y/N] ",
        partition
    );
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

pub async fn run(config: &PoolConfig, output: OutputFormat, yes: bool) -> Result<()> {
    if !yes && !confirm(&config.partition)? {
        println!("Aborted");
        return Ok(());
    }

    let store = connect_store(config).await?;
    let controller = DrainController::new(store.clone(), execution_service(config)?);
    let report = controller.drain().await.context("Drain failed")?;

    // Nothing left to replenish for
    let pruned = store
        .prune_changes(Duration::ZERO)
        .await
        .context("Failed to clear the change feed")?;
    debug!(pruned, "cleared change feed");

    if output.is_text() {
        print_field("Scanned", &report.scanned.to_string());
        print_field("Stopped", &report.stopped.to_string());
        print_field("Stop failures", &report.stop_failures.to_string());
        print_field("Deleted", &report.deleted.to_string());
    } else {
        output.print_value(&report)?;
    }
    Ok(())
}
