// Seed command: bulk-launch workers into the pool

use anyhow::{bail, Result};
use serde::Serialize;
use warmpool::PoolConfig;

use super::{connect_store, launcher};
use crate::output::{print_table_header, print_table_row, OutputFormat};

#[derive(Debug, Serialize)]
struct SeedOutcome {
    worker_id: Option<String>,
    network_address: Option<String>,
    error: Option<String>,
}

pub async fn run(
    config: &PoolConfig,
    output: OutputFormat,
    count: usize,
    concurrency: usize,
) -> Result<()> {
    if count == 0 {
        bail!("count must be at least 1");
    }

    let store = connect_store(config).await?;
    let launcher = launcher(config, store)?;

    let outcomes: Vec<SeedOutcome> = launcher
        .launch_many(count, concurrency)
        .await
        .into_iter()
        .map(|result| match result {
            Ok(record) => SeedOutcome {
                worker_id: Some(record.worker_id.to_string()),
                network_address: record.network_address,
                error: None,
            },
            Err(e) => SeedOutcome {
                worker_id: None,
                network_address: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();

    if output.is_text() {
        print_table_header(&[("WORKER", 40), ("ADDRESS", 16), ("ERROR", 40)]);
        for outcome in &outcomes {
            print_table_row(&[
                (outcome.worker_id.as_deref().unwrap_or("-"), 40),
                (outcome.network_address.as_deref().unwrap_or("-"), 16),
                (outcome.error.as_deref().unwrap_or("-"), 40),
            ]);
        }
        println!();
        println!("Launched {} of {} workers", count - failed, count);
    } else {
        output.print_value(&outcomes)?;
    }

    if failed > 0 {
        bail!("{} of {} launches failed", failed, count);
    }
    Ok(())
}
