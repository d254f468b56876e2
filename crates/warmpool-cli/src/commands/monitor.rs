// Monitor command: pool counts per status

use anyhow::Result;
use serde::Serialize;
use tracing::warn;
use warmpool::{LeaseService, PoolConfig, PoolCounts};

use super::connect_store;
use crate::output::{print_field, OutputFormat};

/// Operator-facing view of [`PoolCounts`]
#[derive(Debug, Serialize)]
struct PoolSummary<'a> {
    partition: &'a str,
    launching: usize,
    available: usize,
    occupied: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unavailable: Vec<String>,
}

impl<'a> PoolSummary<'a> {
    fn new(partition: &'a str, counts: &PoolCounts) -> Self {
        Self {
            partition,
            launching: counts.launching,
            available: counts.running,
            occupied: counts.assigned,
            unavailable: counts.unavailable.iter().map(|s| s.to_string()).collect(),
        }
    }
}

pub async fn run(config: &PoolConfig, output: OutputFormat) -> Result<()> {
    let store = connect_store(config).await?;
    let counts = LeaseService::new(store).monitor().await;
    if !counts.is_complete() {
        warn!(unavailable = ?counts.unavailable, "some counts could not be read");
    }

    let summary = PoolSummary::new(&config.partition, &counts);
    if output.is_text() {
        print_field("Partition", summary.partition);
        print_field("Launching", &summary.launching.to_string());
        print_field("Available", &summary.available.to_string());
        print_field("Occupied", &summary.occupied.to_string());
        if !summary.unavailable.is_empty() {
            print_field("Unavailable", &summary.unavailable.join(", "));
        }
    } else {
        output.print_value(&summary)?;
    }

    Ok(())
}
