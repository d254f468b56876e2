// Run command: keep the pool topped up
//
// store change feed -> ChangeObserver -> InMemoryEventBus -> ReplenishmentTrigger
//
// On Ctrl-C the observer is stopped; dropping it closes the bus, which ends
// the trigger's event stream once in-flight launches have finished.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use warmpool::{
    ChangeObserver, ChangeStream, EventBus, InMemoryEventBus, PoolConfig, ReplenishmentTrigger,
};

use super::{connect_store, launcher};
use crate::output::{print_field, OutputFormat};

pub async fn run(config: &PoolConfig, output: OutputFormat) -> Result<()> {
    let store = connect_store(config).await?;
    let launcher = launcher(config, store.clone())?;
    let bus = Arc::new(InMemoryEventBus::new());

    // Subscribe before observing so no lease is missed
    let trigger =
        ReplenishmentTrigger::new(launcher).with_max_in_flight(config.replenish_max_in_flight);
    let events = bus.subscribe();
    let replenishing = tokio::spawn(async move { trigger.run(events).await });

    let observer = ChangeObserver::new(bus);
    let changes = store.changes();
    let mut observing = tokio::spawn(async move { observer.run(changes).await });

    info!(
        partition = %config.partition,
        max_in_flight = config.replenish_max_in_flight,
        "replenisher running"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal");
            observing.abort();
        }
        ended = &mut observing => {
            warn!(published = ?ended.ok(), "change stream ended");
        }
    }

    let stats = replenishing
        .await
        .context("Replenishment task failed")?;

    if output.is_text() {
        print_field("Leases seen", &stats.received.to_string());
        print_field("Launched", &stats.launched.to_string());
        print_field("Failed", &stats.failed.to_string());
    } else {
        output.print_value(&stats)?;
    }
    Ok(())
}
