// Reap command: stop and delete leased workers

use anyhow::{Context, Result};
use serde_json::json;
use warmpool::{DrainController, PoolConfig};

use super::{connect_store, execution_service};
use crate::output::OutputFormat;

pub async fn run(config: &PoolConfig, output: OutputFormat, max: usize) -> Result<()> {
    let store = connect_store(config).await?;
    let controller = DrainController::new(store, execution_service(config)?);

    let reaped = controller
        .reap_assigned(max)
        .await
        .context("Reaping assigned workers failed")?;

    if output.is_text() {
        println!("Reaped {} assigned worker(s)", reaped);
    } else {
        output.print_value(&json!({ "reaped": reaped }))?;
    }
    Ok(())
}
