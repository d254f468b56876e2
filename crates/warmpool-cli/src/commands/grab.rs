// Grab command: lease workers to generated requesters
//
// Each attempt uses a fresh requester id, so repeated runs simulate
// independent users hitting the pool.

use anyhow::{Context, Result};
use serde::Serialize;
use uuid::Uuid;
use warmpool::{Lease, LeaseService, PoolConfig};

use super::connect_store;
use crate::output::{print_table_header, print_table_row, OutputFormat};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GrabAttempt {
    requester: String,
    lease: Option<Lease>,
}

/// Requester id of the form `user_<8 hex>`, taken from the random tail of a v7 UUID
fn requester_id() -> String {
    let simple = Uuid::now_v7().simple().to_string();
    format!("user_{}", &simple[simple.len() - 8..])
}

pub async fn run(config: &PoolConfig, output: OutputFormat, count: usize) -> Result<()> {
    let store = connect_store(config).await?;
    let service = LeaseService::new(store);

    let mut attempts = Vec::with_capacity(count);
    for _ in 0..count {
        let requester = requester_id();
        let lease = service
            .grab(&requester)
            .await
            .with_context(|| format!("Grab for {} failed", requester))?;
        attempts.push(GrabAttempt { requester, lease });
    }

    if output.is_text() {
        print_table_header(&[("REQUESTER", 14), ("WORKER", 40), ("ADDRESS", 16)]);
        for attempt in &attempts {
            let (worker, address) = match &attempt.lease {
                Some(lease) => (lease.worker_id.to_string(), lease.network_address.clone()),
                None => ("(no worker available)".to_string(), "-".to_string()),
            };
            print_table_row(&[(&attempt.requester, 14), (&worker, 40), (&address, 16)]);
        }
    } else {
        output.print_value(&attempts)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requester_id_format() {
        let id = requester_id();
        assert_eq!(id.len(), "user_".len() + 8);
        assert!(id.starts_with("user_"));
        assert!(id[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
