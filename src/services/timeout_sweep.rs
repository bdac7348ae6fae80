// services/timeout_sweep.rs
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::database::TransactionStore;
use crate::errors::{AppError, Result};
use crate::models::transaction::{TransactionStatus, TransactionUpdate};

pub const TIMEOUT_DESCRIPTION: &str = "No callback received within timeout window";

/// Moves every `Pending` transaction older than `timeout` to `TimedOut`.
/// A transaction resolved by a callback in the meantime is skipped, and a store error on one
/// row is logged and left for the next tick while the remaining rows are still swept.
pub async fn sweep_once(
    store: &dyn TransactionStore,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Result<usize> {
    let timeout = chrono::Duration::from_std(timeout)
        .map_err(|e| AppError::configuration(format!("pending timeout out of range: {}", e)))?;
    let cutoff = now - timeout;

    let mut timed_out = 0;
    for txn in store.list_pending_created_before(cutoff).await? {
        let result = store
            .compare_and_set_status(
                &txn.id,
                TransactionStatus::Pending,
                TransactionUpdate::timed_out(TIMEOUT_DESCRIPTION),
            )
            .await;
        match result {
            Ok(true) => {
                info!("Transaction {} timed out", txn.checkout_request_id);
                timed_out += 1;
            }
            Ok(false) => {}
            Err(e) => error!(
                "Failed to time out transaction {}: {}",
                txn.checkout_request_id, e
            ),
        }
    }

    Ok(timed_out)
}

pub fn spawn_timeout_sweep(
    store: Arc<dyn TransactionStore>,
    timeout: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match sweep_once(store.as_ref(), timeout, Utc::now()).await {
                Ok(0) => {}
                Ok(count) => info!("Timeout sweep closed {} pending transactions", count),
                Err(e) => error!("Timeout sweep failed: {}", e),
            }
        }
    })
}
