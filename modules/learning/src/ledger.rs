//! Processed-event ledger retention
//!
//! Ledger entries only need to outlive the redelivery window of their event.
//! The sweeper drops older entries on a fixed interval.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::repos::{EnrollmentStore, StoreError, StoreResult};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct LedgerSweeper {
    store: Arc<dyn EnrollmentStore>,
    retention: Duration,
}

impl LedgerSweeper {
    pub fn new(store: Arc<dyn EnrollmentStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Prune entries older than the retention window, returning how many
    pub async fn sweep_once(&self) -> StoreResult<u64> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| StoreError::Serialization(format!("retention out of range: {}", e)))?;
        let cutoff = Utc::now() - retention;

        let pruned = self.store.prune_processed(cutoff).await?;
        if pruned > 0 {
            tracing::info!(pruned, cutoff = %cutoff, "Pruned processed-event ledger");
        }
        Ok(pruned)
    }

    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once().await {
                tracing::error!(error = %e, "Ledger sweep failed");
            }
        }
    }
}
