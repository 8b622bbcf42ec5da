//! Stalled-job reclaimer.
//!
//! A lease held past the stall threshold means the worker crashed, lost
//! its network, or was abandoned at shutdown. The reclaimer sweeps on a
//! fixed period and returns such jobs to the ready state through the
//! store's conditional update, so it is safe to run concurrently with
//! itself and with normal lease/complete traffic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::JobId;
use crate::store::JobStore;
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// Sweep period.
    pub interval: Duration,
    /// Lease age beyond which a `doing` job counts as stalled.
    pub stall_threshold: Duration,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            stall_threshold: Duration::from_secs(600),
        }
    }
}

#[derive(Clone)]
pub struct Reclaimer {
    store: Arc<dyn JobStore>,
    config: ReclaimerConfig,
    shutdown: Arc<Notify>,
}

impl Reclaimer {
    pub fn new(store: Arc<dyn JobStore>, config: ReclaimerConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run one sweep. Reclaimed jobs keep the attempt already counted by
    /// their lease.
    pub async fn sweep(&self) -> Result<Vec<JobId>> {
        let reclaimed = self
            .store
            .reclaim_stalled(self.config.stall_threshold)
            .await?;

        if reclaimed.is_empty() {
            debug!("no stalled jobs found");
        } else {
            warn!(count = reclaimed.len(), "stalled jobs returned to ready");
            for id in &reclaimed {
                info!(id = %id, "reclaimed stalled job");
            }
            metrics::jobs_reclaimed().add(reclaimed.len() as u64, &[]);
        }
        Ok(reclaimed)
    }

    /// Sweep on a fixed period until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stall_threshold_secs = self.config.stall_threshold.as_secs(),
            "reclaimer started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("reclaimer shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            // Store trouble skips the sweep; the next period retries.
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "reclaim sweep failed, backing off");
            }
        }
    }
}
