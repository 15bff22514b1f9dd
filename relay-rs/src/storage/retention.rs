//! Retention sweeper
//!
//! Removes message directories older than the storage horizon from every
//! lifecycle folder. A failure on one directory is logged and the sweep
//! carries on with the rest.

use crate::storage::message_store::MessageStore;
use crate::storage::types::Folder;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub retained: usize,
    pub errors: usize,
}

pub struct RetentionSweeper {
    store: Arc<MessageStore>,
    max_age: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<MessageStore>, max_age: Duration) -> Self {
        Self { store, max_age }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now()).await
    }

    /// Sweep as if the current time were `now`
    pub async fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = now.checked_sub(self.max_age).unwrap_or(SystemTime::UNIX_EPOCH);

        for folder in Folder::ALL {
            let entries = match self.store.entries(folder).await {
                Ok(entries) => entries,
                Err(e) => {
                    error!("Retention: cannot list {}: {}", folder, e);
                    report.errors += 1;
                    continue;
                }
            };

            for entry in entries {
                if entry.modified >= cutoff {
                    report.retained += 1;
                    continue;
                }

                match self.store.remove(folder, &entry.id).await {
                    Ok(()) => {
                        debug!("Retention: removed {} from {}", entry.id, folder);
                        report.removed += 1;
                    }
                    Err(e) => {
                        error!("Retention: failed to remove {:?}: {}", entry.path, e);
                        report.errors += 1;
                    }
                }
            }
        }

        info!(
            "Retention sweep: {} removed, {} retained, {} error(s)",
            report.removed, report.retained, report.errors
        );
        report
    }

    /// Sweep every `every` until `cancel` fires
    pub async fn run(self, every: Duration, cancel: CancellationToken) {
        info!("Starting retention sweeper (every {:?}, horizon {:?})", every, self.max_age);

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Retention sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}
