//! Retention pruning and its scheduled job.

use crate::error::{Result, SyncError};
use crate::store::ChangeStore;
use crate::types::Timestamp;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of one prune run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: u64,
    pub cutoff: Timestamp,
}

/// Deletes change-log entries older than the retention window.
///
/// The window must exceed the longest time a client can stay offline;
/// otherwise that client's cursor stops resolving and it has to resync.
#[derive(Clone)]
pub struct RetentionPruner {
    store: Arc<ChangeStore>,
}

impl RetentionPruner {
    pub fn new(store: Arc<ChangeStore>) -> Self {
        Self { store }
    }

    /// Delete entries with `created_at < now - older_than`.
    pub fn prune(&self, older_than: Duration) -> Result<PruneReport> {
        let cutoff = self.store.now().saturating_sub(older_than);
        let deleted = self.store.prune_before(cutoff)?;

        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff.to_rfc3339(), "pruned change log");
        } else {
            tracing::debug!(cutoff = %cutoff.to_rfc3339(), "nothing to prune");
        }

        Ok(PruneReport { deleted, cutoff })
    }

    pub fn prune_days(&self, days: u32) -> Result<PruneReport> {
        if days == 0 {
            return Err(SyncError::Prune("retention must be at least one day".into()));
        }
        self.prune(DAY * days)
    }
}

/// Background thread that runs a [`RetentionPruner`] on a fixed interval.
///
/// A failed run is logged and retried on the next tick.
pub struct RetentionScheduler {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RetentionScheduler {
    pub fn spawn(pruner: RetentionPruner, retention: Duration, interval: Duration) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let handle = thread::Builder::new()
            .name("retention-pruner".into())
            .spawn(move || {
                tracing::info!(?retention, ?interval, "retention scheduler started");
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if let Err(e) = pruner.prune(retention) {
                                tracing::error!(error = %e, "scheduled prune failed");
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                tracing::info!("retention scheduler stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for an in-flight prune to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Dropping the sender disconnects the channel and wakes the select.
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("retention scheduler thread panicked");
            }
        }
    }
}

impl Drop for RetentionScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::StoreConfig;
    use crate::types::{EntityType, OpType};
    use tempfile::TempDir;

    fn store_with_clock(dir: &TempDir, clock: Arc<ManualClock>) -> Arc<ChangeStore> {
        let config = StoreConfig {
            path: dir.path().join("store"),
            ..Default::default()
        };
        Arc::new(ChangeStore::open_or_create_with_clock(config, clock).unwrap())
    }

    #[test]
    fn test_prune_days_rejects_zero() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let pruner = RetentionPruner::new(store_with_clock(&dir, clock));
        assert!(matches!(pruner.prune_days(0), Err(SyncError::Prune(_))));
    }

    #[test]
    fn test_scheduler_prunes_and_stops() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Timestamp(1_000_000_000_000)));
        let store = store_with_clock(&dir, clock.clone());

        store
            .record_change(EntityType::Place, Some("p1"), OpType::Create, None)
            .unwrap();
        clock.advance(DAY * 10);

        let scheduler = RetentionScheduler::spawn(
            RetentionPruner::new(Arc::clone(&store)),
            DAY,
            Duration::from_millis(10),
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.stats().entry_count > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        scheduler.shutdown();

        assert_eq!(store.stats().entry_count, 0);
        assert_eq!(store.current_version(EntityType::Place, Some("p1")).0, 1);
    }
}
