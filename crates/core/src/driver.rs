//! Background driver that runs [`SyncOrchestrator::tick`] on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use runsync_engine::ExecutionEngine;
use runsync_storage::SyncStorage;

use crate::orchestrator::SyncOrchestrator;

/// Periodic sync loop. Ticks once immediately, then every `interval`,
/// until the shutdown channel flips to `true` or its sender is dropped.
pub struct SyncDriver<E, S> {
    orchestrator: Arc<SyncOrchestrator<E, S>>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<E, S> SyncDriver<E, S>
where
    E: ExecutionEngine,
    S: SyncStorage,
{
    pub fn new(
        orchestrator: Arc<SyncOrchestrator<E, S>>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            orchestrator,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            page_size = self.orchestrator.settings().page_size,
            "sync driver started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("sync driver shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.orchestrator.tick().await {
                        error!(error = %e, "sync tick failed");
                    }
                }
            }
        }
    }
}

/// Spawn a [`SyncDriver`] on the current runtime.
///
/// Send `true` on the returned sender to stop it; the join handle resolves
/// once the in-flight tick (if any) has finished.
pub fn spawn_sync_driver<E, S>(
    orchestrator: Arc<SyncOrchestrator<E, S>>,
    interval: Duration,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>)
where
    E: ExecutionEngine,
    S: SyncStorage,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = SyncDriver::new(orchestrator, interval, shutdown_rx);
    let handle = tokio::spawn(driver.run());
    (handle, shutdown_tx)
}
