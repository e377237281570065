use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::error::{FleetError, Result};
use crate::store::{MemoryStore, SqliteStore, Store};

/// Open the store named by `config`: SQLite when a database path is set,
/// otherwise an in-memory store that lives as long as the process.
pub fn open_store(config: &ServerConfig) -> Result<Arc<dyn Store>> {
    match &config.database {
        Some(path) => {
            let store = SqliteStore::open(path)?;
            tracing::info!(database = %path.display(), "Opened SQLite store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No database configured, state will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Drives the coordinator's periodic work.
///
/// The transport layer calls into the [`Coordinator`] directly; the node
/// only owns the two background loops:
/// 1. the scheduling loop, which matches pending jobs to idle agents
/// 2. the sweep loop, which takes silent agents offline and requeues their work
pub struct Node {
    coordinator: Arc<Coordinator>,
}

impl Node {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Run both loops until `shutdown` is cancelled.
    ///
    /// A pass that fails is logged and retried on the next tick; only a
    /// panicking loop ends `run` with an error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.coordinator.config().clone();
        tracing::info!(
            schedule_interval_ms = config.schedule_interval_ms,
            sweep_interval_ms = config.sweep_interval_ms,
            heartbeat_timeout_ms = config.heartbeat_timeout_ms,
            "Starting coordinator loops"
        );

        let scheduler = tokio::spawn(Self::schedule_loop(
            self.coordinator.clone(),
            config.schedule_interval(),
            shutdown.clone(),
        ));
        let sweeper = tokio::spawn(Self::sweep_loop(
            self.coordinator.clone(),
            config.sweep_interval(),
            shutdown.clone(),
        ));

        let (scheduled, swept) = tokio::join!(scheduler, sweeper);
        scheduled.map_err(|e| FleetError::Internal(format!("scheduling loop: {}", e)))?;
        swept.map_err(|e| FleetError::Internal(format!("sweep loop: {}", e)))?;

        tracing::info!("Coordinator loops stopped");
        Ok(())
    }

    async fn schedule_loop(
        coordinator: Arc<Coordinator>,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = coordinator.schedule().await {
                        tracing::error!(error = %e, "Scheduling pass failed");
                    }
                }
            }
        }
    }

    async fn sweep_loop(
        coordinator: Arc<Coordinator>,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = coordinator.sweep().await {
                        tracing::error!(error = %e, "Sweep failed");
                    }
                }
            }
        }
    }
}
