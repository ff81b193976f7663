//! Worker Lifecycle Manager
//!
//! Moves workers through running → landing → landed, running → retiring →
//! removed and running → stalled. Explicit requests (land, retire, prune)
//! go straight to the registry; the periodic sweep stalls workers whose
//! heartbeat expired and finishes draining workers no build pins anymore.
//! A retiring worker is only removed once the collector has reaped its
//! containers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use skiff_core::domain::worker::Worker;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::RegistryError;
use crate::registry::WorkerRegistry;

/// Outcome of one lifecycle sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stalled: Vec<String>,
    pub landed: Vec<String>,
    pub retired: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stalled.is_empty() && self.landed.is_empty() && self.retired.is_empty()
    }
}

/// How long a registration stays valid without a heartbeat
pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(30);

pub struct WorkerLifecycle {
    registry: Arc<dyn WorkerRegistry>,
    interval: Duration,
    heartbeat_ttl: Duration,
}

impl WorkerLifecycle {
    pub fn new(registry: Arc<dyn WorkerRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            heartbeat_ttl: DEFAULT_HEARTBEAT_TTL,
        }
    }

    /// A zero ttl registers workers that never stall
    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    /// Registers a worker, or refreshes its registration
    pub async fn register(&self, worker: &Worker) -> Result<Worker, RegistryError> {
        let saved = self.registry.save_worker(worker, self.heartbeat_ttl).await?;
        info!(
            worker = %saved.name,
            state = %saved.state,
            uptime_secs = saved.uptime(Utc::now()).num_seconds(),
            "Registered worker"
        );
        Ok(saved)
    }

    pub async fn heartbeat(&self, worker: &Worker) -> Result<Worker, RegistryError> {
        let refreshed = self.registry.heartbeat_worker(worker, self.heartbeat_ttl).await?;
        debug!(worker = %refreshed.name, state = %refreshed.state, "Worker heartbeat");
        Ok(refreshed)
    }

    pub async fn land(&self, name: &str) -> Result<(), RegistryError> {
        self.registry.land_worker(name).await?;
        info!(worker = %name, "Worker landing");
        Ok(())
    }

    pub async fn retire(&self, name: &str) -> Result<(), RegistryError> {
        self.registry.retire_worker(name).await?;
        info!(worker = %name, "Worker retiring");
        Ok(())
    }

    /// Removes a worker that is not running. Its containers stay in
    /// bookkeeping until the collector reaps them.
    pub async fn prune(&self, name: &str) -> Result<(), RegistryError> {
        self.registry.prune_worker(name).await?;
        info!(worker = %name, "Pruned worker");
        Ok(())
    }

    /// Runs the three sweeps once. A failing sweep is logged and does not
    /// keep the others from running.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.registry.stall_unresponsive_workers().await {
            Ok(stalled) => report.stalled = stalled,
            Err(e) => error!(error = %e, "Failed to stall unresponsive workers"),
        }

        match self.registry.land_finished_landing_workers().await {
            Ok(landed) => report.landed = landed,
            Err(e) => error!(error = %e, "Failed to land finished landing workers"),
        }

        match self.registry.delete_finished_retiring_workers().await {
            Ok(retired) => report.retired = retired,
            Err(e) => error!(error = %e, "Failed to delete finished retiring workers"),
        }

        if !report.is_empty() {
            info!(
                stalled = ?report.stalled,
                landed = ?report.landed,
                retired = ?report.retired,
                "Lifecycle sweep complete"
            );
        }

        report
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting worker lifecycle manager"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Worker lifecycle manager shutting down");
                        break;
                    }
                }
            }
        }
    }
}
