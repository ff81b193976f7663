//! Container Collector
//!
//! Reconciles container bookkeeping with the workers. Hijacked containers
//! whose owner finished get a grace period and are left to the worker until
//! it expires; their rows go once the worker no longer knows them. Other
//! containers whose owner finished are marked destroying, destroyed on their
//! worker and only then dropped from bookkeeping. Problems with a single
//! container are logged and skipped so one broken worker cannot stall the
//! rest of the sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use skiff_client::ContainerService;
use skiff_core::domain::container::ContainerRecord;
use skiff_core::domain::worker::Worker;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::RegistryError;
use crate::provider::ClientFactory;
use crate::registry::{ContainerRepository, WorkerRegistry};

/// How long a released hijacked container stays around on its worker
pub const HIJACKED_CONTAINER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Outcome of one collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionReport {
    /// Hijacked containers handed over for destruction
    pub released: Vec<String>,

    /// Containers newly marked destroying
    pub marked: u64,

    /// Containers destroyed and removed from bookkeeping
    pub destroyed: Vec<String>,

    /// Released hijacked containers still running out their grace time
    pub lingering: Vec<String>,

    /// Containers left in place for the next pass
    pub skipped: Vec<String>,
}

pub struct ContainerCollector {
    registry: Arc<dyn WorkerRegistry>,
    containers: Arc<dyn ContainerRepository>,
    clients: Arc<dyn ClientFactory>,
    hijacked_timeout: Duration,
    interval: Duration,
}

impl ContainerCollector {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        containers: Arc<dyn ContainerRepository>,
        clients: Arc<dyn ClientFactory>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            containers,
            clients,
            hijacked_timeout: HIJACKED_CONTAINER_TIMEOUT,
            interval,
        }
    }

    pub fn with_hijacked_timeout(mut self, timeout: Duration) -> Self {
        self.hijacked_timeout = timeout;
        self
    }

    /// Runs one collection pass.
    ///
    /// Fails only when the workers or the containers to collect cannot be
    /// listed; per-container problems end up in the report's `skipped`.
    pub async fn run_once(&self) -> Result<CollectionReport, RegistryError> {
        let workers: HashMap<String, Worker> = self
            .registry
            .workers()
            .await?
            .into_iter()
            .map(|worker| (worker.name.clone(), worker))
            .collect();

        let mut report = CollectionReport::default();

        for container in self.containers.find_hijacked_containers_for_deletion().await? {
            if self.release_hijacked(&workers, &container).await {
                report.released.push(container.handle);
            } else {
                report.skipped.push(container.handle);
            }
        }

        report.marked = self.containers.mark_containers_for_deletion().await?;

        let doomed = self.containers.find_containers_marked_for_deletion().await?;
        debug!(
            containers = ?doomed.iter().map(|c| c.handle.as_str()).collect::<Vec<_>>(),
            "Found containers marked for deletion"
        );

        for container in doomed {
            match self.destroy(&workers, &container).await {
                Destroyed::Yes => report.destroyed.push(container.handle),
                Destroyed::Lingering => report.lingering.push(container.handle),
                Destroyed::No => report.skipped.push(container.handle),
            }
        }

        if !report.released.is_empty() || !report.destroyed.is_empty() {
            info!(
                released = report.released.len(),
                marked = report.marked,
                destroyed = report.destroyed.len(),
                skipped = report.skipped.len(),
                "Container collection complete"
            );
        }

        Ok(report)
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            hijacked_timeout_secs = self.hijacked_timeout.as_secs(),
            "Starting container collector"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Container collection failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Container collector shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn service_for(
        &self,
        workers: &HashMap<String, Worker>,
        container: &ContainerRecord,
    ) -> Option<Arc<dyn ContainerService>> {
        let Some(worker) = workers.get(&container.worker_name) else {
            info!(worker = %container.worker_name, handle = %container.handle, "Worker not found");
            return None;
        };

        match self.clients.container_service(worker) {
            Ok(service) => Some(service),
            Err(e) => {
                warn!(worker = %worker.name, error = %e, "Failed to get container client for worker");
                None
            }
        }
    }

    async fn release_hijacked(
        &self,
        workers: &HashMap<String, Worker>,
        container: &ContainerRecord,
    ) -> bool {
        let Some(service) = self.service_for(workers, container) else {
            return false;
        };

        match service.lookup(&container.handle).await {
            Ok(live) => {
                if let Err(e) = live.set_grace_time(self.hijacked_timeout).await {
                    error!(handle = %container.handle, error = %e, "Failed to set grace time on hijacked container");
                    return false;
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(handle = %container.handle, "Hijacked container not found on worker");
            }
            Err(e) => {
                error!(handle = %container.handle, error = %e, "Failed to look up hijacked container");
                return false;
            }
        }

        self.mark_destroying(&container.handle).await
    }

    async fn mark_destroying(&self, handle: &str) -> bool {
        match self.containers.mark_container_destroying(handle).await {
            Ok(marked) => marked,
            Err(e) => {
                error!(handle = %handle, error = %e, "Failed to mark container as destroying");
                false
            }
        }
    }

    async fn destroy(
        &self,
        workers: &HashMap<String, Worker>,
        container: &ContainerRecord,
    ) -> Destroyed {
        let Some(service) = self.service_for(workers, container) else {
            return Destroyed::No;
        };

        if container.hijacked {
            // The grace time set on release does the destroying
            match service.lookup(&container.handle).await {
                Ok(_) => {
                    debug!(handle = %container.handle, "Hijacked container still within its grace time");
                    return Destroyed::Lingering;
                }
                Err(e) if e.is_not_found() => {
                    debug!(handle = %container.handle, "Hijacked container expired on worker");
                }
                Err(e) => {
                    error!(handle = %container.handle, error = %e, "Failed to look up hijacked container");
                    return Destroyed::No;
                }
            }
        } else {
            match service.destroy(&container.handle).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(handle = %container.handle, "Container already gone from worker");
                }
                Err(e) => {
                    error!(handle = %container.handle, error = %e, "Failed to destroy container on worker");
                    return Destroyed::No;
                }
            }
        }

        match self.containers.delete_container(&container.handle).await {
            Ok(true) => {
                debug!(handle = %container.handle, "Deleted container");
                Destroyed::Yes
            }
            Ok(false) => {
                info!(handle = %container.handle, "Container row already gone");
                Destroyed::No
            }
            Err(e) => {
                error!(handle = %container.handle, error = %e, "Failed to delete container row");
                Destroyed::No
            }
        }
    }
}

enum Destroyed {
    Yes,
    Lingering,
    No,
}
