//! Worker Pool
//!
//! Matches placement specs against the running workers and picks one to
//! host new work. Matching is a pure function of the placement spec and
//! the resource types; the pick that follows is random and only spreads
//! load.

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use skiff_client::Container;
use skiff_core::domain::container::{ContainerOwner, ContainerSpec};
use skiff_core::domain::resource::VersionedResourceTypes;
use skiff_core::domain::worker::WorkerSpec;
use tracing::{debug, info};

use crate::error::PoolError;
use crate::provider::WorkerProvider;
use crate::worker::Worker;

/// Workers satisfying `spec`, team-owned workers taking precedence.
///
/// If any worker owned by the requesting team qualifies, only those are
/// returned; otherwise the qualifying general workers are.
pub fn compatible_workers(
    workers: &[Arc<dyn Worker>],
    spec: &WorkerSpec,
    resource_types: &VersionedResourceTypes,
) -> Vec<Arc<dyn Worker>> {
    let mut team_workers = Vec::new();
    let mut general_workers = Vec::new();

    for worker in workers {
        match worker.satisfies(spec, resource_types) {
            Ok(()) if worker.is_owned_by_team() => team_workers.push(Arc::clone(worker)),
            Ok(()) => general_workers.push(Arc::clone(worker)),
            Err(mismatch) => {
                debug!(worker = %worker.name(), reason = %mismatch, "Worker does not satisfy spec");
            }
        }
    }

    if team_workers.is_empty() {
        general_workers
    } else {
        team_workers
    }
}

/// Picks a worker, favouring those running fewer containers.
///
/// Each candidate's weight is `1 / (1 + active containers)`.
pub fn pick_least_loaded<'a, R: Rng + ?Sized>(
    rng: &mut R,
    candidates: &'a [Arc<dyn Worker>],
) -> Option<&'a Arc<dyn Worker>> {
    let weights: Vec<f64> = candidates
        .iter()
        .map(|worker| 1.0 / (1.0 + f64::from(worker.active_containers().max(0))))
        .collect();

    let total: f64 = weights.iter().sum();
    if candidates.is_empty() || total <= 0.0 {
        return None;
    }

    let mut point = rng.random_range(0.0..total);
    for (worker, weight) in candidates.iter().zip(&weights) {
        if point < *weight {
            return Some(worker);
        }
        point -= weight;
    }

    candidates.last()
}

/// Places work on workers
pub struct Pool {
    provider: Arc<dyn WorkerProvider>,
    rng: Mutex<StdRng>,
}

impl Pool {
    pub fn new(provider: Arc<dyn WorkerProvider>) -> Self {
        Self::with_rng(provider, StdRng::from_os_rng())
    }

    /// Pool drawing its random picks from `rng`
    pub fn with_rng(provider: Arc<dyn WorkerProvider>, rng: StdRng) -> Self {
        Self {
            provider,
            rng: Mutex::new(rng),
        }
    }

    pub async fn get_worker(&self, name: &str) -> Result<Arc<dyn Worker>, PoolError> {
        self.provider
            .get_worker(name)
            .await?
            .ok_or_else(|| PoolError::WorkerNotFound(name.to_string()))
    }

    /// Every running worker that can host `spec`
    pub async fn all_satisfying(
        &self,
        spec: &WorkerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> Result<Vec<Arc<dyn Worker>>, PoolError> {
        let workers = self.provider.running_workers(spec.team.as_deref()).await?;
        if workers.is_empty() {
            return Err(PoolError::NoWorkers);
        }

        let compatible = compatible_workers(&workers, spec, resource_types);
        if compatible.is_empty() {
            return Err(PoolError::NoCompatibleWorkers {
                spec: spec.clone(),
                workers: workers.iter().map(|w| w.name().to_string()).collect(),
            });
        }

        Ok(compatible)
    }

    /// One running worker that can host `spec`, chosen uniformly at random
    pub async fn satisfying(
        &self,
        spec: &WorkerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> Result<Arc<dyn Worker>, PoolError> {
        let compatible = self.all_satisfying(spec, resource_types).await?;

        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        compatible
            .choose(&mut *rng)
            .cloned()
            .ok_or(PoolError::NoWorkers)
    }

    /// The container `owner` already has, or a new one on a lightly loaded
    /// worker that can host `spec`
    pub async fn find_or_create_container(
        &self,
        owner: &ContainerOwner,
        spec: &ContainerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> Result<Arc<dyn Container>, PoolError> {
        if let Some(worker) = self.provider.find_worker_for_container(owner).await? {
            debug!(worker = %worker.name(), "Reusing worker already hosting owner");
            return worker
                .find_or_create_container(owner, spec, resource_types)
                .await;
        }

        let compatible = self.all_satisfying(&spec.worker_spec(), resource_types).await?;

        let worker = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            pick_least_loaded(&mut *rng, &compatible)
                .cloned()
                .ok_or(PoolError::NoWorkers)?
        };

        info!(
            worker = %worker.name(),
            active_containers = worker.active_containers(),
            "Placing container"
        );
        worker
            .find_or_create_container(owner, spec, resource_types)
            .await
    }

    pub async fn find_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<Arc<dyn Container>>, PoolError> {
        match self.provider.find_container_by_handle(handle).await? {
            Some(record) => self.live_container(&record.worker_name, &record.handle).await,
            None => Ok(None),
        }
    }

    pub async fn find_container_for_owner(
        &self,
        owner: &ContainerOwner,
    ) -> Result<Option<Arc<dyn Container>>, PoolError> {
        match self.provider.find_container_for_owner(owner).await? {
            Some(record) => self.live_container(&record.worker_name, &record.handle).await,
            None => Ok(None),
        }
    }

    async fn live_container(
        &self,
        worker_name: &str,
        handle: &str,
    ) -> Result<Option<Arc<dyn Container>>, PoolError> {
        let worker = self
            .provider
            .get_worker(worker_name)
            .await?
            .ok_or_else(|| PoolError::MissingWorker(worker_name.to_string()))?;

        worker.find_container_by_handle(handle).await
    }
}
