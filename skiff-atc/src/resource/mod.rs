//! Resource Orchestrator
//!
//! Runs a resource's check, in and out scripts on one worker. Every
//! operation starts from an unprivileged COW clone of the resource type's
//! root filesystem; get adds an empty destination volume and put adds COW
//! clones of its input artifacts. The container is destroyed once its
//! script is done, whatever the outcome.

mod check;
mod get;
mod put;

use std::sync::Arc;

use skiff_client::{ClientError, Container, CreateContainer};
use skiff_core::domain::container::BindMount;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::script::ScriptError;
use crate::volume::{VolumeError, VolumeGraph, VolumeTarget, WorkerVolume};
use crate::worker::Worker;

pub const CHECK_SCRIPT: &str = "/opt/resource/check";
pub const IN_SCRIPT: &str = "/opt/resource/in";
pub const OUT_SCRIPT: &str = "/opt/resource/out";

/// Where get mounts its destination volume
pub const GET_DESTINATION: &str = "/tmp/resource/get";

/// Directory put mounts its input artifacts under
pub const ARTIFACTS_DIRECTORY: &str = "/tmp/artifacts";

/// Errors raised by resource operations
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("container error: {0}")]
    Container(#[from] ClientError),

    #[error("failed to build archive: {0}")]
    Archive(#[from] std::io::Error),
}

/// Runs resource scripts on one worker
pub struct ResourceManager {
    worker: Arc<dyn Worker>,
    volumes: Arc<VolumeGraph>,
}

impl ResourceManager {
    pub fn for_worker(worker: Arc<dyn Worker>, volumes: Arc<VolumeGraph>) -> Self {
        Self { worker, volumes }
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    /// Unprivileged COW clone of the root filesystem at `rootfs_path`
    async fn rootfs(&self, rootfs_path: &str) -> Result<WorkerVolume, ResourceError> {
        let service = self.worker.volume_service();
        let target = VolumeTarget::new(self.worker.name(), service.as_ref());

        Ok(self.volumes.cow_from_rootfs(target, rootfs_path).await?)
    }

    async fn empty_volume(&self) -> Result<WorkerVolume, ResourceError> {
        let service = self.worker.volume_service();
        let target = VolumeTarget::new(self.worker.name(), service.as_ref());

        Ok(self.volumes.create_empty(target).await?)
    }

    async fn create_container(
        &self,
        rootfs: &WorkerVolume,
        bind_mounts: Vec<BindMount>,
    ) -> Result<Arc<dyn Container>, ResourceError> {
        let handle = Uuid::new_v4().to_string();
        debug!(worker = %self.worker.name(), handle = %handle, rootfs = %rootfs.path(), "Creating resource container");

        let container = self
            .worker
            .container_service()
            .create(CreateContainer {
                handle,
                rootfs_path: format!("raw://{}", rootfs.path()),
                bind_mounts,
                privileged: false,
            })
            .await?;

        Ok(container)
    }

    /// Destroys a container created for a script
    async fn release(&self, handle: &str) {
        match self.worker.container_service().destroy(handle).await {
            Ok(()) => debug!(worker = %self.worker.name(), handle = %handle, "Destroyed resource container"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(worker = %self.worker.name(), handle = %handle, error = %e, "Failed to destroy resource container")
            }
        }
    }
}
