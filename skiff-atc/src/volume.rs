//! Volume Graph Manager
//!
//! Tracks the copy-on-write volumes created on workers' volume-storage
//! services. Every volume is either an import of a root filesystem image or
//! a COW clone of exactly one parent; the graph is an arena of records keyed
//! by handle, each pointing at its parent.
//!
//! Imports are cached per worker and path, so an image is imported once and
//! COW-cloned from then on. A container's root filesystem is named after the
//! container, so creating it again for the same container finds the volume
//! already there.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use skiff_client::{ClientError, Volume, VolumeService, VolumeSpec, VolumeStrategy};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors raised while building volumes
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume {handle} lives on worker {volume_worker}, cannot use it on {worker}")]
    CrossWorker {
        handle: String,
        volume_worker: String,
        worker: String,
    },

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// A volume together with the worker it lives on
#[derive(Clone)]
pub struct WorkerVolume {
    worker_name: String,
    volume: Arc<dyn Volume>,
}

impl WorkerVolume {
    pub fn new(worker_name: impl Into<String>, volume: Arc<dyn Volume>) -> Self {
        Self {
            worker_name: worker_name.into(),
            volume,
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn handle(&self) -> &str {
        self.volume.handle()
    }

    pub fn path(&self) -> &str {
        self.volume.path()
    }

    /// Tar archive of `path` within the volume
    pub async fn stream_out(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        self.volume.stream_out(path).await
    }
}

impl std::fmt::Debug for WorkerVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerVolume")
            .field("worker_name", &self.worker_name)
            .field("handle", &self.handle())
            .field("path", &self.path())
            .finish()
    }
}

/// Artifact name to the volume holding it
pub type NamedArtifacts = BTreeMap<String, WorkerVolume>;

/// A node of the volume forest
#[derive(Debug, Clone, PartialEq, Eq)]
struct VolumeRecord {
    handle: String,
    worker_name: String,
    path: String,
    parent: Option<String>,
}

/// Handle of the root filesystem volume of container `handle`
pub fn rootfs_handle(container_handle: &str) -> String {
    format!("{}-rootfs", container_handle)
}

/// The volume-storage service of one worker
#[derive(Clone, Copy)]
pub struct VolumeTarget<'a> {
    pub worker_name: &'a str,
    pub service: &'a dyn VolumeService,
}

impl<'a> VolumeTarget<'a> {
    pub fn new(worker_name: &'a str, service: &'a dyn VolumeService) -> Self {
        Self {
            worker_name,
            service,
        }
    }
}

/// Arena of the volumes created through this process
#[derive(Debug, Default)]
pub struct VolumeGraph {
    records: RwLock<HashMap<String, VolumeRecord>>,
    imports: RwLock<HashMap<(String, String), String>>,
}

impl VolumeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Imported root filesystem image at `path`, importing it on first use
    pub async fn import_rootfs(
        &self,
        target: VolumeTarget<'_>,
        path: &str,
    ) -> Result<WorkerVolume, VolumeError> {
        let key = (target.worker_name.to_string(), path.to_string());

        let cached = self.imports.read().await.get(&key).cloned();
        if let Some(handle) = cached {
            match target.service.lookup_volume(&handle).await {
                Ok(volume) => {
                    debug!(worker = %target.worker_name, path = %path, handle = %handle, "Reusing imported rootfs");
                    return Ok(WorkerVolume::new(target.worker_name, volume));
                }
                Err(e) if e.is_not_found() => {
                    debug!(worker = %target.worker_name, handle = %handle, "Imported rootfs vanished, importing again");
                    self.forget(&handle).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let spec = VolumeSpec {
            strategy: VolumeStrategy::Import {
                path: path.to_string(),
            },
            privileged: true,
        };
        let volume = self.create(target, new_handle(), spec, None).await?;

        info!(worker = %target.worker_name, path = %path, handle = %volume.handle(), "Imported rootfs");
        self.imports
            .write()
            .await
            .insert(key, volume.handle().to_string());

        Ok(volume)
    }

    /// Copy-on-write clone of `parent`, which must live on the target worker
    pub async fn cow(
        &self,
        target: VolumeTarget<'_>,
        parent: &WorkerVolume,
        privileged: bool,
    ) -> Result<WorkerVolume, VolumeError> {
        self.cow_as(target, new_handle(), parent, privileged).await
    }

    async fn cow_as(
        &self,
        target: VolumeTarget<'_>,
        handle: String,
        parent: &WorkerVolume,
        privileged: bool,
    ) -> Result<WorkerVolume, VolumeError> {
        if parent.worker_name() != target.worker_name {
            return Err(VolumeError::CrossWorker {
                handle: parent.handle().to_string(),
                volume_worker: parent.worker_name().to_string(),
                worker: target.worker_name.to_string(),
            });
        }

        let spec = VolumeSpec {
            strategy: VolumeStrategy::Cow {
                parent: parent.handle().to_string(),
            },
            privileged,
        };

        self.create(target, handle, spec, Some(parent.handle())).await
    }

    /// Unprivileged COW clone of the root filesystem image at `path`
    pub async fn cow_from_rootfs(
        &self,
        target: VolumeTarget<'_>,
        path: &str,
    ) -> Result<WorkerVolume, VolumeError> {
        let image = self.import_rootfs(target, path).await?;
        self.cow(target, &image, false).await
    }

    /// Root filesystem of container `container_handle`: an unprivileged COW
    /// clone of the image at `path` under [`rootfs_handle`]
    pub async fn container_rootfs(
        &self,
        target: VolumeTarget<'_>,
        path: &str,
        container_handle: &str,
    ) -> Result<WorkerVolume, VolumeError> {
        let image = self.import_rootfs(target, path).await?;
        self.cow_as(target, rootfs_handle(container_handle), &image, false)
            .await
    }

    /// Fresh empty scratch volume
    pub async fn create_empty(&self, target: VolumeTarget<'_>) -> Result<WorkerVolume, VolumeError> {
        let spec = VolumeSpec {
            strategy: VolumeStrategy::Empty,
            privileged: false,
        };

        self.create(target, new_handle(), spec, None).await
    }

    /// COW clones of every artifact, keyed by the same names
    pub async fn cow_artifacts(
        &self,
        target: VolumeTarget<'_>,
        artifacts: &NamedArtifacts,
    ) -> Result<NamedArtifacts, VolumeError> {
        let mut clones = NamedArtifacts::new();

        for (name, volume) in artifacts {
            let clone = self.cow(target, volume, false).await?;
            clones.insert(name.clone(), clone);
        }

        Ok(clones)
    }

    pub async fn parent_of(&self, handle: &str) -> Option<String> {
        self.records
            .read()
            .await
            .get(handle)
            .and_then(|record| record.parent.clone())
    }

    /// Handles from `handle` up to its root import, `handle` first
    pub async fn lineage(&self, handle: &str) -> Vec<String> {
        let records = self.records.read().await;
        let mut lineage = Vec::new();
        let mut current = records.get(handle);

        while let Some(record) = current {
            if lineage.len() > records.len() {
                break;
            }
            lineage.push(record.handle.clone());
            current = record.parent.as_ref().and_then(|parent| records.get(parent));
        }

        lineage
    }

    /// Drops a volume from the arena; its children keep their parent handle
    pub async fn forget(&self, handle: &str) {
        self.records.write().await.remove(handle);
        self.imports.write().await.retain(|_, imported| imported != handle);
    }

    async fn create(
        &self,
        target: VolumeTarget<'_>,
        handle: String,
        spec: VolumeSpec,
        parent: Option<&str>,
    ) -> Result<WorkerVolume, VolumeError> {
        let volume = target.service.create_volume(&handle, spec).await?;

        let record = VolumeRecord {
            handle: volume.handle().to_string(),
            worker_name: target.worker_name.to_string(),
            path: volume.path().to_string(),
            parent: parent.map(str::to_string),
        };
        self.records
            .write()
            .await
            .insert(record.handle.clone(), record);

        Ok(WorkerVolume::new(target.worker_name, volume))
    }
}

fn new_handle() -> String {
    Uuid::new_v4().to_string()
}
