//! Error types for the worker registry and the worker pool

use skiff_client::ClientError;
use skiff_core::domain::worker::WorkerSpec;
use thiserror::Error;

use crate::volume::VolumeError;

/// Errors raised by the worker registry and container bookkeeping
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker not present: {0}")]
    WorkerNotPresent(String),

    #[error("cannot prune running worker: {0}")]
    CannotPruneRunningWorker(String),

    #[error("update of other team's worker not allowed: {0}")]
    OtherTeamsWorker(String),

    #[error("container not present: {0}")]
    ContainerNotPresent(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised while placing work on workers
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no workers")]
    NoWorkers,

    #[error("no workers satisfying: {spec}; available workers: {}", .workers.join(", "))]
    NoCompatibleWorkers {
        spec: WorkerSpec,
        workers: Vec<String>,
    },

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("worker for container is missing: {0}")]
    MissingWorker(String),

    #[error("worker {worker} does not provide resource type '{resource_type}'")]
    UnknownResourceType {
        worker: String,
        resource_type: String,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Volume(#[from] VolumeError),
}
