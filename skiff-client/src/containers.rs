//! Container-execution service client
//!
//! Routes spoken by a worker's container-execution service:
//!
//! | Method | Path                                    | Body                 |
//! |--------|-----------------------------------------|----------------------|
//! | POST   | `/containers`                           | [`CreateContainer`]  |
//! | GET    | `/containers/{handle}`                  |                      |
//! | DELETE | `/containers/{handle}`                  |                      |
//! | POST   | `/containers/{handle}/processes`        | spec + stdin         |
//! | GET    | `/containers/{handle}/processes/{id}`   | blocks until exit    |
//! | PUT    | `/containers/{handle}/stop`             | `{"kill": bool}`     |
//! | PUT    | `/containers/{handle}/grace_time`       | `{"seconds": u64}`   |
//! | PUT    | `/containers/{handle}/files?path=...`   | tar archive          |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skiff_core::domain::container::BindMount;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::{ServiceClient, map_not_found};

/// Request to create a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateContainer {
    /// Caller-chosen handle; empty lets the service pick one
    #[serde(default)]
    pub handle: String,
    pub rootfs_path: String,
    #[serde(default)]
    pub bind_mounts: Vec<BindMount>,
    #[serde(default)]
    pub privileged: bool,
}

/// Executable and arguments of a process to run in a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            path: path.into(),
            args,
        }
    }
}

/// Data fed to a process on start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIo {
    #[serde(default)]
    pub stdin: String,
}

/// Outcome of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub exit_status: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// A worker's container-execution service
#[async_trait]
pub trait ContainerService: Send + Sync {
    /// Create a container
    async fn create(&self, spec: CreateContainer) -> Result<Arc<dyn Container>>;

    /// Look up a container; fails with [`ClientError::ContainerNotFound`] if unknown
    async fn lookup(&self, handle: &str) -> Result<Arc<dyn Container>>;

    /// Destroy a container; fails with [`ClientError::ContainerNotFound`] if unknown
    async fn destroy(&self, handle: &str) -> Result<()>;
}

/// A live container on a worker
#[async_trait]
pub trait Container: Send + Sync {
    fn handle(&self) -> &str;

    /// Start a process; returns once it is running
    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Box<dyn Process>>;

    /// Signal every process in the container; `kill` skips the graceful signal
    async fn stop(&self, kill: bool) -> Result<()>;

    /// How long the container may live without being used
    async fn set_grace_time(&self, grace_time: Duration) -> Result<()>;

    /// Unpack a tar archive into the container at `path`
    async fn stream_in(&self, path: &str, archive: Vec<u8>) -> Result<()>;
}

/// A process started in a container
#[async_trait]
pub trait Process: Send + Sync {
    fn id(&self) -> &str;

    /// Wait for the process to exit. May be called again after it returned.
    async fn wait(&self) -> Result<ProcessExit>;
}

/// HTTP implementation of [`ContainerService`]
#[derive(Debug, Clone)]
pub struct HttpContainerService {
    client: ServiceClient,
}

impl HttpContainerService {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            client: ServiceClient::new(address),
        }
    }

    pub fn with_client(client: ServiceClient) -> Self {
        Self { client }
    }

    fn container(&self, handle: impl Into<String>) -> Arc<dyn Container> {
        Arc::new(HttpContainer {
            client: self.client.clone(),
            handle: handle.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ContainerInfo {
    handle: String,
}

#[async_trait]
impl ContainerService for HttpContainerService {
    async fn create(&self, spec: CreateContainer) -> Result<Arc<dyn Container>> {
        debug!(handle = %spec.handle, rootfs = %spec.rootfs_path, "Creating container");

        let response = self
            .client
            .http()
            .post(self.client.url("/containers"))
            .json(&spec)
            .send()
            .await?;

        let info: ContainerInfo = self.client.handle_response(response).await?;
        Ok(self.container(info.handle))
    }

    async fn lookup(&self, handle: &str) -> Result<Arc<dyn Container>> {
        let url = self.client.url(&format!("/containers/{}", handle));
        let response = self.client.http().get(&url).send().await?;

        let info: ContainerInfo = map_not_found(self.client.handle_response(response).await, || {
            ClientError::ContainerNotFound(handle.to_string())
        })?;
        Ok(self.container(info.handle))
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        debug!(handle = %handle, "Destroying container");

        let url = self.client.url(&format!("/containers/{}", handle));
        let response = self.client.http().delete(&url).send().await?;

        map_not_found(self.client.handle_empty_response(response).await, || {
            ClientError::ContainerNotFound(handle.to_string())
        })
    }
}

#[derive(Debug, Clone)]
struct HttpContainer {
    client: ServiceClient,
    handle: String,
}

#[derive(Debug, Serialize)]
struct RunRequest {
    #[serde(flatten)]
    spec: ProcessSpec,
    #[serde(flatten)]
    io: ProcessIo,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct StopRequest {
    kill: bool,
}

#[derive(Debug, Serialize)]
struct GraceTimeRequest {
    seconds: u64,
}

impl HttpContainer {
    fn not_found(&self) -> ClientError {
        ClientError::ContainerNotFound(self.handle.clone())
    }
}

#[async_trait]
impl Container for HttpContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Box<dyn Process>> {
        debug!(handle = %self.handle, path = %spec.path, "Running process");

        let url = self
            .client
            .url(&format!("/containers/{}/processes", self.handle));
        let response = self
            .client
            .http()
            .post(&url)
            .json(&RunRequest { spec, io })
            .send()
            .await?;

        let started: RunResponse =
            map_not_found(self.client.handle_response(response).await, || self.not_found())?;

        Ok(Box::new(HttpProcess {
            client: self.client.clone(),
            handle: self.handle.clone(),
            id: started.id,
        }))
    }

    async fn stop(&self, kill: bool) -> Result<()> {
        let url = self.client.url(&format!("/containers/{}/stop", self.handle));
        let response = self
            .client
            .http()
            .put(&url)
            .json(&StopRequest { kill })
            .send()
            .await?;

        map_not_found(self.client.handle_empty_response(response).await, || self.not_found())
    }

    async fn set_grace_time(&self, grace_time: Duration) -> Result<()> {
        let url = self
            .client
            .url(&format!("/containers/{}/grace_time", self.handle));
        let response = self
            .client
            .http()
            .put(&url)
            .json(&GraceTimeRequest {
                seconds: grace_time.as_secs(),
            })
            .send()
            .await?;

        map_not_found(self.client.handle_empty_response(response).await, || self.not_found())
    }

    async fn stream_in(&self, path: &str, archive: Vec<u8>) -> Result<()> {
        let url = self.client.url(&format!("/containers/{}/files", self.handle));
        let response = self
            .client
            .http()
            .put(&url)
            .query(&[("path", path)])
            .header(reqwest::header::CONTENT_TYPE, "application/x-tar")
            .body(archive)
            .send()
            .await?;

        map_not_found(self.client.handle_empty_response(response).await, || self.not_found())
    }
}

#[derive(Debug, Clone)]
struct HttpProcess {
    client: ServiceClient,
    handle: String,
    id: String,
}

#[async_trait]
impl Process for HttpProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&self) -> Result<ProcessExit> {
        let url = self
            .client
            .url(&format!("/containers/{}/processes/{}", self.handle, self.id));
        let response = self.client.http().get(&url).send().await?;

        map_not_found(self.client.handle_response(response).await, || {
            ClientError::ContainerNotFound(self.handle.clone())
        })
    }
}
