//! Volume-storage service client
//!
//! Routes spoken by a worker's volume-storage service:
//!
//! | Method | Path                                  | Body             |
//! |--------|---------------------------------------|------------------|
//! | POST   | `/volumes`                            | [`VolumeSpec`]   |
//! | GET    | `/volumes/{handle}`                   |                  |
//! | DELETE | `/volumes/{handle}`                   |                  |
//! | GET    | `/volumes/{handle}/stream-out?path=`  | returns tar      |

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::{ServiceClient, map_not_found};

/// How a new volume's contents are produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeStrategy {
    /// Import a path already present on the worker's disk
    Import { path: String },

    /// Copy-on-write child of an existing volume
    Cow { parent: String },

    /// Start out empty
    Empty,
}

/// Request to create a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub strategy: VolumeStrategy,
    #[serde(default)]
    pub privileged: bool,
}

/// A worker's volume-storage service
#[async_trait]
pub trait VolumeService: Send + Sync {
    async fn create_volume(&self, handle: &str, spec: VolumeSpec) -> Result<Arc<dyn Volume>>;

    /// Look up a volume; fails with [`ClientError::VolumeNotFound`] if unknown
    async fn lookup_volume(&self, handle: &str) -> Result<Arc<dyn Volume>>;

    async fn destroy_volume(&self, handle: &str) -> Result<()>;
}

/// A volume living on a worker
#[async_trait]
pub trait Volume: Send + Sync {
    fn handle(&self) -> &str;

    /// Path of the volume on the worker's disk
    fn path(&self) -> &str;

    /// Tar archive of `path` within the volume
    async fn stream_out(&self, path: &str) -> Result<Vec<u8>>;
}

/// HTTP implementation of [`VolumeService`]
#[derive(Debug, Clone)]
pub struct HttpVolumeService {
    client: ServiceClient,
}

impl HttpVolumeService {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: ServiceClient::new(url),
        }
    }

    pub fn with_client(client: ServiceClient) -> Self {
        Self { client }
    }

    fn volume(&self, info: VolumeInfo) -> Arc<dyn Volume> {
        Arc::new(HttpVolume {
            client: self.client.clone(),
            handle: info.handle,
            path: info.path,
        })
    }
}

#[derive(Debug, Serialize)]
struct CreateVolumeRequest<'a> {
    handle: &'a str,
    #[serde(flatten)]
    spec: VolumeSpec,
}

#[derive(Debug, Deserialize)]
struct VolumeInfo {
    handle: String,
    path: String,
}

#[async_trait]
impl VolumeService for HttpVolumeService {
    async fn create_volume(&self, handle: &str, spec: VolumeSpec) -> Result<Arc<dyn Volume>> {
        debug!(handle = %handle, strategy = ?spec.strategy, "Creating volume");

        let response = self
            .client
            .http()
            .post(self.client.url("/volumes"))
            .json(&CreateVolumeRequest { handle, spec })
            .send()
            .await?;

        let info: VolumeInfo = self.client.handle_response(response).await?;
        Ok(self.volume(info))
    }

    async fn lookup_volume(&self, handle: &str) -> Result<Arc<dyn Volume>> {
        let url = self.client.url(&format!("/volumes/{}", handle));
        let response = self.client.http().get(&url).send().await?;

        let info: VolumeInfo = map_not_found(self.client.handle_response(response).await, || {
            ClientError::VolumeNotFound(handle.to_string())
        })?;
        Ok(self.volume(info))
    }

    async fn destroy_volume(&self, handle: &str) -> Result<()> {
        let url = self.client.url(&format!("/volumes/{}", handle));
        let response = self.client.http().delete(&url).send().await?;

        map_not_found(self.client.handle_empty_response(response).await, || {
            ClientError::VolumeNotFound(handle.to_string())
        })
    }
}

#[derive(Debug, Clone)]
struct HttpVolume {
    client: ServiceClient,
    handle: String,
    path: String,
}

#[async_trait]
impl Volume for HttpVolume {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn path(&self) -> &str {
        &self.path
    }

    async fn stream_out(&self, path: &str) -> Result<Vec<u8>> {
        let url = self
            .client
            .url(&format!("/volumes/{}/stream-out", self.handle));
        let response = self
            .client
            .http()
            .get(&url)
            .query(&[("path", path)])
            .send()
            .await?;

        map_not_found(self.client.handle_bytes_response(response).await, || {
            ClientError::VolumeNotFound(self.handle.clone())
        })
    }
}
