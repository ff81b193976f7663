//! Skiff worker service clients
//!
//! Type-safe HTTP clients for the two services every worker runs: the
//! container-execution service and the volume-storage service.
//!
//! The control plane talks to both exclusively through the [`ContainerService`]
//! and [`VolumeService`] traits, so tests can swap in fakes and the HTTP
//! transport stays an implementation detail of this crate.
//!
//! # Example
//!
//! ```no_run
//! use skiff_client::{Container, ContainerService, HttpContainerService};
//!
//! #[tokio::main]
//! async fn main() -> skiff_client::Result<()> {
//!     let containers = HttpContainerService::new("10.0.0.4:7777");
//!     let container = containers.lookup("some-handle").await?;
//!     println!("found {}", container.handle());
//!     Ok(())
//! }
//! ```

pub mod containers;
pub mod error;
pub mod volumes;

// Re-export commonly used types
pub use containers::{
    Container, ContainerService, CreateContainer, HttpContainerService, Process, ProcessExit,
    ProcessIo, ProcessSpec,
};
pub use error::{ClientError, Result};
pub use volumes::{HttpVolumeService, Volume, VolumeService, VolumeSpec, VolumeStrategy};

use reqwest::Client;
use serde::de::DeserializeOwned;

/// Base HTTP client shared by the per-service clients
#[derive(Debug, Clone)]
pub struct ServiceClient {
    /// Base URL of the service (e.g., "http://10.0.0.4:7777")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl ServiceClient {
    /// Create a new service client
    ///
    /// Worker addresses are registered as bare `host:port` pairs; those are
    /// assumed to speak plain HTTP.
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_client(address, Client::new())
    }

    /// Create a new service client with a custom HTTP client
    pub fn with_client(address: impl Into<String>, client: Client) -> Self {
        let address = address.into();
        let address = address.trim_end_matches('/');
        let base_url = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        Self { base_url, client }
    }

    /// Get the base URL of the service
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    pub(crate) async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let response = Self::check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content
    pub(crate) async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        Self::check_status(response).await?;
        Ok(())
    }

    /// Handle an API response carrying a raw byte stream (tar archives)
    pub(crate) async fn handle_bytes_response(&self, response: reqwest::Response) -> Result<Vec<u8>> {
        let response = Self::check_status(response).await?;
        let body = response.bytes().await?;
        Ok(body.to_vec())
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }
}

/// Rewrites a bare 404 into the service-specific "not found" error
pub(crate) fn map_not_found<T>(
    result: Result<T>,
    not_found: impl FnOnce() -> ClientError,
) -> Result<T> {
    match result {
        Err(ClientError::ApiError { status: 404, .. }) => Err(not_found()),
        other => other,
    }
}
