//! Container domain types
//!
//! Bookkeeping records for containers placed on workers, and the placement
//! request a caller hands to the worker pool.

use serde::{Deserialize, Serialize};

use crate::domain::worker::WorkerSpec;

/// Bookkeeping state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Creating,
    Created,
    Destroying,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Creating => "creating",
            ContainerState::Created => "created",
            ContainerState::Destroying => "destroying",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "creating" => Some(ContainerState::Creating),
            "created" => Some(ContainerState::Created),
            "destroying" => Some(ContainerState::Destroying),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a container was created for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerOwner {
    /// A step of a build
    Build { build_id: i64, plan_id: String },

    /// A periodic version check of a resource configuration
    ResourceCheck { resource_config_id: i64 },
}

/// A container as recorded in bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: i64,
    pub handle: String,
    pub worker_name: String,
    pub state: ContainerState,

    /// Someone attached an interactive session to the container
    pub hijacked: bool,

    pub owner: ContainerOwner,
    pub team: Option<String>,
}

/// Access mode of a bind mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindMountMode {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

/// A host path mounted into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub mode: BindMountMode,
}

/// Where a container's root filesystem comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSpec {
    /// The image of a resource type installed on the worker
    ResourceType(String),

    /// A raw root filesystem path on the worker
    RootfsPath(String),
}

/// Placement and creation request for a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub platform: Option<String>,
    pub tags: Vec<String>,
    pub team: Option<String>,
    pub image: ImageSpec,
    pub bind_mounts: Vec<BindMount>,
    pub privileged: bool,
}

impl ContainerSpec {
    /// The placement half of this request
    pub fn worker_spec(&self) -> WorkerSpec {
        let resource_type = match &self.image {
            ImageSpec::ResourceType(name) => Some(name.clone()),
            ImageSpec::RootfsPath(_) => None,
        };

        WorkerSpec {
            platform: self.platform.clone(),
            tags: self.tags.clone(),
            resource_type,
            team: self.team.clone(),
        }
    }
}
