//! Worker domain model
//!
//! Represents an execution host that exposes a container-execution service
//! and a volume-storage service, together with the capabilities it
//! advertises and its position in the lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::build::{BuildStatus, blocks_draining};
use crate::domain::resource::VersionedResourceTypes;

/// A registered worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique name of the worker
    pub name: String,

    /// Current lifecycle state
    pub state: WorkerState,

    /// Address of the container-execution service (cleared when landed or stalled)
    #[serde(rename = "addr")]
    pub garden_addr: Option<String>,

    /// URL of the volume-storage service (cleared when landed or stalled)
    pub baggageclaim_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,

    /// Number of containers currently running on the worker
    pub active_containers: i32,

    /// Resource types whose root filesystems are installed on the worker
    pub resource_types: Vec<WorkerResourceType>,

    /// Platform string, e.g. "linux"
    pub platform: String,

    /// Placement tags
    pub tags: Vec<String>,

    /// Owning team, `None` for general workers
    pub team: Option<String>,

    /// Unix timestamp the worker process started at
    pub start_time: i64,

    /// When the worker's last heartbeat expires
    pub expires_at: Option<DateTime<Utc>>,
}

/// A resource type image installed on a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    /// Logical type name, e.g. "git"
    #[serde(rename = "type")]
    pub type_name: String,

    /// Path of the root filesystem image on the worker
    pub image: String,

    /// Content version of the image
    pub version: String,
}

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Accepting new work
    Running,

    /// Draining before going offline
    Landing,

    /// Drained and offline, may come back
    Landed,

    /// Missed its heartbeat
    Stalled,

    /// Draining before being removed for good
    Retiring,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Landing => "landing",
            WorkerState::Landed => "landed",
            WorkerState::Stalled => "stalled",
            WorkerState::Retiring => "retiring",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(WorkerState::Running),
            "landing" => Some(WorkerState::Landing),
            "landed" => Some(WorkerState::Landed),
            "stalled" => Some(WorkerState::Stalled),
            "retiring" => Some(WorkerState::Retiring),
            _ => None,
        }
    }

    /// State a worker ends up in after a heartbeat.
    ///
    /// Draining states are sticky; everything else comes back to running.
    pub fn after_heartbeat(self) -> Self {
        match self {
            WorkerState::Landing | WorkerState::Landed | WorkerState::Retiring => self,
            WorkerState::Running | WorkerState::Stalled => WorkerState::Running,
        }
    }

    /// State a worker ends up in after an explicit land request.
    pub fn after_land_request(self) -> Self {
        match self {
            WorkerState::Landed => WorkerState::Landed,
            _ => WorkerState::Landing,
        }
    }

    /// Whether the worker row may be removed by an explicit prune.
    pub fn is_prunable(self) -> bool {
        self != WorkerState::Running
    }

    /// Whether a worker in this state has its endpoints cleared.
    pub fn clears_endpoints(self) -> bool {
        matches!(self, WorkerState::Landed | WorkerState::Stalled)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Containers bookkept on one worker, as the drain checks see them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerLoad {
    pub containers: usize,

    /// In-flight builds holding a container that may not be interrupted
    pub blocking_builds: usize,
}

impl WorkerLoad {
    /// Counts one container; `build` is the owning build's status and its
    /// job's interruptible flag, `None` for containers without a build
    pub fn count_container(&mut self, build: Option<(BuildStatus, Option<bool>)>) {
        self.containers += 1;

        if build.is_some_and(|(status, interruptible)| blocks_draining(status, interruptible)) {
            self.blocking_builds += 1;
        }
    }

    pub fn may_land(&self) -> bool {
        self.blocking_builds == 0
    }

    /// A retiring worker goes away only once its containers have been reaped
    pub fn may_retire(&self) -> bool {
        self.blocking_builds == 0 && self.containers == 0
    }
}

/// Placement requirements for new work
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Required platform, any if `None`
    pub platform: Option<String>,

    /// Tags the worker must carry
    pub tags: Vec<String>,

    /// Resource type the work needs, resolved through custom types
    pub resource_type: Option<String>,

    /// Team requesting the work
    pub team: Option<String>,
}

impl std::fmt::Display for WorkerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();

        if let Some(platform) = &self.platform {
            parts.push(format!("platform '{}'", platform));
        }
        if let Some(resource_type) = &self.resource_type {
            parts.push(format!("resource type '{}'", resource_type));
        }
        if !self.tags.is_empty() {
            parts.push(format!("tags '{}'", self.tags.join(", ")));
        }
        if let Some(team) = &self.team {
            parts.push(format!("team '{}'", team));
        }

        if parts.is_empty() {
            write!(f, "any worker")
        } else {
            write!(f, "{}", parts.join("; "))
        }
    }
}

/// Reason a worker does not satisfy a [`WorkerSpec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    UnsupportedResourceType(String),
    IncompatiblePlatform(String),
    MismatchedTags,
    TeamMismatch,
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mismatch::UnsupportedResourceType(t) => write!(f, "unsupported resource type '{}'", t),
            Mismatch::IncompatiblePlatform(p) => write!(f, "incompatible platform '{}'", p),
            Mismatch::MismatchedTags => write!(f, "mismatched tags"),
            Mismatch::TeamMismatch => write!(f, "owned by another team"),
        }
    }
}

impl Worker {
    pub fn is_owned_by_team(&self) -> bool {
        self.team.is_some()
    }

    /// Whether the worker currently exposes its services
    pub fn is_reachable(&self) -> bool {
        self.garden_addr.is_some() && self.baggageclaim_url.is_some()
    }

    /// Time since the worker process started
    pub fn uptime(&self, now: DateTime<Utc>) -> chrono::Duration {
        DateTime::from_timestamp(self.start_time, 0)
            .map(|started| now - started)
            .unwrap_or_else(chrono::Duration::zero)
    }

    /// Whether a running worker's heartbeat has expired by `now`
    pub fn is_unresponsive(&self, now: DateTime<Utc>) -> bool {
        self.state == WorkerState::Running && self.expires_at.is_some_and(|expires| expires < now)
    }

    /// Folds a heartbeat sent by the worker into the registered model.
    ///
    /// Expiry and container count always refresh. Endpoints follow the
    /// heartbeat unless the resulting state keeps them cleared.
    pub fn apply_heartbeat(&mut self, beat: &Worker, expires_at: Option<DateTime<Utc>>) {
        self.state = self.state.after_heartbeat();
        self.expires_at = expires_at;
        self.active_containers = beat.active_containers;

        if self.state.clears_endpoints() {
            self.clear_endpoints();
        } else {
            self.garden_addr = beat.garden_addr.clone();
            self.baggageclaim_url = beat.baggageclaim_url.clone();
        }
    }

    /// running → stalled
    pub fn stall(&mut self) {
        self.state = WorkerState::Stalled;
        self.expires_at = None;
        self.clear_endpoints();
    }

    /// landing → landed
    pub fn finish_landing(&mut self) {
        self.state = WorkerState::Landed;
        self.clear_endpoints();
    }

    fn clear_endpoints(&mut self) {
        self.garden_addr = None;
        self.baggageclaim_url = None;
    }

    /// Finds an installed resource type by its logical name
    pub fn resource_type(&self, type_name: &str) -> Option<&WorkerResourceType> {
        self.resource_types
            .iter()
            .find(|t| t.type_name == type_name)
    }

    /// Checks whether this worker can host work described by `spec`.
    ///
    /// Pure function of its inputs; selection among satisfying workers is
    /// left to the caller.
    pub fn satisfies(
        &self,
        spec: &WorkerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> Result<(), Mismatch> {
        if let Some(resource_type) = &spec.resource_type {
            let underlying = resource_types.underlying_type(resource_type);
            if self.resource_type(underlying).is_none() {
                return Err(Mismatch::UnsupportedResourceType(underlying.to_string()));
            }
        }

        if let Some(platform) = &spec.platform {
            if platform != &self.platform {
                return Err(Mismatch::IncompatiblePlatform(platform.clone()));
            }
        }

        if !self.tags_match(&spec.tags) {
            return Err(Mismatch::MismatchedTags);
        }

        if let Some(team) = &self.team {
            if spec.team.as_ref() != Some(team) {
                return Err(Mismatch::TeamMismatch);
            }
        }

        Ok(())
    }

    // Tagged workers only take tagged work.
    fn tags_match(&self, tags: &[String]) -> bool {
        if !self.tags.is_empty() && tags.is_empty() {
            return false;
        }

        tags.iter().all(|tag| self.tags.contains(tag))
    }
}
