//! Build domain types
//!
//! Only the parts of a build the worker lifecycle cares about: whether an
//! in-flight build pins the workers its containers live on.

use serde::{Deserialize, Serialize};

/// Build execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(BuildStatus::Pending),
            "started" => Some(BuildStatus::Started),
            "succeeded" => Some(BuildStatus::Succeeded),
            "failed" => Some(BuildStatus::Failed),
            "errored" => Some(BuildStatus::Errored),
            "aborted" => Some(BuildStatus::Aborted),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, BuildStatus::Pending | BuildStatus::Started)
    }
}

/// Whether a build keeps its workers from landing or retiring.
///
/// `job_interruptible` is `None` for one-off builds that have no job; those
/// always block.
pub fn blocks_draining(status: BuildStatus, job_interruptible: Option<bool>) -> bool {
    status.is_running() && !job_interruptible.unwrap_or(false)
}
