//! Resource script protocol
//!
//! Requests are written to a script's stdin and responses read from its
//! stdout, each as a single JSON document:
//!
//! - check: `{"source", "version"?}` -> `[version, ...]`, oldest first
//! - in:    `{"source", "params", "version"}` -> `{"version", "metadata"}`
//! - out:   `{"source", "params"}` -> `{"version", "metadata"}`

use serde::{Deserialize, Serialize};

use crate::domain::resource::{MetadataField, Params, Source, Version};

/// Request for the check script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub source: Source,

    /// Last known version, omitted to check from the beginning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

/// Response of the check script
pub type CheckResponse = Vec<Version>;

/// Request for the in (get) script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InRequest {
    pub source: Source,

    #[serde(default)]
    pub params: Params,

    pub version: Option<Version>,
}

/// Request for the out (put) script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutRequest {
    pub source: Source,

    #[serde(default)]
    pub params: Params,
}

/// Response of the in and out scripts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionResult {
    pub version: Version,

    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

pub type InResponse = VersionResult;
pub type OutResponse = VersionResult;
