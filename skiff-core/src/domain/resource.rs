//! Resource domain types
//!
//! A resource is a pluggable unit of external state (a git repository, an
//! image registry, ...) driven by three scripts: check, in and out.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Opaque configuration handed to resource scripts
pub type Source = serde_json::Map<String, serde_json::Value>;

/// Opaque per-step parameters handed to in/out scripts
pub type Params = serde_json::Map<String, serde_json::Value>;

/// A version of a resource as reported by its scripts
pub type Version = BTreeMap<String, String>;

/// A single metadata entry emitted alongside a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// A resource type: a root filesystem image plus its logical name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceType {
    /// Path of the root filesystem image on the worker
    pub rootfs_path: String,

    /// Logical type name, e.g. "git"
    pub name: String,
}

/// An immutable resource: its type and its source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_type: ResourceType,
    pub source: Source,
}

impl Resource {
    pub fn new(resource_type: ResourceType, source: Source) -> Self {
        Self {
            resource_type,
            source,
        }
    }
}

/// A pipeline-defined resource type, itself provided by another type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    pub name: String,

    /// Type this custom type is built from
    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default)]
    pub source: Source,

    #[serde(default)]
    pub version: Version,
}

impl VersionedResourceType {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            source: Source::new(),
            version: Version::new(),
        }
    }
}

/// Layered list of custom resource types
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionedResourceTypes(pub Vec<VersionedResourceType>);

impl VersionedResourceTypes {
    pub fn lookup(&self, name: &str) -> Option<&VersionedResourceType> {
        self.0.iter().find(|t| t.name == name)
    }

    /// Follows custom types down to the base type a worker must provide.
    ///
    /// Each custom type is visited at most once, so a cyclic definition
    /// resolves to the type where the cycle closes.
    pub fn underlying_type<'a>(&'a self, name: &'a str) -> &'a str {
        let mut current = name;
        let mut seen = HashSet::new();

        while let Some(custom) = self.lookup(current) {
            if !seen.insert(custom.name.as_str()) {
                break;
            }
            current = &custom.type_name;
        }

        current
    }
}
