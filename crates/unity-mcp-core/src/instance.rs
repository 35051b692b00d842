//! Unity instance identity
//!
//! An instance is named `<ProjectName>@<hash>`, where `hash` is an 8-character
//! digest of the project path. The composite id is the only handle clients
//! should use; bare names are not unique.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Length of the short project hash
pub const HASH_LEN: usize = 8;

/// Lifecycle state reported for an instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Running,
    Reloading,
    Offline,
}

/// A running Unity Editor instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceIdentity {
    /// `Name@hash`, or the bare hash when the name is unknown
    pub id: String,
    /// Project name
    pub name: String,
    /// Project path (empty when the transport does not know it)
    pub path: String,
    /// Short project hash
    pub hash: String,
    /// TCP port for direct-socket instances
    pub port: Option<u16>,
    pub status: InstanceStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub unity_version: Option<String>,
}

impl InstanceIdentity {
    /// Build an identity, deriving the composite id
    pub fn new(name: impl Into<String>, path: impl Into<String>, hash: impl Into<String>) -> Self {
        let name = name.into();
        let hash = hash.into();
        Self {
            id: composite_id(&name, &hash),
            name,
            path: path.into(),
            hash,
            port: None,
            status: InstanceStatus::Running,
            last_heartbeat: None,
            unity_version: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = Some(at);
        self
    }

    pub fn with_unity_version(mut self, version: impl Into<String>) -> Self {
        self.unity_version = Some(version.into());
        self
    }
}

/// Compose the canonical `Name@hash` id
pub fn composite_id(name: &str, hash: &str) -> String {
    if name.is_empty() {
        hash.to_string()
    } else {
        format!("{}@{}", name, hash)
    }
}

/// Extract the hash part of an instance reference
///
/// `Name@hash` yields `hash` (split on the last `@`); anything else is taken
/// as a bare hash or hash prefix. Empty input yields `None`.
pub fn target_hash(reference: Option<&str>) -> Option<&str> {
    let reference = reference?.trim();
    let hash = match reference.rsplit_once('@') {
        Some((_, suffix)) => suffix,
        None => reference,
    };
    if hash.is_empty() { None } else { Some(hash) }
}

/// Short hash of a project path (first 8 hex chars of SHA-256)
pub fn project_hash(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_LEN);
    hash
}

/// Project name from a project path
///
/// Unity reports the `Assets` folder, so the project is its parent.
pub fn project_name_from_path(path: &str) -> String {
    let trimmed = path.trim_end_matches(['/', '\\']);
    let p = Path::new(trimmed);
    let dir = match p.file_name().and_then(|n| n.to_str()) {
        Some("Assets") => p.parent(),
        _ => Some(p),
    };
    dir.and_then(|d| d.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Project names shared by more than one instance, sorted
pub fn duplicate_names(instances: &[InstanceIdentity]) -> Vec<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for inst in instances {
        *counts.entry(inst.name.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Instance listing returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceList {
    pub success: bool,
    pub instance_count: usize,
    pub instances: Vec<InstanceIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl InstanceList {
    /// Build a listing, warning when project names collide
    pub fn new(instances: Vec<InstanceIdentity>) -> Self {
        let duplicates = duplicate_names(&instances);
        let warning = (!duplicates.is_empty()).then(|| {
            format!(
                "Multiple instances found with duplicate project names: {:?}. \
                 Use full format (e.g., 'ProjectName@hash') to specify which instance.",
                duplicates
            )
        });
        Self {
            success: true,
            instance_count: instances.len(),
            instances,
            warning,
        }
    }
}
