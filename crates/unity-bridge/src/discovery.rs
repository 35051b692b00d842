//! Port and status file discovery
//!
//! Editors write `unity-mcp-status-<hash>.json` heartbeats and
//! `unity-mcp-port-<hash>.json` port files into the status directory. Older
//! editors write a single `unity-mcp-port.json`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use unity_mcp_core::instance::{project_hash, project_name_from_path};
use unity_mcp_core::{InstanceIdentity, InstanceStatus, ServerConfig};

/// Port used when no file names one
pub const DEFAULT_PORT: u16 = 6400;

/// Budget for a single liveness probe
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

const STATUS_PREFIX: &str = "unity-mcp-status-";
const PORT_PREFIX: &str = "unity-mcp-port-";
const LEGACY_PORT_FILE: &str = "unity-mcp-port.json";

/// Heartbeat status written by an editor
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusFile {
    pub unity_port: Option<u16>,
    #[serde(default)]
    pub project_path: String,
    pub project_name: Option<String>,
    pub unity_version: Option<String>,
    #[serde(default)]
    pub reloading: bool,
    pub reason: Option<String>,
    pub last_heartbeat: Option<String>,
}

impl StatusFile {
    pub fn is_reloading(&self) -> bool {
        self.reloading
    }

    fn heartbeat(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_heartbeat.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PortFile {
    unity_port: Option<u16>,
    #[serde(default)]
    project_path: String,
}

/// Where instances come from
///
/// The port registry caches whatever a source reports.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    /// Instances with a live (or reloading) editor behind them
    async fn discover_instances(&self) -> Vec<InstanceIdentity>;

    /// Best single port to try when no instance is named
    async fn discover_port(&self) -> u16;

    /// Newest heartbeat status, if any editor wrote one
    async fn latest_status(&self) -> Option<StatusFile>;
}

/// File-based discovery in the editor status directory
#[derive(Debug, Clone)]
pub struct PortDiscovery {
    dir: PathBuf,
    host: String,
    default_port: u16,
}

impl PortDiscovery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            host: "127.0.0.1".to_string(),
            default_port: DEFAULT_PORT,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            dir: config.status_dir.clone(),
            host: config.unity_host.clone(),
            default_port: config.unity_port,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files whose name starts with `prefix`, newest first
    async fn candidates(&self, prefix: &str) -> Vec<(PathBuf, SystemTime)> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Status directory {} unreadable: {}", self.dir.display(), e);
                return found;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(prefix) || !name.ends_with(".json") {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => SystemTime::UNIX_EPOCH,
            };
            found.push((entry.path(), modified));
        }
        found.sort_by(|a, b| b.1.cmp(&a.1));
        found
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Could not parse {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Check that an MCP for Unity listener answers on `port`
    pub async fn probe(&self, port: u16) -> bool {
        probe_port(&self.host, port, PROBE_TIMEOUT).await
    }
}

/// Hash embedded in a `<prefix><hash>.json` file name
fn hash_from_file_name<'a>(path: &'a Path, prefix: &str) -> Option<&'a str> {
    let name = path.file_name()?.to_str()?;
    let hash = name.strip_prefix(prefix)?.strip_suffix(".json")?;
    if hash.is_empty() { None } else { Some(hash) }
}

fn identity_for(path_hash: Option<&str>, project_path: &str, name: Option<&str>) -> InstanceIdentity {
    let hash = match path_hash {
        Some(h) => h.to_string(),
        None => project_hash(project_path),
    };
    let name = match name {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => project_name_from_path(project_path),
    };
    InstanceIdentity::new(name, project_path, hash)
}

/// Send a raw `ping` and look for a greeting or pong in the reply
pub async fn probe_port(host: &str, port: u16, budget: Duration) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect((host, port)).await.ok()?;
        stream.write_all(b"ping").await.ok()?;
        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await.ok()?;
        let data = &buf[..n];
        let found = contains(data, b"WELCOME UNITY-MCP") || contains(data, b"\"message\":\"pong\"");
        Some(found)
    };
    matches!(timeout(budget, attempt).await, Ok(Some(true)))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[async_trait]
impl InstanceSource for PortDiscovery {
    async fn discover_instances(&self) -> Vec<InstanceIdentity> {
        let mut instances: Vec<InstanceIdentity> = Vec::new();

        for (path, modified) in self.candidates(STATUS_PREFIX).await {
            let Some(status) = Self::read_json::<StatusFile>(&path).await else {
                continue;
            };
            let Some(port) = status.unity_port else { continue };
            let mut inst = identity_for(
                hash_from_file_name(&path, STATUS_PREFIX),
                &status.project_path,
                status.project_name.as_deref(),
            );
            if instances.iter().any(|i| i.hash == inst.hash) {
                continue;
            }
            if status.is_reloading() {
                inst.status = InstanceStatus::Reloading;
            } else if !self.probe(port).await {
                debug!("Instance {} on port {} is not responding", inst.id, port);
                continue;
            }
            inst.port = Some(port);
            inst.unity_version = status.unity_version.clone();
            inst.last_heartbeat = status.heartbeat().or_else(|| Some(modified.into()));
            instances.push(inst);
        }

        for (path, modified) in self.candidates(PORT_PREFIX).await {
            let Some(file) = Self::read_json::<PortFile>(&path).await else {
                continue;
            };
            let Some(port) = file.unity_port else { continue };
            let inst = identity_for(hash_from_file_name(&path, PORT_PREFIX), &file.project_path, None);
            if instances.iter().any(|i| i.hash == inst.hash) || !self.probe(port).await {
                continue;
            }
            instances.push(inst.with_port(port).with_heartbeat(modified.into()));
        }

        instances
    }

    async fn discover_port(&self) -> u16 {
        if let Some(port) = self.latest_status().await.and_then(|s| s.unity_port) {
            if self.probe(port).await {
                info!("Using Unity port from status: {}", port);
                return port;
            }
        }

        let mut files = self.candidates(PORT_PREFIX).await;
        let legacy = self.dir.join(LEGACY_PORT_FILE);
        if tokio::fs::try_exists(&legacy).await.unwrap_or(false) {
            files.push((legacy, SystemTime::UNIX_EPOCH));
        }

        let mut first_seen = None;
        for (path, _) in files {
            let Some(file) = Self::read_json::<PortFile>(&path).await else {
                continue;
            };
            let Some(port) = file.unity_port else { continue };
            first_seen.get_or_insert(port);
            if self.probe(port).await {
                info!("Using Unity port from {}: {}", path.display(), port);
                return port;
            }
        }

        match first_seen {
            Some(port) => {
                info!("No responsive port found; using first seen value {}", port);
                port
            }
            None => {
                info!("No port registry found; using default port {}", self.default_port);
                self.default_port
            }
        }
    }

    async fn latest_status(&self) -> Option<StatusFile> {
        let (path, _) = self.candidates(STATUS_PREFIX).await.into_iter().next()?;
        Self::read_json(&path).await
    }
}
