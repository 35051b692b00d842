//! Cached view of discovered Unity instances

use crate::discovery::{InstanceSource, StatusFile};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use unity_mcp_core::instance::target_hash;
use unity_mcp_core::{InstanceIdentity, Result, UnityMcpError};

#[derive(Default)]
struct Cache {
    instances: Vec<InstanceIdentity>,
    refreshed_at: Option<Instant>,
}

/// TTL cache over an instance source
pub struct PortRegistry {
    source: Arc<dyn InstanceSource>,
    ttl: Duration,
    cache: Mutex<Cache>,
}

impl PortRegistry {
    pub fn new(source: Arc<dyn InstanceSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Known instances, rescanning when the cache is stale or `force_refresh` is set
    pub async fn get_instances(&self, force_refresh: bool) -> Vec<InstanceIdentity> {
        let mut cache = self.cache.lock().await;
        let fresh = cache
            .refreshed_at
            .is_some_and(|at| at.elapsed() < self.ttl);
        if force_refresh || !fresh {
            cache.instances = self.source.discover_instances().await;
            cache.refreshed_at = Some(Instant::now());
            debug!("Discovered {} Unity instance(s)", cache.instances.len());
        }
        cache.instances.clone()
    }

    /// Look up an instance
    ///
    /// With no reference the newest heartbeat wins, port breaking ties.
    /// References may be `Name@hash`, a hash or a unique hash prefix.
    pub async fn get_instance(&self, reference: Option<&str>) -> Result<Option<InstanceIdentity>> {
        let instances = self.get_instances(false).await;
        let Some(reference) = reference.filter(|r| !r.trim().is_empty()) else {
            return Ok(instances
                .into_iter()
                .max_by_key(|i| (i.last_heartbeat, i.port)));
        };

        if let Some(exact) = instances.iter().find(|i| i.id == reference) {
            return Ok(Some(exact.clone()));
        }
        let Some(hash) = target_hash(Some(reference)) else {
            return Ok(None);
        };
        let mut matches: Vec<&InstanceIdentity> =
            instances.iter().filter(|i| i.hash.starts_with(hash)).collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop().cloned()),
            _ => {
                let mut ids: Vec<String> = matches.iter().map(|i| i.id.clone()).collect();
                ids.sort();
                Err(UnityMcpError::AmbiguousInstance { instances: ids })
            }
        }
    }

    /// Port for `reference`, falling back to plain port discovery
    pub async fn get_port(&self, reference: Option<&str>) -> Result<u16> {
        match self.get_instance(reference).await? {
            Some(inst) => match inst.port {
                Some(port) => Ok(port),
                None => Ok(self.source.discover_port().await),
            },
            None => Ok(self.source.discover_port().await),
        }
    }

    /// Force a rescan and return the port for `reference`
    pub async fn refresh_port(&self, reference: Option<&str>) -> Result<u16> {
        self.clear().await;
        self.get_port(reference).await
    }

    pub async fn latest_status(&self) -> Option<StatusFile> {
        self.source.latest_status().await
    }

    pub async fn clear(&self) {
        let mut cache = self.cache.lock().await;
        cache.instances.clear();
        cache.refreshed_at = None;
    }
}
