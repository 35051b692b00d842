//! One connection per Unity instance

use crate::connection::{ConnectionSettings, UnityConnection};
use crate::discovery::{InstanceSource, PortDiscovery};
use crate::port_registry::PortRegistry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use unity_mcp_core::{InstanceIdentity, Result, ServerConfig, UnityMcpError};
use unity_mcp_server::CommandTransport;

/// Key for the connection used when no instance is known
const DEFAULT_KEY: &str = "default";

/// Direct-socket transport over discovered editors
pub struct ConnectionPool {
    settings: ConnectionSettings,
    registry: Arc<PortRegistry>,
    connections: Mutex<HashMap<String, Arc<UnityConnection>>>,
}

impl ConnectionPool {
    pub fn new(settings: ConnectionSettings, registry: Arc<PortRegistry>) -> Self {
        Self {
            settings,
            registry,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Pool discovering editors through the configured status directory
    pub fn from_config(config: &ServerConfig) -> Self {
        let source: Arc<dyn InstanceSource> = Arc::new(PortDiscovery::from_config(config));
        let registry = Arc::new(PortRegistry::new(source, config.port_registry_ttl));
        Self::new(ConnectionSettings::from_config(config), registry)
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    /// Connection for `instance`, created on first use
    ///
    /// A named instance must exist; without a name the newest editor is used,
    /// or plain port discovery when none is listed.
    pub async fn get_connection(&self, instance: Option<&str>) -> Result<Arc<UnityConnection>> {
        let (key, target, port) = match self.registry.get_instance(instance).await? {
            Some(inst) => {
                let port = match inst.port {
                    Some(port) => port,
                    None => self.registry.get_port(Some(&inst.id)).await?,
                };
                (inst.id.clone(), Some(inst.id), port)
            }
            None => match instance.filter(|i| !i.trim().is_empty()) {
                Some(name) => return Err(UnityMcpError::InstanceNotFound(name.to_string())),
                None => (DEFAULT_KEY.to_string(), None, self.registry.get_port(None).await?),
            },
        };

        let mut connections = self.connections.lock().await;
        let conn = connections.entry(key).or_insert_with_key(|key| {
            info!("Creating connection for {} on port {}", key, port);
            Arc::new(UnityConnection::new(
                self.settings.clone(),
                target,
                Arc::clone(&self.registry),
                port,
            ))
        });
        Ok(Arc::clone(conn))
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

#[async_trait]
impl CommandTransport for ConnectionPool {
    async fn send_command(
        &self,
        instance: Option<&str>,
        command: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let conn = self.get_connection(instance).await?;
        conn.send_command_with_retry(command, params).await
    }

    async fn list_instances(&self, force_refresh: bool) -> Result<Vec<InstanceIdentity>> {
        let mut instances = self.registry.get_instances(force_refresh).await;
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    async fn shutdown(&self) -> Result<()> {
        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        for (key, conn) in connections {
            debug!("Closing connection for {}", key);
            conn.disconnect().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_registry::tests::StaticSource;
    use std::time::Duration;

    fn pool(instances: Vec<InstanceIdentity>) -> ConnectionPool {
        let source = Arc::new(StaticSource::new(instances));
        let registry = Arc::new(PortRegistry::new(source, Duration::from_secs(5)));
        ConnectionPool::new(ConnectionSettings::default(), registry)
    }

    fn instance(name: &str, hash: &str, port: u16) -> InstanceIdentity {
        InstanceIdentity::new(name, format!("/p/{}", name), hash).with_port(port)
    }

    #[tokio::test]
    async fn test_one_connection_per_instance() {
        let pool = pool(vec![
            instance("Game", "abcd1234", 6401),
            instance("Tools", "ef015678", 6402),
        ]);

        let a = pool.get_connection(Some("Game@abcd1234")).await.unwrap();
        let b = pool.get_connection(Some("abcd")).await.unwrap();
        let c = pool.get_connection(Some("ef01")).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.port(), 6401);
        assert_eq!(c.port(), 6402);
        assert_eq!(c.instance(), Some("Tools@ef015678"));
        assert_eq!(pool.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_instance_rejected() {
        let pool = pool(vec![instance("Game", "abcd1234", 6401)]);
        let err = pool.get_connection(Some("Other@ffff0000")).await.unwrap_err();
        assert!(matches!(err, UnityMcpError::InstanceNotFound(ref id) if id == "Other@ffff0000"));
    }

    #[tokio::test]
    async fn test_default_connection_without_instances() {
        let pool = pool(Vec::new());
        let conn = pool.get_connection(None).await.unwrap();
        assert_eq!(conn.port(), 6400);
        assert_eq!(conn.instance(), None);
    }

    #[tokio::test]
    async fn test_list_and_shutdown() {
        let pool = pool(vec![
            instance("Zeta", "ffff0000", 6402),
            instance("Alpha", "aaaa0000", 6401),
        ]);
        let ids: Vec<String> = pool
            .list_instances(false)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["Alpha@aaaa0000", "Zeta@ffff0000"]);

        pool.get_connection(None).await.unwrap();
        pool.shutdown().await.unwrap();
        assert_eq!(pool.connection_count().await, 0);
    }
}
