//! Command transport trait

use crate::hub::{PluginHub, SessionList};
use crate::resolve::SessionResolver;
use async_trait::async_trait;
use unity_mcp_core::instance::target_hash;
use unity_mcp_core::{InstanceIdentity, Result, ToolDefinition, UnityMcpError};

/// Delivers commands to Unity editors
///
/// Implemented by the plugin hub and by the direct-socket pool so the MCP
/// front end does not care which one is running.
#[async_trait]
pub trait CommandTransport: Send + Sync + 'static {
    /// Send a command to `instance` (or the default instance) and return its result
    async fn send_command(
        &self,
        instance: Option<&str>,
        command: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Send a command straight to a known session, skipping resolution
    ///
    /// Transports without sessions report every id as not connected.
    async fn send_command_to_session(
        &self,
        session_id: &str,
        _command: &str,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        Err(UnityMcpError::NotConnected(session_id.to_string()))
    }

    /// Instances currently reachable
    async fn list_instances(&self, force_refresh: bool) -> Result<Vec<InstanceIdentity>>;

    /// Resolver used to validate active-instance bindings.
    /// Returns None when bindings are passed through unchecked.
    fn session_resolver(&self) -> Option<SessionResolver> {
        None
    }

    /// Tools registered by the plugin serving `instance`
    async fn tools_for_instance(&self, _instance: Option<&str>) -> Vec<ToolDefinition> {
        Vec::new()
    }

    /// Session listing, when the transport tracks sessions
    async fn session_list(&self) -> Option<SessionList> {
        None
    }

    /// Release sockets and background tasks
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CommandTransport for PluginHub {
    async fn send_command(
        &self,
        instance: Option<&str>,
        command: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.send_command_for_instance(instance, command, params)
            .await
    }

    async fn send_command_to_session(
        &self,
        session_id: &str,
        command: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        PluginHub::send_command(self, session_id, command, params).await
    }

    async fn list_instances(&self, _force_refresh: bool) -> Result<Vec<InstanceIdentity>> {
        let mut instances: Vec<InstanceIdentity> = self
            .registry()
            .list_sessions()
            .await
            .values()
            .map(|s| s.to_instance())
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    fn session_resolver(&self) -> Option<SessionResolver> {
        Some(self.resolver().clone())
    }

    async fn tools_for_instance(&self, instance: Option<&str>) -> Vec<ToolDefinition> {
        // No resolver wait here; listing tools must not stall on a reload
        let target = target_hash(instance);
        let mut matching: Vec<_> = self
            .registry()
            .list_sessions()
            .await
            .into_values()
            .filter(|s| target.is_none_or(|hash| s.project_hash.starts_with(hash)))
            .collect();
        if matching.len() != 1 {
            return Vec::new();
        }
        let mut tools: Vec<ToolDefinition> = matching.remove(0).tools.into_values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    async fn session_list(&self) -> Option<SessionList> {
        Some(self.get_sessions().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubSettings;
    use crate::registry::PluginRegistry;
    use std::sync::Arc;

    fn tool(name: &str) -> ToolDefinition {
        serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
    }

    async fn hub_with_sessions() -> PluginHub {
        let registry = Arc::new(PluginRegistry::new());
        registry.register("s1", "Beta", "bbbb1111", "6000").await;
        registry.register("s2", "Alpha", "aaaa2222", "2022.3").await;
        registry
            .register_tools_for_session("s1", vec![tool("zeta"), tool("bake")])
            .await;
        PluginHub::new(registry, HubSettings::default())
    }

    #[tokio::test]
    async fn test_hub_lists_instances_sorted() {
        let hub = hub_with_sessions().await;
        let instances = hub.list_instances(false).await.unwrap();
        let ids: Vec<&str> = instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["Alpha@aaaa2222", "Beta@bbbb1111"]);
        assert_eq!(instances[0].unity_version.as_deref(), Some("2022.3"));
        assert!(instances[0].last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_hub_tools_for_instance() {
        let hub = hub_with_sessions().await;

        let names: Vec<String> = hub
            .tools_for_instance(Some("Beta@bbbb1111"))
            .await
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["bake", "zeta"]);

        assert_eq!(hub.tools_for_instance(Some("bbbb")).await.len(), 2);
        // Two sessions and no selection: nothing to advertise
        assert!(hub.tools_for_instance(None).await.is_empty());
        assert!(hub.tools_for_instance(Some("aaaa2222")).await.is_empty());
    }

    #[tokio::test]
    async fn test_hub_session_dispatch_needs_live_channel() {
        let hub = hub_with_sessions().await;
        // Registered but never bound to a plugin channel
        let err = hub
            .send_command_to_session("s1", "ping", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, UnityMcpError::NotConnected(ref id) if id == "s1"));
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_hub_exposes_resolver_and_sessions() {
        let hub = hub_with_sessions().await;
        assert!(hub.session_resolver().is_some());
        assert_eq!(hub.session_list().await.unwrap().sessions.len(), 2);
    }
}
