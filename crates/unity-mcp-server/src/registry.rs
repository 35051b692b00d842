//! Plugin session registry
//!
//! In-memory directory of connected Unity plugins, indexed by session id and
//! by project hash. All access goes through one async mutex because
//! registration, tool updates and lookups race with command dispatch and
//! disconnect handling.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use unity_mcp_core::{InstanceIdentity, ToolDefinition};

/// A single Unity plugin connection
#[derive(Debug, Clone)]
pub struct PluginSession {
    pub session_id: String,
    pub project_name: String,
    pub project_hash: String,
    pub unity_version: String,
    pub registered_at: DateTime<Utc>,
    /// Refreshed on every heartbeat
    pub connected_at: DateTime<Utc>,
    pub tools: HashMap<String, ToolDefinition>,
}

impl PluginSession {
    /// `Name@hash` id of the instance behind this session
    pub fn instance_id(&self) -> String {
        unity_mcp_core::instance::composite_id(&self.project_name, &self.project_hash)
    }

    pub fn to_instance(&self) -> InstanceIdentity {
        InstanceIdentity::new(&self.project_name, "", &self.project_hash)
            .with_heartbeat(self.connected_at)
            .with_unity_version(&self.unity_version)
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, PluginSession>,
    hash_to_session: HashMap<String, String>,
}

/// Registry of active plugin sessions
#[derive(Default)]
pub struct PluginRegistry {
    state: Mutex<RegistryState>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a plugin session
    ///
    /// A session already claiming `project_hash` is superseded: the hash maps
    /// to the newest session so reconnects always route to the latest channel.
    pub async fn register(
        &self,
        session_id: &str,
        project_name: &str,
        project_hash: &str,
        unity_version: &str,
    ) -> PluginSession {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let session = PluginSession {
            session_id: session_id.to_string(),
            project_name: project_name.to_string(),
            project_hash: project_hash.to_string(),
            unity_version: unity_version.to_string(),
            registered_at: now,
            connected_at: now,
            tools: HashMap::new(),
        };

        if let Some(previous) = state.hash_to_session.get(project_hash).cloned() {
            if previous != session_id {
                state.sessions.remove(&previous);
            }
        }

        state
            .sessions
            .insert(session_id.to_string(), session.clone());
        state
            .hash_to_session
            .insert(project_hash.to_string(), session_id.to_string());
        session
    }

    /// Refresh the heartbeat timestamp; unknown ids are ignored
    pub async fn touch(&self, session_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.connected_at = Utc::now();
        }
    }

    /// Remove a session
    pub async fn unregister(&self, session_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.remove(session_id) {
            // A stale disconnect must not drop a newer session's mapping.
            if state.hash_to_session.get(&session.project_hash).map(String::as_str)
                == Some(session_id)
            {
                state.hash_to_session.remove(&session.project_hash);
            }
        }
    }

    /// Replace the tool map of a session
    pub async fn register_tools_for_session(&self, session_id: &str, tools: Vec<ToolDefinition>) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.tools = tools
                .into_iter()
                .map(|tool| (tool.name.clone(), tool))
                .collect();
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Option<PluginSession> {
        self.state.lock().await.sessions.get(session_id).cloned()
    }

    /// Resolve a project hash (instance id) to a session id
    pub async fn get_session_id_by_hash(&self, project_hash: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .hash_to_session
            .get(project_hash)
            .cloned()
    }

    /// Snapshot of all sessions
    pub async fn list_sessions(&self) -> HashMap<String, PluginSession> {
        self.state.lock().await.sessions.clone()
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}
