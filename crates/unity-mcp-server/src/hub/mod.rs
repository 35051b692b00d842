//! Plugin hub
//!
//! Unity plugins dial in over a WebSocket, register their project, and then
//! receive `execute` frames. The hub binds each registered session to its
//! channel and correlates `command_result` frames back to the waiting caller.

pub mod protocol;
pub mod websocket;

pub use protocol::{
    CLOSE_INTERNAL_ERROR, CLOSE_PROTOCOL_ERROR, PluginFrame, ServerFrame, SessionDetails,
    SessionList,
};

use crate::registry::PluginRegistry;
use crate::resolve::{RetryPolicy, SessionResolver};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use unity_mcp_core::{Result, ServerConfig, ToolDefinition, UnityMcpError};
use uuid::Uuid;

/// Item queued for a channel's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),
    Close { code: u16, reason: String },
}

/// Hub timing
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub keep_alive_interval: Duration,
    pub server_timeout: Duration,
    pub command_timeout: Duration,
    /// Reload window used when resolving instances
    pub retry: RetryPolicy,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl HubSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            keep_alive_interval: config.keep_alive_interval,
            server_timeout: config.server_timeout,
            command_timeout: config.command_timeout,
            retry: RetryPolicy::from_config(config),
        }
    }
}

/// Hub-side handle to one plugin connection
#[derive(Debug, Clone)]
pub struct PluginChannel {
    id: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl PluginChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: ServerFrame) -> Result<()> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| UnityMcpError::IpcError(format!("plugin channel {} is closed", self.id)))
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[derive(Default)]
struct HubState {
    /// session id -> channel
    channels: HashMap<String, PluginChannel>,
    /// command id -> waiter
    pending: HashMap<String, oneshot::Sender<Value>>,
}

impl HubState {
    fn unbind_channel(&mut self, channel_id: u64) -> Vec<String> {
        let sessions: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, c)| c.id == channel_id)
            .map(|(session_id, _)| session_id.clone())
            .collect();
        for session_id in &sessions {
            self.channels.remove(session_id);
        }
        sessions
    }

    fn session_for_channel(&self, channel_id: u64) -> Option<String> {
        self.channels
            .iter()
            .find(|(_, c)| c.id == channel_id)
            .map(|(session_id, _)| session_id.clone())
    }
}

fn lock(state: &Mutex<HubState>) -> MutexGuard<'_, HubState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a waiter entry however the command ends
struct PendingGuard<'a> {
    state: &'a Mutex<HubState>,
    command_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).pending.remove(&self.command_id);
    }
}

/// Connection hub for Unity plugins
pub struct PluginHub {
    registry: Arc<PluginRegistry>,
    resolver: SessionResolver,
    settings: HubSettings,
    state: Mutex<HubState>,
    runtime: Handle,
    /// Thread driving `runtime` when it is a current-thread runtime
    loop_thread: Arc<OnceLock<ThreadId>>,
    next_channel: AtomicU64,
}

impl PluginHub {
    /// Create a hub bound to the current Tokio runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(registry: Arc<PluginRegistry>, settings: HubSettings) -> Self {
        let runtime = Handle::current();
        let current_thread = runtime.runtime_flavor() == RuntimeFlavor::CurrentThread;
        let hub = Self::with_runtime(registry, settings, runtime);
        if current_thread {
            let _ = hub.loop_thread.set(thread::current().id());
        }
        hub
    }

    /// Create a hub whose blocking helpers run on `runtime`
    pub fn with_runtime(
        registry: Arc<PluginRegistry>,
        settings: HubSettings,
        runtime: Handle,
    ) -> Self {
        let resolver = SessionResolver::new(Arc::clone(&registry), settings.retry);
        let loop_thread = Arc::new(OnceLock::new());
        if runtime.runtime_flavor() == RuntimeFlavor::CurrentThread {
            // Tasks of a current-thread runtime all run on its driving thread
            let record = Arc::clone(&loop_thread);
            runtime.spawn(async move {
                let _ = record.set(thread::current().id());
            });
        }
        Self {
            registry,
            resolver,
            settings,
            state: Mutex::new(HubState::default()),
            runtime,
            loop_thread,
            next_channel: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &SessionResolver {
        &self.resolver
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    fn lock_state(&self) -> MutexGuard<'_, HubState> {
        lock(&self.state)
    }

    /// Accept a new plugin channel and greet it
    pub fn open_channel(&self, outbound: mpsc::UnboundedSender<Outbound>) -> Result<PluginChannel> {
        let channel = PluginChannel {
            id: self.next_channel.fetch_add(1, Ordering::Relaxed),
            outbound,
        };
        channel.send(ServerFrame::Welcome {
            server_timeout: self.settings.server_timeout.as_secs(),
            keep_alive_interval: self.settings.keep_alive_interval.as_secs(),
        })?;
        debug!("Plugin channel {} opened", channel.id);
        Ok(channel)
    }

    /// Handle raw text received on a channel
    ///
    /// Malformed or failing frames are logged; the channel stays open.
    pub async fn receive(&self, channel: &PluginChannel, text: &str) {
        debug!(
            "[Unity→Hub] channel={} len={} json={}",
            channel.id,
            text.len(),
            protocol::preview(text)
        );
        let frame = match protocol::decode(text) {
            Ok(frame) => frame,
            Err(e @ UnityMcpError::ProtocolError(_)) => {
                warn!("Ignoring frame on channel {}: {}", channel.id, e);
                return;
            }
            Err(e) => {
                error!("Malformed frame on channel {}: {}", channel.id, e);
                return;
            }
        };
        if let Err(e) = self.handle_frame(channel, frame).await {
            warn!("Plugin frame on channel {} failed: {}", channel.id, e);
        }
    }

    pub async fn handle_frame(&self, channel: &PluginChannel, frame: PluginFrame) -> Result<()> {
        match frame {
            PluginFrame::Register {
                project_name,
                project_hash,
                unity_version,
            } => {
                self.handle_register(channel, &project_name, &project_hash, &unity_version)
                    .await
            }
            PluginFrame::RegisterTools { tools } => {
                self.handle_register_tools(channel, tools).await;
                Ok(())
            }
            PluginFrame::Pong { session_id } => {
                self.handle_pong(channel, session_id.as_deref()).await;
                Ok(())
            }
            PluginFrame::CommandResult { id, result } => {
                self.handle_command_result(&id, result);
                Ok(())
            }
            PluginFrame::Unknown => {
                debug!("Ignoring unknown frame type on channel {}", channel.id);
                Ok(())
            }
        }
    }

    async fn handle_register(
        &self,
        channel: &PluginChannel,
        project_name: &str,
        project_hash: &str,
        unity_version: &str,
    ) -> Result<()> {
        if project_hash.is_empty() {
            warn!(
                "Rejecting registration without project_hash on channel {}",
                channel.id
            );
            channel.close(CLOSE_PROTOCOL_ERROR, "Plugin registration missing project_hash");
            return Err(UnityMcpError::ProtocolError(
                "registration missing project_hash".into(),
            ));
        }

        let session_id = Uuid::new_v4().to_string();
        channel.send(ServerFrame::Registered {
            session_id: session_id.clone(),
        })?;

        let session = self
            .registry
            .register(&session_id, project_name, project_hash, unity_version)
            .await;

        // A channel carries one session; re-registering replaces it.
        let replaced = {
            let mut state = self.lock_state();
            let replaced = state.unbind_channel(channel.id);
            state.channels.insert(session_id.clone(), channel.clone());
            replaced
        };
        for old in replaced {
            self.registry.unregister(&old).await;
        }

        info!(
            "Plugin registered: {} (Unity {}) session={}",
            session.instance_id(),
            unity_version,
            session_id
        );
        Ok(())
    }

    async fn handle_register_tools(&self, channel: &PluginChannel, tools: Vec<ToolDefinition>) {
        let Some(session_id) = self.lock_state().session_for_channel(channel.id) else {
            warn!(
                "register_tools on unregistered channel {}; ignoring",
                channel.id
            );
            return;
        };
        let count = tools.len();
        self.registry
            .register_tools_for_session(&session_id, tools)
            .await;
        info!("Registered {} tools for session {}", count, session_id);
    }

    async fn handle_pong(&self, channel: &PluginChannel, session_id: Option<&str>) {
        let session_id = match session_id {
            Some(id) => Some(id.to_string()),
            None => self.lock_state().session_for_channel(channel.id),
        };
        if let Some(id) = session_id {
            self.registry.touch(&id).await;
        }
    }

    fn handle_command_result(&self, command_id: &str, result: Value) {
        let waiter = self.lock_state().pending.remove(command_id);
        match waiter {
            Some(tx) => {
                if tx.send(result).is_err() {
                    debug!("Caller for command {} went away", command_id);
                }
            }
            None => debug!("Dropping result for unknown command {}", command_id),
        }
    }

    /// Tear down a closed channel and unregister its session
    ///
    /// Commands still waiting on the channel are left to their timeout.
    pub async fn close_channel(&self, channel: &PluginChannel, close_code: Option<u16>) {
        let sessions = self.lock_state().unbind_channel(channel.id);
        for session_id in sessions {
            self.registry.unregister(&session_id).await;
            info!(
                "Plugin session {} disconnected (code={:?})",
                session_id, close_code
            );
        }
        debug!("Plugin channel {} closed", channel.id);
    }

    /// Whether `session_id` has a live channel
    pub fn is_connected(&self, session_id: &str) -> bool {
        self.lock_state().channels.contains_key(session_id)
    }

    /// Commands awaiting a result
    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Send a command to a session and wait for its result
    pub async fn send_command(
        &self,
        session_id: &str,
        command_type: &str,
        params: Value,
    ) -> Result<Value> {
        let command_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        let channel = {
            let mut state = self.lock_state();
            let Some(channel) = state.channels.get(session_id).cloned() else {
                return Err(UnityMcpError::NotConnected(session_id.to_string()));
            };
            if state.pending.contains_key(&command_id) {
                error!("Duplicate command id generated: {}", command_id);
                return Err(UnityMcpError::DuplicateCommandId(command_id));
            }
            state.pending.insert(command_id.clone(), tx);
            channel
        };
        let _guard = PendingGuard {
            state: &self.state,
            command_id: command_id.clone(),
        };

        debug!(
            "[Hub→Unity] session={} command={} id={}",
            session_id, command_type, command_id
        );
        channel.send(ServerFrame::Execute {
            id: command_id.clone(),
            name: command_type.to_string(),
            params,
            timeout: self.settings.command_timeout.as_secs_f64(),
        })?;

        match tokio::time::timeout(self.settings.command_timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(UnityMcpError::IpcError(format!(
                "command {} was abandoned",
                command_id
            ))),
            Err(_) => {
                warn!(
                    "Command {} ({}) timed out on session {}",
                    command_id, command_type, session_id
                );
                Err(UnityMcpError::CommandTimeout {
                    command: command_type.to_string(),
                    timeout: self.settings.command_timeout,
                })
            }
        }
    }

    /// Resolve an instance reference to a session id, riding out reloads
    pub async fn resolve_session_id(&self, instance: Option<&str>) -> Result<String> {
        self.resolver.resolve(instance).await
    }

    pub async fn send_command_for_instance(
        &self,
        instance: Option<&str>,
        command_type: &str,
        params: Value,
    ) -> Result<Value> {
        let session_id = self.resolve_session_id(instance).await?;
        self.send_command(&session_id, command_type, params).await
    }

    /// Listing of connected sessions
    pub async fn get_sessions(&self) -> SessionList {
        let sessions = self.registry.list_sessions().await;
        SessionList {
            sessions: sessions
                .into_iter()
                .map(|(session_id, s)| {
                    let details = SessionDetails {
                        project: s.project_name,
                        hash: s.project_hash,
                        unity_version: s.unity_version,
                        connected_at: s.connected_at.to_rfc3339(),
                    };
                    (session_id, details)
                })
                .collect(),
        }
    }

    /// Tools registered by the session currently serving `project_hash`
    pub async fn get_tools_for_project(&self, project_hash: &str) -> Vec<ToolDefinition> {
        let Some(session_id) = self.registry.get_session_id_by_hash(project_hash).await else {
            return Vec::new();
        };
        self.registry
            .get_session(&session_id)
            .await
            .map(|s| s.tools.into_values().collect())
            .unwrap_or_default()
    }

    pub async fn get_tool_definition(
        &self,
        project_hash: &str,
        tool_name: &str,
    ) -> Option<ToolDefinition> {
        let session_id = self.registry.get_session_id_by_hash(project_hash).await?;
        let mut session = self.registry.get_session(&session_id).await?;
        session.tools.remove(tool_name)
    }

    /// Whether the calling thread is the one that must drive the hub
    ///
    /// Only a current-thread runtime can deadlock: blocking its driver stops
    /// the hub future from ever running. Worker threads of a multi-thread
    /// runtime, `spawn_blocking` threads and other runtimes are fine.
    fn on_hub_loop(&self) -> bool {
        let Ok(current) = Handle::try_current() else {
            return false;
        };
        if current.runtime_flavor() != RuntimeFlavor::CurrentThread {
            return false;
        }
        match self.loop_thread.get() {
            Some(id) => *id == thread::current().id(),
            // Driver not seen yet; assume the worst for a current-thread hub
            None => self.runtime.runtime_flavor() == RuntimeFlavor::CurrentThread,
        }
    }

    /// Run a hub future to completion from synchronous code
    fn run_blocking<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.on_hub_loop() {
            return Err(UnityMcpError::BlockingInLoop);
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.runtime.spawn(async move {
            let _ = tx.send(fut.await);
        });
        let wait = move || rx.recv();
        let received = match Handle::try_current() {
            // Hand this worker's other tasks off while we wait
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(wait)
            }
            _ => wait(),
        };
        received.map_err(|_| UnityMcpError::IpcError("hub runtime dropped the call".into()))?
    }

    /// Blocking form of [`send_command_for_instance`](Self::send_command_for_instance)
    ///
    /// Callable from plain threads, `spawn_blocking`, multi-thread workers
    /// and other runtimes. Fails with [`UnityMcpError::BlockingInLoop`] on
    /// the thread driving a current-thread hub runtime.
    pub fn send_command_blocking(
        self: &Arc<Self>,
        instance: Option<&str>,
        command_type: &str,
        params: Value,
    ) -> Result<Value> {
        let hub = Arc::clone(self);
        let instance = instance.map(str::to_string);
        let command_type = command_type.to_string();
        self.run_blocking(async move {
            hub.send_command_for_instance(instance.as_deref(), &command_type, params)
                .await
        })
    }

    pub fn list_sessions_blocking(self: &Arc<Self>) -> Result<SessionList> {
        let hub = Arc::clone(self);
        self.run_blocking(async move { Ok(hub.get_sessions().await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(command_timeout: Duration) -> HubSettings {
        HubSettings {
            command_timeout,
            retry: RetryPolicy::new(4, Duration::from_millis(50)),
            ..Default::default()
        }
    }

    fn hub() -> Arc<PluginHub> {
        Arc::new(PluginHub::new(
            Arc::new(PluginRegistry::new()),
            settings(Duration::from_secs(30)),
        ))
    }

    fn connect(hub: &PluginHub) -> (PluginChannel, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = hub.open_channel(tx).unwrap();
        match rx.try_recv().unwrap() {
            Outbound::Frame(ServerFrame::Welcome { .. }) => {}
            other => panic!("Expected welcome, got {:?}", other),
        }
        (channel, rx)
    }

    async fn register(
        hub: &PluginHub,
        channel: &PluginChannel,
        rx: &mut mpsc::UnboundedReceiver<Outbound>,
        name: &str,
        hash: &str,
    ) -> String {
        let frame = json!({
            "type": "register",
            "project_name": name,
            "project_hash": hash,
            "unity_version": "6000.0.23f1",
        });
        hub.receive(channel, &frame.to_string()).await;
        match rx.try_recv().unwrap() {
            Outbound::Frame(ServerFrame::Registered { session_id }) => session_id,
            other => panic!("Expected registered, got {:?}", other),
        }
    }

    /// Answer every execute frame with an echo of its name
    fn spawn_echo_plugin(
        hub: Arc<PluginHub>,
        channel: PluginChannel,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                if let Outbound::Frame(ServerFrame::Execute { id, name, params, .. }) = item {
                    let reply = json!({
                        "type": "command_result",
                        "id": id,
                        "result": {"success": true, "echo": name, "params": params},
                    });
                    hub.receive(&channel, &reply.to_string()).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_welcome_advertises_timing() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.open_channel(tx).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Frame(ServerFrame::Welcome {
                server_timeout: 30,
                keep_alive_interval: 15,
            })
        );
    }

    #[tokio::test]
    async fn test_register_binds_session() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        let session_id = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;

        assert!(hub.is_connected(&session_id));
        let sessions = hub.get_sessions().await;
        let details = &sessions.sessions[&session_id];
        assert_eq!(details.project, "MyGame");
        assert_eq!(details.hash, "abcd1234");
        assert_eq!(details.unity_version, "6000.0.23f1");
    }

    #[tokio::test]
    async fn test_register_without_hash_closes_4400() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        hub.receive(&channel, r#"{"type":"register","project_name":"X"}"#)
            .await;

        match rx.try_recv().unwrap() {
            Outbound::Close { code, .. } => assert_eq!(code, CLOSE_PROTOCOL_ERROR),
            other => panic!("Expected close, got {:?}", other),
        }
        assert_eq!(hub.registry().count().await, 0);
    }

    #[tokio::test]
    async fn test_register_tools_and_lookup() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;

        let frame = json!({
            "type": "register_tools",
            "tools": [{"name": "bake_lighting", "description": "Bake"}],
        });
        hub.receive(&channel, &frame.to_string()).await;

        let tools = hub.get_tools_for_project("abcd1234").await;
        assert_eq!(tools.len(), 1);
        assert!(
            hub.get_tool_definition("abcd1234", "bake_lighting")
                .await
                .is_some()
        );
        assert!(hub.get_tool_definition("abcd1234", "nope").await.is_none());
        assert!(hub.get_tools_for_project("ffff0000").await.is_empty());
    }

    #[tokio::test]
    async fn test_register_tools_before_register_is_ignored() {
        let hub = hub();
        let (channel, _rx) = connect(&hub);
        hub.receive(&channel, r#"{"type":"register_tools","tools":[{"name":"t"}]}"#)
            .await;
        assert_eq!(hub.registry().count().await, 0);
    }

    #[tokio::test]
    async fn test_pong_touches_session() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        let session_id = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;
        let before = hub.registry().get_session(&session_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        hub.receive(&channel, r#"{"type":"pong"}"#).await;

        let after = hub.registry().get_session(&session_id).await.unwrap();
        assert!(after.connected_at > before.connected_at);
    }

    #[tokio::test]
    async fn test_malformed_frames_do_not_close_channel() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        hub.receive(&channel, "not json").await;
        hub.receive(&channel, "[1,2]").await;
        hub.receive(&channel, r#"{"type":"telemetry"}"#).await;
        assert!(rx.try_recv().is_err());

        let session_id = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;
        assert!(hub.is_connected(&session_id));
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        let session_id = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;
        spawn_echo_plugin(Arc::clone(&hub), channel, rx);

        let result = hub
            .send_command(&session_id, "manage_scene", json!({"action": "get_hierarchy"}))
            .await
            .unwrap();

        assert_eq!(result["echo"], "manage_scene");
        assert_eq!(result["params"]["action"], "get_hierarchy");
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_commands_correlate() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        let session_id = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;
        spawn_echo_plugin(Arc::clone(&hub), channel, rx);

        let (a, b) = tokio::join!(
            hub.send_command(&session_id, "first", json!({})),
            hub.send_command(&session_id, "second", json!({})),
        );
        assert_eq!(a.unwrap()["echo"], "first");
        assert_eq!(b.unwrap()["echo"], "second");
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_to_unknown_session_fails() {
        let hub = hub();
        let err = hub
            .send_command("ghost", "ping", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, UnityMcpError::NotConnected(_)));
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cleans_pending_and_drops_late_result() {
        let hub = Arc::new(PluginHub::new(
            Arc::new(PluginRegistry::new()),
            settings(Duration::from_millis(100)),
        ));
        let (channel, mut rx) = connect(&hub);
        let session_id = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;

        let err = hub
            .send_command(&session_id, "slow", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, UnityMcpError::CommandTimeout { .. }));
        assert_eq!(hub.pending_count(), 0);

        let Outbound::Frame(ServerFrame::Execute { id, .. }) = rx.try_recv().unwrap() else {
            panic!("Expected execute frame");
        };
        let late = json!({"type": "command_result", "id": id, "result": {}});
        hub.receive(&channel, &late.to_string()).await;
        assert_eq!(hub.pending_count(), 0);
        assert!(hub.is_connected(&session_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_caller_cleans_pending() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        let session_id = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            hub.send_command(&session_id, "slow", json!({})),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_cleans_pending() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        let session_id = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;
        drop(rx);

        let err = hub
            .send_command(&session_id, "ping", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, UnityMcpError::IpcError(_)));
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_unregisters_session() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        let session_id = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;

        hub.close_channel(&channel, Some(1000)).await;

        assert!(!hub.is_connected(&session_id));
        assert_eq!(hub.registry().count().await, 0);
        let err = hub
            .send_command(&session_id, "ping", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, UnityMcpError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_reconnect_then_stale_close_keeps_new_session() {
        let hub = hub();
        let (old_channel, mut old_rx) = connect(&hub);
        let old = register(&hub, &old_channel, &mut old_rx, "MyGame", "abcd1234").await;
        let (new_channel, mut new_rx) = connect(&hub);
        let new = register(&hub, &new_channel, &mut new_rx, "MyGame", "abcd1234").await;

        hub.close_channel(&old_channel, Some(1001)).await;

        assert!(!hub.is_connected(&old));
        assert!(hub.is_connected(&new));
        assert_eq!(
            hub.resolve_session_id(Some("MyGame@abcd1234")).await.unwrap(),
            new
        );
    }

    #[tokio::test]
    async fn test_reregister_on_same_channel_replaces_session() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        let first = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;
        let second = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;

        assert!(!hub.is_connected(&first));
        assert!(hub.is_connected(&second));
        assert_eq!(hub.registry().count().await, 1);
    }

    #[tokio::test]
    async fn test_send_command_for_instance_resolves() {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;
        spawn_echo_plugin(Arc::clone(&hub), channel, rx);

        let result = hub
            .send_command_for_instance(Some("MyGame@abcd1234"), "read_console", json!({}))
            .await
            .unwrap();
        assert_eq!(result["echo"], "read_console");
    }

    #[tokio::test]
    async fn test_blocking_call_inside_runtime_rejected() {
        let hub = hub();
        let err = hub
            .send_command_blocking(None, "ping", json!({}))
            .unwrap_err();
        assert!(matches!(err, UnityMcpError::BlockingInLoop));
        assert!(matches!(
            hub.list_sessions_blocking(),
            Err(UnityMcpError::BlockingInLoop)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_command_times_out_then_reconnect_serves() {
        let hub = Arc::new(PluginHub::new(
            Arc::new(PluginRegistry::new()),
            HubSettings {
                command_timeout: Duration::from_secs(2),
                retry: RetryPolicy::new(40, Duration::from_millis(250)),
                ..Default::default()
            },
        ));
        let (channel, mut rx) = connect(&hub);
        let session_id = register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;

        let caller = Arc::clone(&hub);
        let in_flight = tokio::spawn(async move {
            caller.send_command(&session_id, "slow", json!({})).await
        });
        match rx.recv().await {
            Some(Outbound::Frame(ServerFrame::Execute { name, .. })) => assert_eq!(name, "slow"),
            other => panic!("Expected execute frame, got {:?}", other),
        }

        hub.close_channel(&channel, Some(1001)).await;
        assert_eq!(hub.registry().count().await, 0);
        assert_eq!(hub.pending_count(), 1);

        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, UnityMcpError::CommandTimeout { .. }));
        assert_eq!(hub.pending_count(), 0);

        // The next call waits out the reload and lands on the new session
        let caller = Arc::clone(&hub);
        let retried = tokio::spawn(async move {
            caller
                .send_command_for_instance(Some("MyGame@abcd1234"), "slow", json!({}))
                .await
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        let (channel, mut rx) = connect(&hub);
        register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;
        spawn_echo_plugin(Arc::clone(&hub), channel, rx);

        let result = retried.await.unwrap().unwrap();
        assert_eq!(result["echo"], "slow");
        assert_eq!(hub.pending_count(), 0);
    }

    /// Hub with one echoing plugin registered as `MyGame@abcd1234`
    async fn echo_hub() -> Arc<PluginHub> {
        let hub = hub();
        let (channel, mut rx) = connect(&hub);
        register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;
        spawn_echo_plugin(Arc::clone(&hub), channel, rx);
        hub
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_call_from_spawn_blocking() {
        let hub = echo_hub().await;
        let result = tokio::task::spawn_blocking(move || {
            hub.send_command_blocking(None, "get_version", json!({}))
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result["echo"], "get_version");
    }

    #[tokio::test]
    async fn test_blocking_call_from_spawn_blocking_on_current_thread() {
        let hub = echo_hub().await;
        let sessions = tokio::task::spawn_blocking(move || hub.list_sessions_blocking())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sessions.sessions.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_call_from_worker_thread() {
        let hub = echo_hub().await;
        let result = tokio::spawn(async move {
            hub.send_command_blocking(Some("abcd1234"), "read_console", json!({}))
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result["echo"], "read_console");
    }

    #[test]
    fn test_blocking_call_from_other_runtime() {
        let hub_runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let hub = hub_runtime.block_on(echo_hub());

        let caller_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = caller_runtime
            .block_on(async { hub.send_command_blocking(None, "ping", json!({})) })
            .unwrap();
        assert_eq!(result["echo"], "ping");
    }

    #[test]
    fn test_blocking_call_from_plain_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();

        let hub = runtime.block_on(async {
            let hub = hub();
            let (channel, mut rx) = connect(&hub);
            register(&hub, &channel, &mut rx, "MyGame", "abcd1234").await;
            spawn_echo_plugin(Arc::clone(&hub), channel, rx);
            hub
        });

        let result = hub
            .send_command_blocking(Some("abcd1234"), "get_version", json!({}))
            .unwrap();
        assert_eq!(result["echo"], "get_version");
        assert_eq!(hub.list_sessions_blocking().unwrap().sessions.len(), 1);
    }
}
