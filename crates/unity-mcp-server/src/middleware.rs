//! Per-caller active instance routing
//!
//! Callers pick a Unity instance once with `set_active_instance`; every later
//! tool call is routed to it without naming it again.

use crate::resolve::SessionResolver;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Key used when the caller carries no identity
pub const GLOBAL_KEY: &str = "global";

/// Who is calling a tool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    /// MCP connection session id
    pub session_id: Option<String>,
    pub client_id: Option<String>,
}

impl CallerIdentity {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn with_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            client_id: None,
        }
    }

    /// Binding key: session id, then client id, then `"global"`
    pub fn key(&self) -> &str {
        [self.session_id.as_deref(), self.client_id.as_deref()]
            .into_iter()
            .flatten()
            .find(|k| !k.is_empty())
            .unwrap_or(GLOBAL_KEY)
    }
}

/// Request-scoped routing state handed to tool handlers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub caller: CallerIdentity,
    /// Active instance id, if one is selected
    pub unity_instance: Option<String>,
    /// Session serving that instance (hub mode only)
    pub unity_session_id: Option<String>,
}

/// Tracks the active instance per caller and injects it into calls
pub struct InstanceRouter {
    active: Mutex<HashMap<String, String>>,
    resolver: Option<SessionResolver>,
}

impl InstanceRouter {
    /// Router that validates bindings against live hub sessions
    pub fn new(resolver: Option<SessionResolver>) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            resolver,
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_active_instance(&self, caller: &CallerIdentity, instance_id: &str) {
        self.active()
            .insert(caller.key().to_string(), instance_id.to_string());
    }

    pub fn get_active_instance(&self, caller: &CallerIdentity) -> Option<String> {
        self.active().get(caller.key()).cloned()
    }

    pub fn clear_active_instance(&self, caller: &CallerIdentity) {
        self.active().remove(caller.key());
    }

    /// Build the call context for `caller`
    ///
    /// A binding that no longer resolves is cleared and the call proceeds
    /// without an instance.
    pub async fn route(&self, caller: &CallerIdentity) -> CallContext {
        let mut ctx = CallContext {
            caller: caller.clone(),
            ..Default::default()
        };
        let Some(instance) = self.get_active_instance(caller) else {
            return ctx;
        };

        if let Some(resolver) = &self.resolver {
            match resolver.resolve(Some(&instance)).await {
                Ok(session_id) => ctx.unity_session_id = Some(session_id),
                Err(e) => {
                    warn!(
                        "Active instance {} for caller {} is gone ({}); clearing selection",
                        instance,
                        caller.key(),
                        e
                    );
                    self.clear_active_instance(caller);
                    return ctx;
                }
            }
        }

        debug!("Routing call from {} to {}", caller.key(), instance);
        ctx.unity_instance = Some(instance);
        ctx
    }

    /// Route `caller` and run `next` with the resulting context
    pub async fn call<F, Fut, T>(&self, caller: &CallerIdentity, next: F) -> T
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let ctx = self.route(caller).await;
        next(ctx).await
    }
}
