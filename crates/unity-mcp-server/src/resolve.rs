//! Session resolution with reload-tolerant retry
//!
//! During a Unity domain reload the plugin's channel is torn down and comes
//! back a few seconds later. Rather than failing every in-flight call, the
//! resolver polls the registry for a bounded window until a matching session
//! reappears.

use crate::registry::PluginRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use unity_mcp_core::instance::target_hash;
use unity_mcp_core::{Result, ServerConfig, UnityMcpError};

/// Shortest sleep between polls
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for a session during a reload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 40,
            retry_interval: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            max_retries,
            retry_interval,
        }
    }

    /// Same reload values the direct-socket transport uses
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.reload_max_retries, config.reload_retry)
    }

    pub fn poll_interval(&self) -> Duration {
        self.retry_interval.max(MIN_POLL_INTERVAL)
    }

    /// Total wait window
    pub fn window(&self) -> Duration {
        self.poll_interval() * self.max_retries.max(1)
    }
}

/// Outcome of a single registry poll
#[derive(Debug, PartialEq)]
enum Attempt {
    Found(String),
    Missing,
    Ambiguous(Vec<String>),
}

/// Maps instance references to live plugin session ids
#[derive(Clone)]
pub struct SessionResolver {
    registry: Arc<PluginRegistry>,
    policy: RetryPolicy,
}

impl SessionResolver {
    pub fn new(registry: Arc<PluginRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Resolve `None`, a hash, a hash prefix, or `Name@hash` to a session id
    ///
    /// Ambiguity fails at once since waiting cannot fix it; an absent session
    /// is polled for until the policy window elapses.
    pub async fn resolve(&self, instance: Option<&str>) -> Result<String> {
        let target = target_hash(instance);
        let label = instance.unwrap_or("default");

        let started = Instant::now();
        let deadline = started + self.policy.window();
        let mut waited = false;

        loop {
            match self.try_once(target).await {
                Attempt::Found(session_id) => {
                    if waited {
                        debug!(
                            "Plugin session restored after {:.3}s (instance={})",
                            started.elapsed().as_secs_f64(),
                            label
                        );
                    }
                    return Ok(session_id);
                }
                Attempt::Ambiguous(instances) => {
                    return Err(UnityMcpError::AmbiguousInstance { instances });
                }
                Attempt::Missing => {}
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if !waited {
                waited = true;
                debug!(
                    "No plugin session available (instance={}); waiting up to {:.2}s",
                    label,
                    (deadline - now).as_secs_f64()
                );
            }
            sleep(self.policy.poll_interval()).await;
        }

        warn!(
            "No Unity plugin reconnected within {:.2}s (instance={})",
            self.policy.window().as_secs_f64(),
            label
        );
        Err(UnityMcpError::NoPluginConnected {
            waited: started.elapsed(),
        })
    }

    async fn try_once(&self, target: Option<&str>) -> Attempt {
        if let Some(hash) = target {
            if let Some(session_id) = self.registry.get_session_id_by_hash(hash).await {
                return Attempt::Found(session_id);
            }
            // Fall back to a unique hash prefix
            let sessions = self.registry.list_sessions().await;
            let mut matches: Vec<_> = sessions
                .values()
                .filter(|s| s.project_hash.starts_with(hash))
                .collect();
            return match matches.len() {
                0 => Attempt::Missing,
                1 => Attempt::Found(matches.remove(0).session_id.clone()),
                _ => {
                    let mut ids: Vec<String> = matches.iter().map(|s| s.instance_id()).collect();
                    ids.sort();
                    Attempt::Ambiguous(ids)
                }
            };
        }

        let sessions = self.registry.list_sessions().await;
        match sessions.len() {
            0 => Attempt::Missing,
            1 => sessions
                .into_keys()
                .next()
                .map_or(Attempt::Missing, Attempt::Found),
            _ => {
                let mut ids: Vec<String> = sessions.values().map(|s| s.instance_id()).collect();
                ids.sort();
                Attempt::Ambiguous(ids)
            }
        }
    }
}
