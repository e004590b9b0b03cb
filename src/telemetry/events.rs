use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Structured events emitted by the agent's pipeline components.
///
/// Every component that makes an externally-observable decision (identity
/// transitions, batch sends, supervisor restarts, config reloads) emits one
/// of these instead of logging ad hoc; sinks decide what to do with them.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Identity(IdentityEvent),
    Register(RegisterEvent),
    Supervisor(SupervisorEvent),
    ConfigWatch(ConfigWatchEvent),
}

/// Events emitted by the identity context (component D).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
    /// First non-empty identity received since startup.
    Connect { agent_id: i64 },
    /// Identity changed after already being connected.
    Reconnect { old_agent_id: i64, new_agent_id: i64 },
}

/// Events emitted by the register worker (component F).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterEvent {
    /// A batch was sent and accepted at the wire level (individual entities
    /// may still have failed; see `EntityFailed`).
    BatchSent { entity_count: usize, bytes: usize },
    /// A batch send failed in a retryable way and will be retried.
    BatchRetried { attempt: u64, delay: Duration },
    /// A batch was dropped after exhausting retries or hitting a fatal error.
    BatchDropped { entity_count: usize, reason: String },
    /// A single entity within an otherwise-successful batch failed.
    EntityFailed { name: String, error_msg: String },
}

/// Events emitted by the process supervisor (component H).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The child process is about to be spawned.
    PreRun { attempt: u64 },
    /// The child process exited.
    PostRun { exit_code: Option<i32> },
    /// A restart was requested (crash, config change, or manual request).
    RestartRequested { reason: String },
}

/// Events emitted by the config-directory watcher (component I).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWatchEvent {
    /// A watched file changed and a reload was triggered.
    Changed { path: String },
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentEvent::Identity(event) => write!(f, "Identity::{}", event),
            AgentEvent::Register(event) => write!(f, "Register::{}", event),
            AgentEvent::Supervisor(event) => write!(f, "Supervisor::{}", event),
            AgentEvent::ConfigWatch(event) => write!(f, "ConfigWatch::{}", event),
        }
    }
}

impl fmt::Display for IdentityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityEvent::Connect { agent_id } => write!(f, "Connect(id={})", agent_id),
            IdentityEvent::Reconnect { old_agent_id, new_agent_id } => {
                write!(f, "Reconnect({} -> {})", old_agent_id, new_agent_id)
            }
        }
    }
}

impl fmt::Display for RegisterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterEvent::BatchSent { entity_count, bytes } => {
                write!(f, "BatchSent(entities={}, bytes={})", entity_count, bytes)
            }
            RegisterEvent::BatchRetried { attempt, delay } => {
                write!(f, "BatchRetried(attempt=#{}, delay={:?})", attempt, delay)
            }
            RegisterEvent::BatchDropped { entity_count, reason } => {
                write!(f, "BatchDropped(entities={}, reason={})", entity_count, reason)
            }
            RegisterEvent::EntityFailed { name, error_msg } => {
                write!(f, "EntityFailed(name={}, error={})", name, error_msg)
            }
        }
    }
}

impl fmt::Display for SupervisorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorEvent::PreRun { attempt } => write!(f, "PreRun(attempt=#{})", attempt),
            SupervisorEvent::PostRun { exit_code } => write!(f, "PostRun(exit_code={:?})", exit_code),
            SupervisorEvent::RestartRequested { reason } => {
                write!(f, "RestartRequested(reason={})", reason)
            }
        }
    }
}

impl fmt::Display for ConfigWatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWatchEvent::Changed { path } => write!(f, "Changed(path={})", path),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert an `AgentEvent` into a JSON value for sinks that need it.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &AgentEvent) -> serde_json::Value {
    match event {
        AgentEvent::Identity(i) => match i {
            IdentityEvent::Connect { agent_id } => json!({
                "kind": "identity_connect",
                "agent_id": *agent_id,
            }),
            IdentityEvent::Reconnect { old_agent_id, new_agent_id } => json!({
                "kind": "identity_reconnect",
                "old_agent_id": *old_agent_id,
                "new_agent_id": *new_agent_id,
            }),
        },
        AgentEvent::Register(r) => match r {
            RegisterEvent::BatchSent { entity_count, bytes } => json!({
                "kind": "register_batch_sent",
                "entity_count": *entity_count,
                "bytes": *bytes,
            }),
            RegisterEvent::BatchRetried { attempt, delay } => json!({
                "kind": "register_batch_retried",
                "attempt": *attempt,
                "delay_ms": clamp_u64(delay.as_millis()),
            }),
            RegisterEvent::BatchDropped { entity_count, reason } => json!({
                "kind": "register_batch_dropped",
                "entity_count": *entity_count,
                "reason": reason,
            }),
            RegisterEvent::EntityFailed { name, error_msg } => json!({
                "kind": "register_entity_failed",
                "name": name,
                "error_msg": error_msg,
            }),
        },
        AgentEvent::Supervisor(s) => match s {
            SupervisorEvent::PreRun { attempt } => json!({
                "kind": "supervisor_pre_run",
                "attempt": *attempt,
            }),
            SupervisorEvent::PostRun { exit_code } => json!({
                "kind": "supervisor_post_run",
                "exit_code": *exit_code,
            }),
            SupervisorEvent::RestartRequested { reason } => json!({
                "kind": "supervisor_restart_requested",
                "reason": reason,
            }),
        },
        AgentEvent::ConfigWatch(c) => match c {
            ConfigWatchEvent::Changed { path } => json!({
                "kind": "config_watch_changed",
                "path": path,
            }),
        },
    }
}
