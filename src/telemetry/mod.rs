//! Telemetry and observability for the agent pipeline.
//!
//! This module provides the event system that lets every pipeline component
//! emit structured telemetry instead of ad hoc logging. Events flow through
//! `TelemetrySink` implementations which can log, aggregate, or forward
//! events to external systems.
//!
//! # Event Types
//!
//! Each component emits its own event family:
//!
//! - **Identity**: `Connect`, `Reconnect`
//! - **Register**: `BatchSent`, `BatchRetried`, `BatchDropped`, `EntityFailed`
//! - **Supervisor**: `PreRun`, `PostRun`, `RestartRequested`
//! - **ConfigWatch**: `Changed`
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<AgentEvent>` for composability.

pub mod events;
pub mod sinks;

pub use events::{AgentEvent, ConfigWatchEvent, IdentityEvent, RegisterEvent, SupervisorEvent};
pub use sinks::{
    emit_best_effort, ComposedSinkError, FallbackSink, LogSink, MemorySink, MulticastSink,
    NonBlockingSink, NullSink, StreamingSink, TelemetrySink,
};

#[cfg(test)]
mod tests {
    // Note: Tests have been moved to submodules (events.rs and sinks.rs)
}