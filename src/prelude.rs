//! Convenient re-exports for the common agent types.
pub use crate::{
    backoff::{Backoff, Cause, MAX_BACKOFF},
    clock::{Clock, ManualClock, MonotonicClock},
    config::AgentConfig,
    connect_service::ConnectService,
    entity::{EntityFields, Fingerprint, Identity, Metadata, RegisterRequest},
    error::{Classification, ConnectError, RegisterError, RenderError},
    id_cache::IdCache,
    id_provider::{IdProvider, RegisteredEntity, UnregisteredEntity},
    identity_context::{IdentityContext, Interest},
    register::{RegisterWorker, RegisterWorkerConfig},
    remote::{ConnectClient, DisconnectClient, HttpRemoteClient, RegisterClient},
    renderer::{render, ForwardConfig, LogSourceConfig, RenderedConfig},
    retrier::{Mode, Retrier},
    sleeper::{Sleeper, TokioSleeper},
    supervisor::Supervisor,
    telemetry::{AgentEvent, LogSink, NullSink, TelemetrySink},
};
