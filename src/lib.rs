#![deny(unsafe_code)]

//! # Agent Core
//!
//! Host-resident telemetry agent pipeline: establishes the agent's identity
//! with the control plane, resolves entities to numeric IDs, batches and
//! retries registration traffic, and supervises a log-forwarder child
//! process whose configuration is re-rendered whenever the agent's identity,
//! hostname, or on-disk config changes.
//!
//! ## Pipeline
//!
//! - [`identity_context`] holds the agent's current `(ID, GUID)` and notifies
//!   subscribers of connect/reconnect transitions.
//! - [`connect_service`] performs the initial connect handshake and keeps it
//!   current as host fingerprint/metadata change.
//! - [`id_cache`] and [`id_provider`] resolve entities to IDs, caching hits
//!   and falling back to [`register`]'s batching worker for misses.
//! - [`supervisor`] renders the log-forwarder config via [`renderer`], spawns
//!   the child process, and restarts it when identity, hostname, or the
//!   on-disk config directory change (observed through [`config_watcher`]).
//! - [`telemetry`] carries structured events out of every component above
//!   through a composable `tower::Service<AgentEvent>` sink.
//!
//! `unsafe` is limited to the supervisor's POSIX signal send, which lives
//! behind `#[allow(unsafe_code)]` at its single call site; every other module
//! is safe code.

mod backoff;
pub mod config;
mod config_watcher;
mod connect_service;
mod entity;
mod error;
mod harvest;
mod id_cache;
mod id_provider;
mod identity_context;
mod register;
mod remote;
mod renderer;
mod retrier;
mod supervisor;

pub mod clock;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use backoff::{Backoff, Cause, MAX_BACKOFF};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::AgentConfig;
pub use config_watcher::{ConfigChanged, ConfigDirWatcher};
pub use connect_service::ConnectService;
pub use entity::{EntityFields, Fingerprint, Identity, Metadata, RegisterRequest, RegisterResponseEntry, RetryHint};
pub use error::{
    Classification, ConfigError, ConnectError, EmptyIdentityError, HarvestError, RegisterError,
    RenderError, WireOutcome,
};
pub use harvest::{EnvMetadataHarvester, FingerprintHarvester, MetadataHarvester, OsFingerprintHarvester};
pub use id_cache::IdCache;
pub use id_provider::{IdProvider, RegisteredEntity, UnregisteredEntity, UnregisteredReason};
pub use identity_context::{Interest, IdentityContext};
pub use register::{RegisterWorker, RegisterWorkerConfig};
pub use remote::{ConnectClient, DisconnectClient, HttpRemoteClient, RegisterClient, RegisterEntity};
pub use renderer::{render, ForwardConfig, ForwardDestination, LogSource, LogSourceConfig, RenderedConfig};
pub use retrier::{Mode, Retrier};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use supervisor::{
    build_args, binaries_available, classify_line, ChildLogLevel, ConfigSource, ConfigStore,
    FileConfigStore, HostnameWatch, StaticConfigSource, Supervisor, YamlFileConfigSource,
};
pub use telemetry::{AgentEvent, TelemetrySink};

pub mod prelude;
