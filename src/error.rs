//! Error taxonomy and the centralised `classify()` helper.
//!
//! §9 calls out "ad-hoc error classification scattered across the HTTP
//! layer" as a re-architecture target: every caller that needs to decide
//! whether a wire failure is retryable consults [`classify`] here, never a
//! bespoke status-code check of its own.

use thiserror::Error;

/// Outcome of classifying a remote-call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Retry the same request/batch (connection failure, rate limiting).
    Retryable,
    /// Give up on the request/batch entirely; do not retry.
    Fatal,
    /// The batch succeeded at the wire level but this particular entity
    /// failed; other entities in the same batch are unaffected.
    PerEntity,
}

/// Coarse shape of an HTTP response, enough to classify it without needing
/// the concrete transport error type.
#[derive(Debug, Clone, Copy)]
pub struct WireOutcome {
    /// `None` means the request never got a response (connection refused,
    /// DNS failure, timeout before headers).
    pub status: Option<u16>,
    pub is_rate_limited: bool,
}

/// Centralised classification used by the register worker and connect
/// service. Connection failures and explicit rate-limit signals are
/// retryable; any other 4xx is fatal for the batch; anything else
/// (2xx/3xx, unexpected 5xx) is treated as retryable since it is most
/// likely transient.
pub fn classify(outcome: WireOutcome) -> Classification {
    match outcome.status {
        None => Classification::Retryable,
        Some(status) if outcome.is_rate_limited => {
            let _ = status;
            Classification::Retryable
        }
        Some(status) if (400..500).contains(&status) => Classification::Fatal,
        Some(status) if (500..600).contains(&status) => Classification::Retryable,
        Some(_) => Classification::Retryable,
    }
}

/// Errors surfaced by the fingerprint/metadata harvesters. Always transient
/// per §7: callers sleep one second and retry indefinitely.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("failed to read host fingerprint: {0}")]
    Fingerprint(String),
    #[error("failed to read host metadata: {0}")]
    Metadata(String),
}

/// Errors from the remote identity service.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server rejected license key")]
    InvalidLicense,
    #[error("trial has expired")]
    TrialExpired,
    #[error("trial is not yet active")]
    TrialInactive,
    #[error("server-side error: {0}")]
    ServiceError(String),
    #[error("malformed response: {0}")]
    Parse(String),
}

impl ConnectError {
    /// Coarse cause used by [`crate::backoff::Cause`] to pick a ceiling.
    pub fn cause(&self) -> crate::backoff::Cause {
        use crate::backoff::Cause;
        match self {
            ConnectError::InvalidLicense => Cause::InvalidLicense,
            ConnectError::TrialExpired => Cause::TrialExpired,
            ConnectError::TrialInactive => Cause::TrialInactive,
            ConnectError::ServiceError(_) => Cause::ServiceError,
            ConnectError::Transport(_) | ConnectError::Parse(_) => Cause::Other,
        }
    }
}

/// Programming error: an empty agent ID reached the disconnect path.
#[derive(Debug, Error)]
#[error("disconnect called with an empty agent identity")]
pub struct EmptyIdentityError;

/// Errors from the batch registration call.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server rejected the batch: {0}")]
    Fatal(String),
    #[error("server asked us to slow down: {0}")]
    RateLimited(String),
}

impl RegisterError {
    pub fn classification(&self) -> Classification {
        match self {
            RegisterError::Transport(_) => Classification::Retryable,
            RegisterError::RateLimited(_) => Classification::Retryable,
            RegisterError::Fatal(_) => Classification::Fatal,
        }
    }
}

/// Errors constructing or rendering the effective log-forwarder config.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid log-forwarder configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to write rendered config: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors loading [`crate::config::AgentConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
