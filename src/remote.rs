//! Remote client: typed request/response objects plus a `reqwest`-backed
//! implementation of the connect/register/disconnect endpoints (component J).
//!
//! The three traits are the seam Connect Service (E) and Register Worker (F)
//! depend on; production wiring uses [`HttpRemoteClient`], tests use fakes.

use crate::entity::{EntityFields, Fingerprint, Identity, RegisterResponseEntry, RetryHint};
use crate::error::{ConnectError, RegisterError};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::time::Duration;

/// `host` or `container`, the `type` field on `POST /connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Host,
    Container,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectRequest {
    pub fingerprint: Fingerprint,
    pub metadata: std::collections::BTreeMap<String, String>,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub protocol: &'static str,
    /// Present only on the `PUT /connect` variant (reconnect).
    #[serde(skip_serializing_if = "Option::is_none", rename = "entityId")]
    pub entity_id: Option<i64>,
}

impl ConnectRequest {
    pub fn new(fingerprint: Fingerprint, metadata: std::collections::BTreeMap<String, String>, kind: EntityKind) -> Self {
        Self { fingerprint, metadata, kind, protocol: "v1", entity_id: None }
    }

    pub fn reconnecting(mut self, entity_id: i64) -> Self {
        self.entity_id = Some(entity_id);
        self
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ConnectResponse {
    pub identity: IdentityWire,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct IdentityWire {
    #[serde(rename = "entityId")]
    pub entity_id: i64,
    #[serde(rename = "GUID")]
    pub guid: String,
}

impl From<IdentityWire> for Identity {
    fn from(wire: IdentityWire) -> Self {
        Identity { id: wire.entity_id, guid: wire.guid }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DisconnectRequest {
    #[serde(rename = "entityId")]
    pub entity_id: i64,
    pub reason: String,
}

/// One entity in a `POST /register/batch` request body.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegisterEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub metadata: std::collections::BTreeMap<String, String>,
}

impl From<&EntityFields> for RegisterEntity {
    fn from(fields: &EntityFields) -> Self {
        Self {
            name: fields.name.clone(),
            entity_type: fields.entity_type.clone(),
            display_name: fields.display_name.clone(),
            metadata: fields.metadata.clone(),
        }
    }
}

#[async_trait]
pub trait ConnectClient: Send + Sync {
    async fn connect(&self, req: ConnectRequest) -> Result<(ConnectResponse, Option<RetryHint>), ConnectError>;
}

#[async_trait]
pub trait RegisterClient: Send + Sync {
    async fn register_batch(
        &self,
        license_key: &str,
        agent_entity_id: i64,
        entities: &[RegisterEntity],
    ) -> Result<(Vec<RegisterResponseEntry>, Option<RetryHint>), RegisterError>;
}

#[async_trait]
pub trait DisconnectClient: Send + Sync {
    async fn disconnect(&self, req: DisconnectRequest) -> Result<(), ConnectError>;
}

/// `reqwest`-backed implementation of all three client traits, shared by
/// Connect Service and Register Worker via `Arc<dyn ...>`.
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    http: reqwest::Client,
    base_url: String,
    license_key: String,
    compression_level: Option<u32>,
}

/// Error constructing an [`HttpRemoteClient`]: an invalid gzip compression
/// level was configured.
#[derive(Debug, thiserror::Error)]
#[error("invalid gzip compression level: {0} (must be 0..=9)")]
pub struct InvalidCompressionLevel(pub u32);

impl HttpRemoteClient {
    pub fn new(base_url: impl Into<String>, license_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            license_key: license_key.into(),
            compression_level: None,
        }
    }

    /// Enable gzip-compressed register bodies at `level` (0..=9). Rejects an
    /// out-of-range level rather than silently clamping it.
    pub fn with_compression(mut self, level: u32) -> Result<Self, InvalidCompressionLevel> {
        if level > 9 {
            return Err(InvalidCompressionLevel(level));
        }
        self.compression_level = Some(level);
        Ok(self)
    }

    fn gzip(&self, level: u32, body: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
        encoder.write_all(body)?;
        encoder.finish()
    }

    fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
        resp.headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl ConnectClient for HttpRemoteClient {
    async fn connect(&self, req: ConnectRequest) -> Result<(ConnectResponse, Option<RetryHint>), ConnectError> {
        let is_reconnect = req.entity_id.is_some();
        let url = format!("{}/connect", self.base_url);
        let builder = if is_reconnect { self.http.put(&url) } else { self.http.post(&url) };

        let resp = builder
            .header("X-License-Key", &self.license_key)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        let retry_after = Self::retry_after(&resp);
        let hint = retry_after.map(|after| RetryHint { after: Some(after), max_backoff: None });

        if status.is_success() {
            let body: ConnectResponse = resp.json().await.map_err(|e| ConnectError::Parse(e.to_string()))?;
            return Ok((body, hint));
        }

        match status.as_u16() {
            401 | 403 => Err(ConnectError::InvalidLicense),
            402 => Err(ConnectError::TrialExpired),
            409 => Err(ConnectError::TrialInactive),
            _ => Err(ConnectError::ServiceError(format!("connect failed with status {status}"))),
        }
    }
}

#[async_trait]
impl DisconnectClient for HttpRemoteClient {
    async fn disconnect(&self, req: DisconnectRequest) -> Result<(), ConnectError> {
        let url = format!("{}/disconnect", self.base_url);
        let resp = self.http.put(&url).header("X-License-Key", &self.license_key).json(&req).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ConnectError::ServiceError(format!("disconnect failed with status {}", resp.status())))
        }
    }
}

#[async_trait]
impl RegisterClient for HttpRemoteClient {
    async fn register_batch(
        &self,
        license_key: &str,
        agent_entity_id: i64,
        entities: &[RegisterEntity],
    ) -> Result<(Vec<RegisterResponseEntry>, Option<RetryHint>), RegisterError> {
        let url = format!("{}/register/batch", self.base_url);
        let json_body = serde_json::to_vec(entities).map_err(|e| RegisterError::Fatal(e.to_string()))?;

        let mut builder = self
            .http
            .post(&url)
            .header("X-License-Key", license_key)
            .header("X-NRI-Agent-Entity-Id", agent_entity_id.to_string())
            .header("Content-Type", "application/json");

        let body = if let Some(level) = self.compression_level {
            let compressed =
                self.gzip(level, &json_body).map_err(|e| RegisterError::Fatal(e.to_string()))?;
            builder = builder.header("Content-Encoding", "gzip");
            compressed
        } else {
            json_body
        };

        let resp = builder.body(body).send().await?;
        let status = resp.status();
        let retry_after = Self::retry_after(&resp);

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RegisterError::RateLimited(format!("rate limited, retry_after={retry_after:?}")));
        }
        if status.is_client_error() {
            return Err(RegisterError::Fatal(format!("register batch rejected with status {status}")));
        }
        if !status.is_success() {
            return Err(RegisterError::Transport(
                resp.error_for_status().unwrap_err(),
            ));
        }

        let entries: Vec<RegisterResponseEntry> =
            resp.json().await.map_err(RegisterError::Transport)?;
        let hint = retry_after.map(|after| RetryHint { after: Some(after), max_backoff: None });
        Ok((entries, hint))
    }
}
