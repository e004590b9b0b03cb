//! Core data model: identity, fingerprint, entity keys and registration
//! requests/responses (§3).

use std::collections::BTreeMap;
use std::time::Duration;

/// `(ID, GUID)` pair assigned to the host by the control plane. The empty
/// identity `{0, ""}` means "not yet connected".
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Identity {
    pub id: i64,
    pub guid: String,
}

impl Identity {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.id == 0
    }
}

/// Value-stable summary of host attributes used as connect input.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint {
    pub hostname: String,
    pub boot_id: String,
    pub ip_addresses: BTreeMap<String, String>,
    pub mac_addresses: BTreeMap<String, String>,
    pub cloud_provider_id: Option<String>,
}

/// Free-form host/process metadata gathered alongside the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Metadata {
    pub labels: BTreeMap<String, String>,
}

/// The fields that together identify and describe an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EntityFields {
    pub name: String,
    pub entity_type: String,
    pub id_attributes: BTreeMap<String, String>,
    pub display_name: String,
    pub metadata: BTreeMap<String, String>,
}

impl EntityFields {
    /// Build the canonical entity key: `"<type>:<name>[:k=v...]"` with
    /// attributes sorted by lowercased key, last-value-wins on duplicates,
    /// and empty-key attributes dropped. An empty name produces an empty
    /// key regardless of type/attributes.
    pub fn key(&self) -> String {
        if self.name.is_empty() {
            return String::new();
        }

        let mut sorted: BTreeMap<String, String> = BTreeMap::new();
        for (k, v) in &self.id_attributes {
            if k.is_empty() {
                continue;
            }
            sorted.insert(k.to_lowercase(), v.clone());
        }

        let mut key = format!("{}:{}", self.entity_type, self.name);
        for (k, v) in sorted {
            key.push(':');
            key.push_str(&k);
            key.push('=');
            key.push_str(&v);
        }
        key
    }

    /// Approximate wire size in bytes, used by the register worker's
    /// byte-budget enforcement. Matches the JSON the entity would actually
    /// serialize to closely enough for batching decisions.
    pub fn json_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// A unit of work for the register worker: the payload to hand to
/// integrations downstream, plus the fields that describe the entity.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub payload: serde_json::Value,
    pub agent_version: String,
    pub entity_fields: EntityFields,
    /// Filled in once the entity has been assigned an ID.
    pub assigned_id: Option<i64>,
}

impl RegisterRequest {
    pub fn new(entity_fields: EntityFields, agent_version: impl Into<String>) -> Self {
        Self {
            payload: serde_json::Value::Null,
            agent_version: agent_version.into(),
            entity_fields,
            assigned_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.entity_fields.name
    }
}

/// One entity's result from `POST /register/batch`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegisterResponseEntry {
    pub name: String,
    #[serde(rename = "entityId", default)]
    pub id: i64,
    #[serde(rename = "errorMsg", default)]
    pub error_msg: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RegisterResponseEntry {
    /// `ErrorMsg != ""` is a per-entity failure; so is `ID == 0` with an
    /// empty `ErrorMsg` (§3's explicit ruling on the source's "success with
    /// zero" ambiguity — see `DESIGN.md`).
    pub fn is_failure(&self) -> bool {
        !self.error_msg.is_empty() || self.id == 0
    }
}

/// Retry hint returned by the remote control plane (`Retry-After` header and
/// any server-suggested ceiling).
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryHint {
    pub after: Option<Duration>,
    pub max_backoff: Option<Duration>,
}
