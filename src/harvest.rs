//! Fingerprint and metadata harvesters (component K).
//!
//! Harvest errors are always treated as transient by callers: the Connect
//! Service sleeps one second and retries indefinitely rather than
//! propagating a harvest failure (§7).

use crate::entity::{Fingerprint, Metadata};
use crate::error::HarvestError;
use async_trait::async_trait;
use std::collections::BTreeMap;

#[async_trait]
pub trait FingerprintHarvester: Send + Sync {
    async fn harvest(&self) -> Result<Fingerprint, HarvestError>;
}

#[async_trait]
pub trait MetadataHarvester: Send + Sync {
    async fn harvest(&self) -> Result<Metadata, HarvestError>;
}

/// Default, OS-backed fingerprint harvester: hostname via [`gethostname`],
/// boot id from `/proc/sys/kernel/random/boot_id` where available.
#[derive(Debug, Default, Clone)]
pub struct OsFingerprintHarvester;

#[async_trait]
impl FingerprintHarvester for OsFingerprintHarvester {
    async fn harvest(&self) -> Result<Fingerprint, HarvestError> {
        let hostname = gethostname::gethostname()
            .into_string()
            .map_err(|_| HarvestError::Fingerprint("hostname is not valid UTF-8".into()))?;

        let boot_id = tokio::fs::read_to_string("/proc/sys/kernel/random/boot_id")
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        Ok(Fingerprint {
            hostname,
            boot_id,
            ip_addresses: BTreeMap::new(),
            mac_addresses: BTreeMap::new(),
            cloud_provider_id: None,
        })
    }
}

/// Default, env-backed metadata harvester. Seeds from `NR_HOST_ID`,
/// `NEW_RELIC_METADATA_KUBERNETES_*`, and the comma-separated
/// `NEW_RELIC_METADATA_KUBERNETES_LABELS` variable (expanded into
/// `label.<k>=<v>` entries).
#[derive(Debug, Default, Clone)]
pub struct EnvMetadataHarvester;

const KUBERNETES_PREFIX: &str = "NEW_RELIC_METADATA_KUBERNETES_";
const LABELS_SUFFIX: &str = "LABELS";

#[async_trait]
impl MetadataHarvester for EnvMetadataHarvester {
    async fn harvest(&self) -> Result<Metadata, HarvestError> {
        let mut labels = BTreeMap::new();

        if let Ok(host_id) = std::env::var("NR_HOST_ID") {
            labels.insert("host_id".to_string(), host_id);
        }

        for (key, value) in std::env::vars() {
            let Some(suffix) = key.strip_prefix(KUBERNETES_PREFIX) else { continue };
            if suffix == LABELS_SUFFIX {
                for pair in value.split(',') {
                    if let Some((k, v)) = pair.split_once('=') {
                        labels.insert(format!("label.{k}"), v.to_string());
                    }
                }
            } else {
                labels.insert(format!("kubernetes.{}", suffix.to_lowercase()), value);
            }
        }

        Ok(Metadata { labels })
    }
}
