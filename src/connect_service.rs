//! Connect Service: harvests the host fingerprint/metadata, calls the
//! remote identity service, and surfaces the resulting identity (component
//! E).

use crate::backoff::Backoff;
use crate::entity::{Fingerprint, Identity, RetryHint};
use crate::error::{ConnectError, EmptyIdentityError};
use crate::harvest::{FingerprintHarvester, MetadataHarvester};
use crate::remote::{ConnectClient, ConnectRequest, DisconnectClient, DisconnectRequest, EntityKind};
use crate::retrier::Retrier;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Drives the connect/reconnect loop described in §4.E.
pub struct ConnectService {
    fingerprint_harvester: Arc<dyn FingerprintHarvester>,
    metadata_harvester: Arc<dyn MetadataHarvester>,
    client: Arc<dyn ConnectClient>,
    disconnect_client: Arc<dyn DisconnectClient>,
    retrier: Retrier,
    sleeper: Arc<dyn Sleeper>,
    last_fingerprint: Mutex<Option<Fingerprint>>,
}

impl ConnectService {
    pub fn new(
        fingerprint_harvester: Arc<dyn FingerprintHarvester>,
        metadata_harvester: Arc<dyn MetadataHarvester>,
        client: Arc<dyn ConnectClient>,
        disconnect_client: Arc<dyn DisconnectClient>,
    ) -> Self {
        Self {
            fingerprint_harvester,
            metadata_harvester,
            client,
            disconnect_client,
            retrier: Retrier::new(Backoff::default_agent()),
            sleeper: Arc::new(TokioSleeper),
            last_fingerprint: Mutex::new(None),
        }
    }

    /// Loop until a non-empty identity is obtained or `cancel` fires.
    pub async fn connect(&self, cancel: &CancellationToken) -> Option<Identity> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let fingerprint = match self.fingerprint_harvester.harvest().await {
                Ok(f) => f,
                Err(_) => {
                    self.sleep_one_second(cancel).await;
                    continue;
                }
            };
            let metadata = match self.metadata_harvester.harvest().await {
                Ok(m) => m,
                Err(_) => {
                    self.sleep_one_second(cancel).await;
                    continue;
                }
            };

            let req = ConnectRequest::new(fingerprint.clone(), metadata.labels.clone(), EntityKind::Host);
            match self.client.connect(req).await {
                Ok((resp, hint)) => {
                    let identity = Identity::from(resp.identity);
                    if !identity.is_empty() {
                        *self.last_fingerprint.lock().expect("last_fingerprint poisoned") =
                            Some(fingerprint);
                        self.retrier.reset();
                        return Some(identity);
                    }
                    self.backoff_then_sleep(hint, None, cancel).await;
                }
                Err(err) => {
                    self.backoff_then_sleep(None, Some(&err), cancel).await;
                }
            }
        }
    }

    /// Re-harvest the fingerprint; if unchanged from the last connect,
    /// return `current` without an RPC. Otherwise loop with retry exactly
    /// like [`Self::connect`].
    pub async fn connect_update(&self, current: &Identity, cancel: &CancellationToken) -> Option<Identity> {
        let fingerprint = self.fingerprint_harvester.harvest().await.ok()?;
        let unchanged = self
            .last_fingerprint
            .lock()
            .expect("last_fingerprint poisoned")
            .as_ref()
            .map(|last| *last == fingerprint)
            .unwrap_or(false);

        if unchanged {
            return Some(current.clone());
        }

        self.connect(cancel).await
    }

    async fn sleep_one_second(&self, cancel: &CancellationToken) {
        crate::sleeper::sleep_cancellable(&*self.sleeper, Duration::from_secs(1), cancel).await;
    }

    /// §4.E / §7: a server-provided `Retry-After` wins over exponential
    /// backoff — reset the exponential schedule and sleep exactly `after`.
    /// Otherwise fall back to cause-based exponential backoff.
    async fn backoff_then_sleep(
        &self,
        hint: Option<RetryHint>,
        err: Option<&ConnectError>,
        cancel: &CancellationToken,
    ) {
        if let Some(after) = hint.and_then(|h| h.after).filter(|d| !d.is_zero()) {
            self.retrier.reset();
            self.retrier.schedule_after(after);
            self.retrier.sleep(cancel).await;
            return;
        }

        let max_override = err.map(|e| e.cause().max_override().unwrap_or(self.retrier.backoff().max()));
        match max_override {
            Some(cap) => {
                self.retrier.schedule_with_backoff_bounded(cap);
            }
            None => {
                self.retrier.schedule_with_backoff();
            }
        }
        self.retrier.sleep(cancel).await;
    }

    /// Best-effort disconnect. Surfaces [`EmptyIdentityError`] rather than
    /// sending a request with an empty identity (a programming error).
    pub async fn disconnect(&self, id: &Identity, reason: impl Into<String>) -> Result<(), EmptyIdentityError> {
        if id.is_empty() {
            return Err(EmptyIdentityError);
        }
        let req = DisconnectRequest { entity_id: id.id, reason: reason.into() };
        let _ = self.disconnect_client.disconnect(req).await;
        Ok(())
    }
}
