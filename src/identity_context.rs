//! Identity context: the process-wide slot holding the agent's current
//! `(ID, GUID)` identity (component D).
//!
//! Reads are lock-free (`arc_swap::ArcSwap`).
//! Callers that need to block until a non-empty identity arrives subscribe to
//! a `tokio::sync::watch` channel; callers that want every subsequent
//! transition (not just the current value) register an event subscriber.

use crate::entity::Identity;
use crate::telemetry::events::{AgentEvent, IdentityEvent};
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Which transition kinds a subscriber wants to hear about (§4.D "interest
/// mask"). A subscriber registered with `connect: true, reconnect: false`
/// never sees a `Reconnect` notification, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub connect: bool,
    pub reconnect: bool,
}

impl Interest {
    pub const CONNECT: Interest = Interest { connect: true, reconnect: false };
    pub const RECONNECT: Interest = Interest { connect: false, reconnect: true };
    pub const BOTH: Interest = Interest { connect: true, reconnect: true };

    fn wants(&self, event: &AgentEvent) -> bool {
        match event {
            AgentEvent::Identity(IdentityEvent::Connect { .. }) => self.connect,
            AgentEvent::Identity(IdentityEvent::Reconnect { .. }) => self.reconnect,
            _ => false,
        }
    }
}

/// A registered listener for identity transition events. Delivery is
/// fire-and-forget: a full channel drops the event rather than blocking the
/// setter.
struct Subscriber {
    tx: mpsc::Sender<AgentEvent>,
    interest: Interest,
}

/// Process-wide identity slot plus its transition notifications.
pub struct IdentityContext {
    current: Arc<ArcSwap<Identity>>,
    watch_tx: watch::Sender<Identity>,
    watch_rx: watch::Receiver<Identity>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl std::fmt::Debug for IdentityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityContext").field("current", &self.current.load()).finish()
    }
}

impl Default for IdentityContext {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityContext {
    pub fn new() -> Self {
        let (watch_tx, watch_rx) = watch::channel(Identity::empty());
        Self {
            current: Arc::new(ArcSwap::from_pointee(Identity::empty())),
            watch_tx,
            watch_rx,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Current identity snapshot. Cheap: an `Arc` clone, no lock.
    pub fn get(&self) -> Arc<Identity> {
        self.current.load_full()
    }

    /// Register an event subscriber interested in `interest`'s transition
    /// kinds. The channel has capacity 1; a setter that finds it full drops
    /// the notification rather than waiting.
    pub fn subscribe(&self, interest: Interest) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers
            .lock()
            .expect("IdentityContext.subscribers poisoned")
            .push(Subscriber { tx, interest });
        rx
    }

    /// Block until the identity is non-empty, or `cancel` fires — whichever
    /// happens first. On cancellation, returns whatever the slot currently
    /// holds (possibly still empty).
    pub async fn wait_for_non_empty(&self, cancel: &CancellationToken) -> Arc<Identity> {
        let mut rx = self.watch_rx.clone();
        loop {
            {
                let current = self.current.load_full();
                if !current.is_empty() {
                    return current;
                }
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return self.current.load_full();
                    }
                }
                _ = cancel.cancelled() => {
                    return self.current.load_full();
                }
            }
        }
    }

    /// Update the identity, applying the three transition rules:
    /// - empty -> non-empty: first connect, broadcasts `Connect`.
    /// - non-empty -> different non-empty: `Reconnect`.
    /// - unchanged: silent, idempotent store (no event).
    pub fn set(&self, new: Identity) {
        let old = self.current.load_full();

        if *old == new {
            return;
        }

        self.current.store(Arc::new(new.clone()));
        let _ = self.watch_tx.send(new.clone());

        let event = if old.is_empty() {
            AgentEvent::Identity(IdentityEvent::Connect { agent_id: new.id })
        } else {
            AgentEvent::Identity(IdentityEvent::Reconnect {
                old_agent_id: old.id,
                new_agent_id: new.id,
            })
        };
        self.broadcast(event);
    }

    fn broadcast(&self, event: AgentEvent) {
        let mut subs = self.subscribers.lock().expect("IdentityContext.subscribers poisoned");
        subs.retain(|sub| {
            if !sub.interest.wants(&event) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}
