//! ID Provider: cached front end to the Register Worker for hot paths
//! (component G). A single call resolves a batch of entities into the ones
//! already registered (served from [`IdCache`]) and the ones that still
//! need attention, classified by why they failed.

use crate::entity::{EntityFields, Identity, RegisterRequest};
use crate::error::Classification;
use crate::id_cache::IdCache;
use crate::remote::{RegisterClient, RegisterEntity};
use std::sync::Arc;

/// Why an entity came back unregistered from [`IdProvider::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnregisteredReason {
    /// The wire call itself failed; every entity in the miss batch shares
    /// this reason since none of them got an individual verdict.
    ClientError(String),
    /// The batch succeeded at the wire level but this entity's response
    /// entry reported a per-entity failure.
    EntityError(String),
}

/// One entity that [`IdProvider::resolve`] could not resolve to an ID.
#[derive(Debug, Clone)]
pub struct UnregisteredEntity {
    pub fields: EntityFields,
    pub reason: UnregisteredReason,
}

/// One entity that [`IdProvider::resolve`] resolved to an ID, either from
/// cache or via a fresh registration call.
#[derive(Debug, Clone)]
pub struct RegisteredEntity {
    pub fields: EntityFields,
    pub id: i64,
}

/// Cached front end to the register client (component G). Entities already
/// known to [`IdCache`] never touch the network; cache misses are submitted
/// as a single synchronous batch.
pub struct IdProvider {
    cache: IdCache,
    client: Arc<dyn RegisterClient>,
    license_key: String,
}

impl IdProvider {
    pub fn new(cache: IdCache, client: Arc<dyn RegisterClient>, license_key: impl Into<String>) -> Self {
        Self { cache, client, license_key: license_key.into() }
    }

    pub fn cache(&self) -> &IdCache {
        &self.cache
    }

    /// Resolve `entities` against the cache, falling back to a single
    /// synchronous registration call for the misses.
    ///
    /// Idempotent per §8: calling this twice with identical inputs and no
    /// intervening TTL expiry returns identical `registered`/`unregistered`
    /// sets, and the second call makes no RPC (every entity is now cached).
    pub async fn resolve(
        &self,
        identity: &Identity,
        entities: &[EntityFields],
    ) -> (Vec<RegisteredEntity>, Vec<UnregisteredEntity>) {
        let mut registered = Vec::new();
        let mut misses = Vec::new();

        for fields in entities {
            let key = fields.key();
            match self.cache.get(&key) {
                Some(id) => registered.push(RegisteredEntity { fields: fields.clone(), id }),
                None => misses.push(fields.clone()),
            }
        }

        if misses.is_empty() {
            return (registered, Vec::new());
        }

        let wire_entities: Vec<RegisterEntity> = misses.iter().map(RegisterEntity::from).collect();

        match self.client.register_batch(&self.license_key, identity.id, &wire_entities).await {
            Ok((responses, _hint)) => {
                let mut unregistered = Vec::new();
                for fields in misses {
                    let Some(resp) = responses.iter().find(|r| r.name == fields.name) else {
                        unregistered.push(UnregisteredEntity {
                            reason: UnregisteredReason::EntityError(
                                "no response entry from register endpoint".into(),
                            ),
                            fields,
                        });
                        continue;
                    };
                    if resp.is_failure() {
                        let reason = if resp.error_msg.is_empty() {
                            "entity id 0 with no error message".to_string()
                        } else {
                            resp.error_msg.clone()
                        };
                        unregistered
                            .push(UnregisteredEntity { fields, reason: UnregisteredReason::EntityError(reason) });
                        continue;
                    }
                    self.cache.put(fields.key(), resp.id, &fields.entity_type);
                    registered.push(RegisteredEntity { fields, id: resp.id });
                }
                (registered, unregistered)
            }
            Err(err) => {
                let _ = Classification::Retryable; // wire errors never retried here; resolve() is a single shot
                let reason = err.to_string();
                let unregistered = misses
                    .into_iter()
                    .map(|fields| UnregisteredEntity {
                        fields,
                        reason: UnregisteredReason::ClientError(reason.clone()),
                    })
                    .collect();
                (registered, unregistered)
            }
        }
    }
}

impl From<RegisteredEntity> for RegisterRequest {
    fn from(entity: RegisteredEntity) -> Self {
        let mut req = RegisterRequest::new(entity.fields, String::new());
        req.assigned_id = Some(entity.id);
        req
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::RegisterResponseEntry;
    use crate::error::RegisterError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fields(name: &str) -> EntityFields {
        EntityFields {
            name: name.to_string(),
            entity_type: "host".to_string(),
            id_attributes: Default::default(),
            display_name: name.to_string(),
            metadata: Default::default(),
        }
    }

    struct ScriptedClient {
        calls: AtomicUsize,
        response: Mutex<Option<Result<Vec<RegisterResponseEntry>, RegisterError>>>,
    }

    impl ScriptedClient {
        fn new(response: Result<Vec<RegisterResponseEntry>, RegisterError>) -> Self {
            Self { calls: AtomicUsize::new(0), response: Mutex::new(Some(response)) }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RegisterClient for ScriptedClient {
        async fn register_batch(
            &self,
            _license_key: &str,
            _agent_entity_id: i64,
            _entities: &[RegisterEntity],
        ) -> Result<(Vec<RegisterResponseEntry>, Option<crate::entity::RetryHint>), RegisterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let response = self.response.lock().unwrap().take();
            match response {
                Some(Ok(entries)) => Ok((entries, None)),
                Some(Err(e)) => Err(e),
                None => Ok((vec![], None)),
            }
        }
    }

    fn ok_entry(name: &str, id: i64) -> RegisterResponseEntry {
        RegisterResponseEntry { name: name.to_string(), id, error_msg: String::new(), warnings: vec![] }
    }

    fn identity() -> Identity {
        Identity { id: 1, guid: "G".into() }
    }

    #[tokio::test]
    async fn misses_are_registered_and_cached() {
        let client = Arc::new(ScriptedClient::new(Ok(vec![ok_entry("a", 10)])));
        let provider =
            IdProvider::new(IdCache::new(Arc::new(ManualClock::new())), client.clone(), "license");

        let (registered, unregistered) = provider.resolve(&identity(), &[fields("a")]).await;
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].id, 10);
        assert!(unregistered.is_empty());
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn second_resolve_is_idempotent_and_skips_the_rpc() {
        let client = Arc::new(ScriptedClient::new(Ok(vec![ok_entry("a", 10)])));
        let provider =
            IdProvider::new(IdCache::new(Arc::new(ManualClock::new())), client.clone(), "license");

        let first = provider.resolve(&identity(), &[fields("a")]).await;
        let second = provider.resolve(&identity(), &[fields("a")]).await;

        assert_eq!(first.0.len(), second.0.len());
        assert_eq!(first.0[0].id, second.0[0].id);
        assert_eq!(client.call_count(), 1, "second resolve should be served entirely from cache");
    }

    #[tokio::test]
    async fn wire_error_marks_every_miss_as_client_error() {
        let client = Arc::new(ScriptedClient::new(Err(RegisterError::Fatal("bad request".into()))));
        let provider =
            IdProvider::new(IdCache::new(Arc::new(ManualClock::new())), client, "license");

        let (registered, unregistered) = provider.resolve(&identity(), &[fields("a"), fields("b")]).await;
        assert!(registered.is_empty());
        assert_eq!(unregistered.len(), 2);
        assert!(unregistered.iter().all(|u| matches!(u.reason, UnregisteredReason::ClientError(_))));
    }

    #[tokio::test]
    async fn per_entity_error_only_fails_that_entity() {
        let bad = RegisterResponseEntry {
            name: "b".into(),
            id: 0,
            error_msg: "quota exceeded".into(),
            warnings: vec![],
        };
        let client = Arc::new(ScriptedClient::new(Ok(vec![ok_entry("a", 10), bad])));
        let provider =
            IdProvider::new(IdCache::new(Arc::new(ManualClock::new())), client, "license");

        let (registered, unregistered) = provider.resolve(&identity(), &[fields("a"), fields("b")]).await;
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].fields.name, "a");
        assert_eq!(unregistered.len(), 1);
        assert_eq!(unregistered[0].fields.name, "b");
        assert!(matches!(unregistered[0].reason, UnregisteredReason::EntityError(_)));
    }
}
