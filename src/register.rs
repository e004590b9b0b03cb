//! Register Worker: consumes per-entity requests, batches them by count,
//! bytes, and age, and resolves each through the remote registration
//! endpoint (component F — §4.F, the hardest subcomponent).
//!
//! One worker owns one in-flight batch at a time; the batch lives as a
//! `Name -> RegisterRequest` map so response matching is O(1) and each
//! batch holds at most one request per entity name (last write wins).

use crate::backoff::Backoff;
use crate::entity::RegisterRequest;
use crate::error::Classification;
use crate::identity_context::IdentityContext;
use crate::remote::{RegisterClient, RegisterEntity};
use crate::sleeper::{sleep_cancellable, Sleeper, TokioSleeper};
use crate::telemetry::events::{AgentEvent, RegisterEvent};
use crate::telemetry::sinks::emit_best_effort;
use crate::telemetry::TelemetrySink;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Batching/retry tunables. See `SPEC_FULL.md` §4.F and component N
/// (`AgentConfig::register`) for where these come from in a wired-up agent.
#[derive(Debug, Clone)]
pub struct RegisterWorkerConfig {
    pub max_batch_size: usize,
    pub max_batch_size_bytes: usize,
    pub max_batch_duration: Duration,
    pub max_retry_backoff: Duration,
    pub verbose: bool,
}

impl Default for RegisterWorkerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_size_bytes: 1_000_000,
            max_batch_duration: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(60),
            verbose: false,
        }
    }
}

/// Drives the IDLE -> ACCUMULATE -> FLUSH state machine described in §4.F.
pub struct RegisterWorker<S> {
    config: RegisterWorkerConfig,
    client: Arc<dyn RegisterClient>,
    identity: Arc<IdentityContext>,
    license_key: String,
    agent_labels: std::collections::BTreeMap<String, String>,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
    sink: S,
}

impl<S> RegisterWorker<S>
where
    S: TelemetrySink,
    S::Future: Send,
{
    pub fn new(
        config: RegisterWorkerConfig,
        client: Arc<dyn RegisterClient>,
        identity: Arc<IdentityContext>,
        license_key: impl Into<String>,
        sink: S,
    ) -> Self {
        Self {
            config,
            client,
            identity,
            license_key: license_key.into(),
            agent_labels: Default::default(),
            backoff: Backoff::default_agent(),
            sleeper: Arc::new(TokioSleeper),
            sink,
        }
    }

    pub fn with_agent_labels(mut self, labels: std::collections::BTreeMap<String, String>) -> Self {
        self.agent_labels = labels;
        self
    }

    async fn emit(&self, event: RegisterEvent) {
        emit_best_effort(self.sink.clone(), AgentEvent::Register(event)).await;
    }

    /// Run the worker to completion: consumes `input` until it closes or
    /// `cancel` fires, stamping each registered request with its assigned ID
    /// and forwarding it on `output`.
    ///
    /// On cancellation the in-flight batch is dropped, not flushed — the
    /// producer is expected to have already stopped feeding `input` (§4.F
    /// shutdown invariant).
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<RegisterRequest>,
        output: mpsc::Sender<RegisterRequest>,
        cancel: CancellationToken,
    ) {
        let mut batch: HashMap<String, RegisterRequest> = HashMap::new();
        let mut batch_bytes: usize = 0;
        let mut deadline = Instant::now() + self.config.max_batch_duration;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return;
                }
                maybe_req = input.recv() => {
                    match maybe_req {
                        None => return,
                        Some(req) => {
                            self.accept(req, &mut batch, &mut batch_bytes, &output, &cancel, &mut deadline).await;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !batch.is_empty() => {
                    self.flush(&mut batch, &mut batch_bytes, &output, &cancel).await;
                    deadline = Instant::now() + self.config.max_batch_duration;
                }
            }
        }
    }

    async fn accept(
        &mut self,
        req: RegisterRequest,
        batch: &mut HashMap<String, RegisterRequest>,
        batch_bytes: &mut usize,
        output: &mpsc::Sender<RegisterRequest>,
        cancel: &CancellationToken,
        deadline: &mut Instant,
    ) {
        let entity_bytes = req.entity_fields.json_size();

        if entity_bytes > self.config.max_batch_size_bytes {
            tracing::warn!(name = req.name(), bytes = entity_bytes, "register request exceeds byte budget, dropping");
            self.emit(RegisterEvent::BatchDropped {
                entity_count: 1,
                reason: "request exceeds max_batch_size_bytes".into(),
            })
            .await;
            return;
        }

        if !batch.is_empty() && *batch_bytes + entity_bytes > self.config.max_batch_size_bytes {
            self.flush(batch, batch_bytes, output, cancel).await;
            *deadline = Instant::now() + self.config.max_batch_duration;
        }

        let name = req.name().to_string();
        if let Some(displaced) = batch.insert(name, req) {
            *batch_bytes -= displaced.entity_fields.json_size();
        }
        *batch_bytes += entity_bytes;

        if *batch_bytes == self.config.max_batch_size_bytes || batch.len() == self.config.max_batch_size {
            self.flush(batch, batch_bytes, output, cancel).await;
            *deadline = Instant::now() + self.config.max_batch_duration;
        }
    }

    /// Send the current batch, retrying retryable failures against the
    /// shared backoff until success, a fatal error, or cancellation. Always
    /// leaves `batch`/`batch_bytes` empty on return.
    async fn flush(
        &mut self,
        batch: &mut HashMap<String, RegisterRequest>,
        batch_bytes: &mut usize,
        output: &mpsc::Sender<RegisterRequest>,
        cancel: &CancellationToken,
    ) {
        if batch.is_empty() {
            return;
        }

        loop {
            if cancel.is_cancelled() {
                batch.clear();
                *batch_bytes = 0;
                return;
            }

            let entities: Vec<RegisterEntity> = batch
                .values()
                .map(|req| {
                    let mut entity = RegisterEntity::from(&req.entity_fields);
                    for (k, v) in &self.agent_labels {
                        entity.metadata.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                    entity
                })
                .collect();
            let agent_id = self.identity.get().id;

            match self.client.register_batch(&self.license_key, agent_id, &entities).await {
                Ok((responses, _hint)) => {
                    self.backoff.reset();
                    let count = entities.len();
                    let bytes = *batch_bytes;
                    self.emit(RegisterEvent::BatchSent { entity_count: count, bytes }).await;

                    for resp in responses {
                        let Some(mut req) = batch.remove(&resp.name) else { continue };
                        if resp.is_failure() {
                            self.emit(RegisterEvent::EntityFailed {
                                name: resp.name.clone(),
                                error_msg: if resp.error_msg.is_empty() {
                                    "entity id 0 with no error message".to_string()
                                } else {
                                    resp.error_msg.clone()
                                },
                            })
                            .await;
                            continue;
                        }
                        if !resp.warnings.is_empty() && self.config.verbose {
                            tracing::warn!(name = %resp.name, warnings = ?resp.warnings, "register warnings");
                        }
                        req.assigned_id = Some(resp.id);
                        if output.send(req).await.is_err() {
                            return; // consumer gone; nothing more to do
                        }
                    }

                    // Anything left unmatched by name got no response entry.
                    for (name, _req) in batch.drain() {
                        self.emit(RegisterEvent::EntityFailed {
                            name,
                            error_msg: "no response entry from register endpoint".into(),
                        })
                        .await;
                    }
                    *batch_bytes = 0;
                    return;
                }
                Err(err) => match err.classification() {
                    Classification::Retryable => {
                        let delay = self.backoff.next_bounded(self.config.max_retry_backoff);
                        self.emit(RegisterEvent::BatchRetried {
                            attempt: self.backoff.attempt_count(),
                            delay,
                        })
                        .await;
                        sleep_cancellable(&*self.sleeper, delay, cancel).await;
                        if cancel.is_cancelled() {
                            batch.clear();
                            *batch_bytes = 0;
                            return;
                        }
                        continue;
                    }
                    Classification::Fatal | Classification::PerEntity => {
                        self.emit(RegisterEvent::BatchDropped {
                            entity_count: batch.len(),
                            reason: err.to_string(),
                        })
                        .await;
                        batch.clear();
                        *batch_bytes = 0;
                        return;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityFields, Identity, RegisterResponseEntry, RetryHint};
    use crate::error::RegisterError;
    use crate::telemetry::sinks::MemorySink;
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

    fn req(name: &str) -> RegisterRequest {
        RegisterRequest::new(fields(name), "1.0.0")
    }

    fn connected_identity() -> Arc<IdentityContext> {
        let ctx = Arc::new(IdentityContext::new());
        ctx.set(Identity { id: 123, guid: "GUID".into() });
        ctx
    }

    struct ScriptedClient {
        calls: Mutex<Vec<Vec<String>>>,
        responses: Mutex<Vec<Result<Vec<RegisterResponseEntry>, RegisterError>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<Vec<RegisterResponseEntry>, RegisterError>>) -> Self {
            Self { calls: Mutex::new(Vec::new()), responses: Mutex::new(responses) }
        }

        fn call_sizes(&self) -> Vec<usize> {
            self.calls.lock().unwrap().iter().map(|c| c.len()).collect()
        }
    }

    #[async_trait]
    impl RegisterClient for ScriptedClient {
        async fn register_batch(
            &self,
            _license_key: &str,
            _agent_entity_id: i64,
            entities: &[RegisterEntity],
        ) -> Result<(Vec<RegisterResponseEntry>, Option<RetryHint>), RegisterError> {
            self.calls.lock().unwrap().push(entities.iter().map(|e| e.name.clone()).collect());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok((vec![], None));
            }
            responses.remove(0).map(|entries| (entries, None))
        }
    }

    fn ok_entry(name: &str, id: i64) -> RegisterResponseEntry {
        RegisterResponseEntry { name: name.to_string(), id, error_msg: String::new(), warnings: vec![] }
    }

    /// Scenario 1: `maxBatchSize=2`, two requests, both succeed.
    #[tokio::test(start_paused = true)]
    async fn connect_then_register_batch_of_two() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(vec![ok_entry("a", 10), ok_entry("b", 11)])]));
        let config = RegisterWorkerConfig { max_batch_size: 2, ..Default::default() };
        let worker = RegisterWorker::new(config, client, connected_identity(), "license", crate::telemetry::sinks::NullSink);

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(in_rx, out_tx, cancel.clone()));

        in_tx.send(req("a")).await.unwrap();
        in_tx.send(req("b")).await.unwrap();

        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        let mut ids: Vec<i64> = vec![first.assigned_id.unwrap(), second.assigned_id.unwrap()];
        ids.sort();
        assert_eq!(ids, vec![10, 11]);

        cancel.cancel();
        let _ = handle.await;
    }

    /// Scenario 2: byte budget forces an early flush, the remainder flushes
    /// on the batch-duration timer.
    #[tokio::test(start_paused = true)]
    async fn byte_budget_splits_batch_then_timer_flushes_remainder() {
        let per_entity = req("test-0").entity_fields.json_size();
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(vec![ok_entry("test-0", 1), ok_entry("test-1", 2)]),
            Ok(vec![ok_entry("test-2", 3)]),
        ]));
        let config = RegisterWorkerConfig {
            max_batch_size: 1000,
            max_batch_size_bytes: per_entity * 2,
            max_batch_duration: Duration::from_millis(50),
            ..Default::default()
        };
        let worker = RegisterWorker::new(config, client.clone(), connected_identity(), "license", crate::telemetry::sinks::NullSink);

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(in_rx, out_tx, cancel.clone()));

        in_tx.send(req("test-0")).await.unwrap();
        in_tx.send(req("test-1")).await.unwrap();
        in_tx.send(req("test-2")).await.unwrap();

        let _ = out_rx.recv().await.unwrap();
        let _ = out_rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let third = out_rx.recv().await.unwrap();
        assert_eq!(third.name(), "test-2");

        assert_eq!(client.call_sizes(), vec![2, 1]);

        cancel.cancel();
        let _ = handle.await;
    }

    /// Scenario 3: an oversize request is dropped without a send; the next
    /// normal request still flushes.
    #[tokio::test(start_paused = true)]
    async fn oversize_request_dropped_normal_request_still_flushes() {
        let small = req("test-1").entity_fields.json_size();
        let client = Arc::new(ScriptedClient::new(vec![Ok(vec![ok_entry("test-1", 5)])]));
        let config = RegisterWorkerConfig {
            max_batch_size: 1000,
            max_batch_size_bytes: small, // big-entity request (below) exceeds this
            max_batch_duration: Duration::from_millis(50),
            ..Default::default()
        };
        let worker = RegisterWorker::new(config, client.clone(), connected_identity(), "license", crate::telemetry::sinks::NullSink);

        let mut big = req("test-0");
        big.entity_fields.metadata.insert("padding".into(), "x".repeat(small * 4));

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(in_rx, out_tx, cancel.clone()));

        in_tx.send(big).await.unwrap();
        in_tx.send(req("test-1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let only = out_rx.recv().await.unwrap();
        assert_eq!(only.name(), "test-1");
        assert_eq!(client.call_sizes(), vec![1]);

        cancel.cancel();
        let _ = handle.await;
    }

    /// Scenario 4: a retryable failure backs off once, then the retry
    /// succeeds; the attempt counter resets and the request is stamped.
    #[tokio::test(start_paused = true)]
    async fn retryable_failure_then_success_resets_backoff() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(RegisterError::RateLimited("slow down".into())),
            Ok(vec![ok_entry("test", 13)]),
        ]));
        let config = RegisterWorkerConfig { max_batch_size: 1, ..Default::default() };
        let worker = RegisterWorker::new(config, client.clone(), connected_identity(), "license", crate::telemetry::sinks::NullSink);

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(in_rx, out_tx, cancel.clone()));

        in_tx.send(req("test")).await.unwrap();

        let stamped = out_rx.recv().await.unwrap();
        assert_eq!(stamped.assigned_id, Some(13));
        assert_eq!(client.call_sizes(), vec![1, 1]);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_discards_batch_without_retry() {
        let client = Arc::new(ScriptedClient::new(vec![Err(RegisterError::Fatal("bad request".into()))]));
        let config = RegisterWorkerConfig { max_batch_size: 1, ..Default::default() };
        let sink = MemorySink::with_capacity(10);
        let worker =
            RegisterWorker::new(config, client.clone(), connected_identity(), "license", sink.clone());

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(in_rx, out_tx, cancel.clone()));

        in_tx.send(req("test")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(out_rx.try_recv().is_err());
        assert_eq!(client.call_sizes(), vec![1]);
        assert!(sink.events().iter().any(|e| matches!(
            e,
            AgentEvent::Register(RegisterEvent::BatchDropped { .. })
        )));

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn cancellation_drops_in_flight_batch() {
        let attempts = Arc::new(AtomicUsize::new(0));
        struct NeverReturns(Arc<AtomicUsize>);
        #[async_trait]
        impl RegisterClient for NeverReturns {
            async fn register_batch(
                &self,
                _license_key: &str,
                _agent_entity_id: i64,
                _entities: &[RegisterEntity],
            ) -> Result<(Vec<RegisterResponseEntry>, Option<RetryHint>), RegisterError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(RegisterError::RateLimited("always".into()))
            }
        }
        let client = Arc::new(NeverReturns(attempts));
        let config = RegisterWorkerConfig { max_batch_size: 1, ..Default::default() };
        let worker = RegisterWorker::new(config, client, connected_identity(), "license", crate::telemetry::sinks::NullSink);

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(in_rx, out_tx, cancel.clone()));

        in_tx.send(req("test")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle).await.expect("worker exits promptly").unwrap();
    }
}
