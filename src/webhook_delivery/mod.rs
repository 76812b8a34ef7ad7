//! Webhook delivery engine.
//!
//! Committed domain events fan out to every active endpoint subscribed to
//! their type. Deliveries for one endpoint run strictly serialized through
//! that endpoint's durable queue; across endpoints they run in parallel,
//! bounded by a shared worker pool. Signing, failure classification, and the
//! backoff schedule live in the submodules.
//!
//! Delivery attempts are appended to the event log as
//! `webhook_delivery.attempted` records (one stream per delivery) and reach
//! the bus through the outbox sweep; they never re-enter the router.

pub mod queue;
pub mod retry;
pub mod signature;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use checkout_types::event::{EventEnvelope, EventMetadata};
use checkout_types::id::{DeliveryId, EndpointId, EventId};
use checkout_types::webhook::{
    DeliveryAttemptOutcome, RetryBackoff, WebhookDeliveryAttempted, WebhookEndpoint,
};

use crate::event_bus::EventConsumer;
use crate::event_store::EventStore;
use crate::services::endpoints::EndpointRegistry;
use crate::webhook_delivery::queue::{DeliveryQueue, QueuedDelivery};
use crate::webhook_delivery::retry::AttemptClass;

const PRODUCER: &str = "webhook-delivery-engine";

/// The JSON body POSTed to endpoints.
#[derive(Debug, Serialize)]
struct DeliveryBody<'a> {
    event_id: EventId,
    event_type: &'a str,
    occurred_at: chrono::DateTime<Utc>,
    data: &'a serde_json::Value,
    delivery_attempt: u32,
    delivery_id: DeliveryId,
}

/// Result of the synchronous configuration probe.
#[derive(Debug, Clone, Serialize)]
pub struct TestDeliveryResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One finished HTTP attempt, before policy is applied.
#[derive(Debug)]
struct AttemptResult {
    class: AttemptClass,
    status_code: Option<u16>,
    response_time_ms: u64,
    error: Option<String>,
}

type DelayFn = dyn Fn(RetryBackoff, u32) -> Duration + Send + Sync;

pub struct DeliveryEngine {
    queue: Arc<dyn DeliveryQueue>,
    registry: Arc<EndpointRegistry>,
    store: Arc<dyn EventStore>,
    http: reqwest::Client,
    permits: Arc<Semaphore>,
    workers: DashMap<EndpointId, mpsc::UnboundedSender<()>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    delay_fn: Box<DelayFn>,
}

impl DeliveryEngine {
    pub fn new(
        queue: Arc<dyn DeliveryQueue>,
        registry: Arc<EndpointRegistry>,
        store: Arc<dyn EventStore>,
        worker_pool_size: usize,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(DeliveryEngine {
            queue,
            registry,
            store,
            http: reqwest::Client::new(),
            permits: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            workers: DashMap::new(),
            tracker: TaskTracker::new(),
            cancel,
            delay_fn: Box::new(retry::retry_delay),
        })
    }

    /// Replaces the backoff schedule. Test-only seam.
    #[cfg(test)]
    pub fn with_delay_fn<F>(
        queue: Arc<dyn DeliveryQueue>,
        registry: Arc<EndpointRegistry>,
        store: Arc<dyn EventStore>,
        worker_pool_size: usize,
        cancel: CancellationToken,
        delay_fn: F,
    ) -> Arc<Self>
    where
        F: Fn(RetryBackoff, u32) -> Duration + Send + Sync + 'static,
    {
        Arc::new(DeliveryEngine {
            queue,
            registry,
            store,
            http: reqwest::Client::new(),
            permits: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            workers: DashMap::new(),
            tracker: TaskTracker::new(),
            cancel,
            delay_fn: Box::new(delay_fn),
        })
    }

    /// Wakes (spawning if needed) the serialized worker for an endpoint.
    pub fn notify(self: &Arc<Self>, endpoint_id: EndpointId) {
        let sender = self
            .workers
            .entry(endpoint_id)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let engine = self.clone();
                self.tracker.spawn(async move {
                    engine.worker_loop(endpoint_id, rx).await;
                });
                tx
            })
            .clone();
        let _ = sender.send(());
    }

    /// Re-arms workers for every endpoint with queued work. Called once at
    /// startup so deliveries survive a process restart.
    pub async fn resume(self: &Arc<Self>) {
        match self.queue.endpoints_with_pending().await {
            Ok(endpoints) => {
                for endpoint_id in endpoints {
                    self.notify(endpoint_id);
                }
            }
            Err(error) => {
                tracing::error!(error = %error, "Failed to resume pending deliveries");
            }
        }
    }

    /// Stops accepting work and waits up to `grace` for in-flight attempts.
    /// Unfinished deliveries stay queued for the next startup.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!("Delivery workers did not drain within grace period");
        }
    }

    async fn worker_loop(self: Arc<Self>, endpoint_id: EndpointId, mut rx: mpsc::UnboundedReceiver<()>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                nudge = rx.recv() => {
                    if nudge.is_none() {
                        return;
                    }
                }
            }
            self.drain_endpoint(endpoint_id).await;
        }
    }

    /// Processes the endpoint's queue head-first until it empties, the
    /// endpoint stops being active, or shutdown begins.
    async fn drain_endpoint(&self, endpoint_id: EndpointId) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let head = match self.queue.head(endpoint_id).await {
                Ok(Some(head)) => head,
                Ok(None) => return,
                Err(error) => {
                    tracing::error!(endpoint_id = %endpoint_id, error = %error, "Queue read failed");
                    return;
                }
            };
            let Some(endpoint) = self.registry.get(endpoint_id) else {
                // Endpoint deleted with work still queued: drop the delivery.
                let _ = self.queue.complete(endpoint_id, head.delivery_id).await;
                continue;
            };
            if !endpoint.is_active() {
                // Disabled or auto-failed: leave the backlog untouched until
                // a merchant re-enables the endpoint.
                return;
            }

            let wait = (head.next_attempt_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if !wait.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            let Ok(_permit) = self.permits.acquire().await else {
                return;
            };
            let result = self.attempt(&endpoint, &head).await;
            drop(_permit);
            self.settle_attempt(&endpoint, head, result).await;
        }
    }

    /// Applies policy to a finished attempt: record it, update endpoint
    /// health, and either complete or reschedule the delivery.
    async fn settle_attempt(
        &self,
        endpoint: &WebhookEndpoint,
        head: QueuedDelivery,
        result: AttemptResult,
    ) {
        let exhausted = head.attempt >= endpoint.max_retries + 1;
        let outcome = match result.class {
            AttemptClass::Success => DeliveryAttemptOutcome::Delivered,
            AttemptClass::Transient if !exhausted => DeliveryAttemptOutcome::Retrying,
            AttemptClass::Transient | AttemptClass::Terminal => {
                DeliveryAttemptOutcome::FailedTerminal
            }
        };
        self.record_attempt(&head, &result, outcome).await;

        match outcome {
            DeliveryAttemptOutcome::Delivered => {
                let _ = self
                    .queue
                    .complete(head.endpoint_id, head.delivery_id)
                    .await;
                self.registry.record_outcome(endpoint.id, true);
                tracing::debug!(
                    delivery_id = %head.delivery_id,
                    endpoint_id = %endpoint.id,
                    attempt = head.attempt,
                    "Webhook delivered"
                );
            }
            DeliveryAttemptOutcome::FailedTerminal => {
                let _ = self
                    .queue
                    .complete(head.endpoint_id, head.delivery_id)
                    .await;
                if let Some(new_status) = self.registry.record_outcome(endpoint.id, false) {
                    tracing::warn!(
                        endpoint_id = %endpoint.id,
                        status = %new_status,
                        "Endpoint auto-failed after consecutive terminal failures"
                    );
                }
                tracing::warn!(
                    delivery_id = %head.delivery_id,
                    endpoint_id = %endpoint.id,
                    attempts = head.attempt,
                    error = result.error.as_deref().unwrap_or(""),
                    "Webhook delivery failed terminally"
                );
            }
            DeliveryAttemptOutcome::Retrying => {
                let mut rescheduled = head;
                let delay = (self.delay_fn)(endpoint.retry_backoff, rescheduled.attempt);
                rescheduled.attempt += 1;
                rescheduled.next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_default();
                let _ = self.queue.reschedule(rescheduled).await;
            }
        }
    }

    /// One signed HTTP POST to the endpoint.
    #[instrument(skip_all, fields(endpoint_id = %endpoint.id, delivery_id = %head.delivery_id, attempt = head.attempt))]
    async fn attempt(&self, endpoint: &WebhookEndpoint, head: &QueuedDelivery) -> AttemptResult {
        let body = DeliveryBody {
            event_id: head.event.id,
            event_type: head.event.event_type.as_str(),
            occurred_at: head.event.occurred_at,
            data: &head.event.data,
            delivery_attempt: head.attempt,
            delivery_id: head.delivery_id,
        };
        let body = match serde_json::to_string(&body) {
            Ok(body) => body,
            Err(error) => {
                return AttemptResult {
                    class: AttemptClass::Terminal,
                    status_code: None,
                    response_time_ms: 0,
                    error: Some(format!("payload serialization failed: {error}")),
                };
            }
        };
        self.post_signed(endpoint, &head.event.id.to_string(), head.attempt, body)
            .await
    }

    async fn post_signed(
        &self,
        endpoint: &WebhookEndpoint,
        event_id: &str,
        attempt: u32,
        body: String,
    ) -> AttemptResult {
        let timestamp = Utc::now().timestamp();
        let signature = signature::sign(&endpoint.secret, timestamp, &body);
        let mut request = self
            .http
            .post(endpoint.url.clone())
            .timeout(Duration::from_secs(endpoint.timeout_seconds))
            .header("Content-Type", "application/json")
            .header("X-Signature", signature)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Event-Id", event_id)
            .header("X-Delivery-Attempt", attempt.to_string());
        for (name, value) in &endpoint.headers {
            request = request.header(name, value);
        }

        let started = Instant::now();
        match request.body(body).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                AttemptResult {
                    class: retry::classify_status(status),
                    status_code: Some(status),
                    response_time_ms: started.elapsed().as_millis() as u64,
                    error: None,
                }
            }
            Err(error) => AttemptResult {
                // Connect errors and timeouts are transient by policy.
                class: AttemptClass::Transient,
                status_code: None,
                response_time_ms: started.elapsed().as_millis() as u64,
                error: Some(error.to_string()),
            },
        }
    }

    /// Appends the attempt record to the delivery's own stream. Failures are
    /// logged; the delivery flow never blocks on the audit trail.
    async fn record_attempt(
        &self,
        head: &QueuedDelivery,
        result: &AttemptResult,
        outcome: DeliveryAttemptOutcome,
    ) {
        let record = WebhookDeliveryAttempted {
            delivery_id: head.delivery_id,
            endpoint_id: head.endpoint_id,
            event_id: head.event.id,
            event_type: head.event.event_type,
            attempt: head.attempt,
            outcome,
            status_code: result.status_code,
            response_time_ms: result.response_time_ms,
            error: result.error.clone(),
            at: Utc::now(),
        };
        let envelope = match EventEnvelope::record(
            head.delivery_id.to_string(),
            u64::from(head.attempt),
            &record,
            EventMetadata::produced_by(PRODUCER).with_causation(head.event.id.to_string()),
        ) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::error!(error = %error, "Failed to encode delivery attempt record");
                return;
            }
        };
        if let Err(error) = self.store.append(vec![envelope]).await {
            tracing::error!(
                delivery_id = %head.delivery_id,
                error = %error,
                "Failed to record delivery attempt"
            );
        }
    }

    /// Synchronous single-attempt probe for endpoint configuration checks.
    /// No retries, no queueing, no health bookkeeping.
    pub async fn test_delivery(&self, endpoint: &WebhookEndpoint) -> TestDeliveryResult {
        let body = serde_json::json!({
            "event_id": EventId::generate(),
            "event_type": "webhook_endpoint.test",
            "occurred_at": Utc::now(),
            "data": { "test": true },
            "delivery_attempt": 1,
            "delivery_id": DeliveryId::generate(),
        })
        .to_string();
        let result = self
            .post_signed(endpoint, "test", 1, body)
            .await;
        TestDeliveryResult {
            status_code: result.status_code,
            response_time_ms: result.response_time_ms,
            success: result.class == AttemptClass::Success,
            error: result.error,
        }
    }
}

/// Feeds committed events into per-endpoint queues.
pub struct WebhookRouter {
    registry: Arc<EndpointRegistry>,
    queue: Arc<dyn DeliveryQueue>,
    engine: Arc<DeliveryEngine>,
}

impl WebhookRouter {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        queue: Arc<dyn DeliveryQueue>,
        engine: Arc<DeliveryEngine>,
    ) -> Self {
        WebhookRouter {
            registry,
            queue,
            engine,
        }
    }
}

#[async_trait]
impl EventConsumer for WebhookRouter {
    async fn on_event(&self, event: &EventEnvelope) {
        for endpoint in self.registry.subscribed_to(event.event_type) {
            let delivery = QueuedDelivery::new(endpoint.id, event.clone());
            if let Err(error) = self.queue.enqueue(delivery).await {
                tracing::error!(
                    endpoint_id = %endpoint.id,
                    error = %error,
                    "Failed to enqueue webhook delivery"
                );
                continue;
            }
            self.engine.notify(endpoint.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::webhook_delivery::queue::InMemoryDeliveryQueue;
    use checkout_types::event::{AggregateType, DomainEvent, EventType};
    use checkout_types::id::MerchantId;
    use checkout_types::webhook::EndpointStatus;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeMap, BTreeSet};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize)]
    struct Probe {
        n: u32,
    }

    impl DomainEvent for Probe {
        fn event_type(&self) -> EventType {
            EventType::InvoicePaid
        }

        fn aggregate_type() -> AggregateType {
            AggregateType::Invoice
        }
    }

    #[derive(Debug, Clone)]
    struct ReceivedRequest {
        headers: String,
        body: String,
    }

    impl ReceivedRequest {
        fn header(&self, name: &str) -> Option<String> {
            self.headers.lines().find_map(|line| {
                let (key, value) = line.split_once(':')?;
                if key.eq_ignore_ascii_case(name) {
                    Some(value.trim().to_string())
                } else {
                    None
                }
            })
        }
    }

    /// Minimal HTTP/1.1 server: answers the scripted statuses in order, then
    /// 200 forever, recording every request it fully reads.
    async fn spawn_server(statuses: Vec<u16>) -> (SocketAddr, Arc<Mutex<Vec<ReceivedRequest>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        tokio::spawn(async move {
            let mut statuses = statuses.into_iter();
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let status = statuses.next().unwrap_or(200);
                handle_connection(socket, status, log.clone()).await;
            }
        });
        (addr, received)
    }

    async fn handle_connection(
        mut socket: tokio::net::TcpStream,
        status: u16,
        log: Arc<Mutex<Vec<ReceivedRequest>>>,
    ) {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        let mut header_end = None;
        let mut content_length = 0usize;
        loop {
            match socket.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
            if header_end.is_none() {
                if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
                    header_end = Some(pos + 4);
                    let head = String::from_utf8_lossy(&buf[..pos]);
                    content_length = head
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse().ok())?
                        })
                        .unwrap_or(0);
                }
            }
            if let Some(end) = header_end {
                if buf.len() >= end + content_length {
                    break;
                }
            }
        }
        if let Some(end) = header_end {
            log.lock().await.push(ReceivedRequest {
                headers: String::from_utf8_lossy(&buf[..end]).to_string(),
                body: String::from_utf8_lossy(&buf[end..end + content_length]).to_string(),
            });
        }
        let response =
            format!("HTTP/1.1 {status} Scripted\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
    }

    fn endpoint_for(addr: SocketAddr, max_retries: u32) -> WebhookEndpoint {
        WebhookEndpoint {
            id: EndpointId::generate(),
            merchant_id: MerchantId::generate(),
            url: format!("http://{addr}/hook").parse().unwrap(),
            events: BTreeSet::from([EventType::InvoicePaid]),
            secret: format!("whsec_{}", "a".repeat(32)),
            status: EndpointStatus::Active,
            max_retries,
            retry_backoff: RetryBackoff::Exponential,
            timeout_seconds: 5,
            allowed_ips: None,
            headers: BTreeMap::from([("X-Static-Header".to_string(), "present".to_string())]),
            consecutive_failures: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_event() -> EventEnvelope {
        EventEnvelope::record(
            "inv-1",
            1,
            &Probe { n: 7 },
            EventMetadata::produced_by("test"),
        )
        .unwrap()
    }

    struct Rig {
        queue: Arc<InMemoryDeliveryQueue>,
        registry: Arc<EndpointRegistry>,
        store: Arc<InMemoryEventStore>,
        engine: Arc<DeliveryEngine>,
        delays: Arc<std::sync::Mutex<Vec<(RetryBackoff, u32)>>>,
    }

    fn rig() -> Rig {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let registry = Arc::new(EndpointRegistry::new());
        let store = Arc::new(InMemoryEventStore::new());
        let delays = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = delays.clone();
        let engine = DeliveryEngine::with_delay_fn(
            queue.clone(),
            registry.clone(),
            store.clone(),
            4,
            CancellationToken::new(),
            move |backoff, attempt| {
                recorded.lock().unwrap().push((backoff, attempt));
                Duration::ZERO
            },
        );
        Rig {
            queue,
            registry,
            store,
            engine,
            delays,
        }
    }

    async fn wait_until_drained(rig: &Rig, endpoint_id: EndpointId) {
        for _ in 0..200 {
            if rig.queue.pending_count(endpoint_id).await.unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("delivery queue did not drain");
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (addr, received) = spawn_server(vec![503, 503, 503]).await;
        let rig = rig();
        let endpoint = endpoint_for(addr, 5);
        rig.registry.insert(endpoint.clone());

        let router = WebhookRouter::new(
            rig.registry.clone(),
            rig.queue.clone(),
            rig.engine.clone(),
        );
        router.on_event(&sample_event()).await;
        wait_until_drained(&rig, endpoint.id).await;

        let requests = received.lock().await;
        assert_eq!(requests.len(), 4);
        // Delivery attempt ordinal rides a header.
        assert_eq!(requests[3].header("X-Delivery-Attempt").unwrap(), "4");

        // Backoff was consulted once per transient failure, with growing
        // attempt ordinals.
        let delays = rig.delays.lock().unwrap().clone();
        assert_eq!(
            delays,
            vec![
                (RetryBackoff::Exponential, 1),
                (RetryBackoff::Exponential, 2),
                (RetryBackoff::Exponential, 3),
            ]
        );

        // The audit trail records three retries and the final delivery.
        let attempts = rig
            .store
            .load_by_type(EventType::WebhookDeliveryAttempted, 10)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 4);
        let last: WebhookDeliveryAttempted = attempts[3].decode().unwrap();
        assert_eq!(last.outcome, DeliveryAttemptOutcome::Delivered);
        assert_eq!(last.attempt, 4);
        assert_eq!(last.status_code, Some(200));
    }

    #[tokio::test]
    async fn test_signature_verifies_against_body() {
        let (addr, received) = spawn_server(vec![200]).await;
        let rig = rig();
        let endpoint = endpoint_for(addr, 0);
        rig.registry.insert(endpoint.clone());

        let router = WebhookRouter::new(
            rig.registry.clone(),
            rig.queue.clone(),
            rig.engine.clone(),
        );
        router.on_event(&sample_event()).await;
        wait_until_drained(&rig, endpoint.id).await;

        let requests = received.lock().await;
        let request = &requests[0];
        let timestamp: i64 = request.header("X-Timestamp").unwrap().parse().unwrap();
        let sig = request.header("X-Signature").unwrap();
        assert!(signature::verify(&endpoint.secret, timestamp, &request.body, &sig));
        assert_eq!(request.header("Content-Type").unwrap(), "application/json");
        assert_eq!(request.header("X-Static-Header").unwrap(), "present");
        assert!(request.header("X-Event-Id").is_some());

        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(body["event_type"], "invoice.paid");
        assert_eq!(body["data"]["n"], 7);
        assert_eq!(body["delivery_attempt"], 1);
    }

    #[tokio::test]
    async fn test_4xx_is_terminal_without_retry() {
        let (addr, received) = spawn_server(vec![400]).await;
        let rig = rig();
        let endpoint = endpoint_for(addr, 5);
        rig.registry.insert(endpoint.clone());

        let router = WebhookRouter::new(
            rig.registry.clone(),
            rig.queue.clone(),
            rig.engine.clone(),
        );
        router.on_event(&sample_event()).await;
        wait_until_drained(&rig, endpoint.id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(received.lock().await.len(), 1);
        assert!(rig.delays.lock().unwrap().is_empty());

        let attempts = rig
            .store
            .load_by_type(EventType::WebhookDeliveryAttempted, 10)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        let record: WebhookDeliveryAttempted = attempts[0].decode().unwrap();
        assert_eq!(record.outcome, DeliveryAttemptOutcome::FailedTerminal);
        assert_eq!(record.status_code, Some(400));

        // Terminal failure feeds endpoint health.
        let reloaded = rig.registry.get(endpoint.id).unwrap();
        assert_eq!(reloaded.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_terminal() {
        let (addr, received) = spawn_server(vec![503; 10]).await;
        let rig = rig();
        let endpoint = endpoint_for(addr, 2);
        rig.registry.insert(endpoint.clone());

        let router = WebhookRouter::new(
            rig.registry.clone(),
            rig.queue.clone(),
            rig.engine.clone(),
        );
        router.on_event(&sample_event()).await;
        wait_until_drained(&rig, endpoint.id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // max_retries = 2 allows three attempts in total.
        assert_eq!(received.lock().await.len(), 3);
        let attempts = rig
            .store
            .load_by_type(EventType::WebhookDeliveryAttempted, 10)
            .await
            .unwrap();
        let last: WebhookDeliveryAttempted = attempts.last().unwrap().decode().unwrap();
        assert_eq!(last.outcome, DeliveryAttemptOutcome::FailedTerminal);
        assert_eq!(last.attempt, endpoint.max_retries + 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_events_are_not_delivered() {
        let (addr, received) = spawn_server(vec![200]).await;
        let rig = rig();
        let endpoint = endpoint_for(addr, 5);
        rig.registry.insert(endpoint.clone());

        #[derive(Debug, Serialize, Deserialize)]
        struct Other;
        impl DomainEvent for Other {
            fn event_type(&self) -> EventType {
                EventType::PaymentDetected
            }
            fn aggregate_type() -> AggregateType {
                AggregateType::Payment
            }
        }

        let router = WebhookRouter::new(
            rig.registry.clone(),
            rig.queue.clone(),
            rig.engine.clone(),
        );
        let envelope =
            EventEnvelope::record("pay-1", 1, &Other, EventMetadata::produced_by("test"))
                .unwrap();
        router.on_event(&envelope).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(received.lock().await.is_empty());
        assert_eq!(rig.queue.pending_count(endpoint.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resume_picks_up_queued_deliveries() {
        let (addr, received) = spawn_server(vec![200]).await;
        let rig = rig();
        let endpoint = endpoint_for(addr, 5);
        rig.registry.insert(endpoint.clone());

        // Simulates a restart: the queue already holds work, no router ran.
        rig.queue
            .enqueue(QueuedDelivery::new(endpoint.id, sample_event()))
            .await
            .unwrap();
        rig.engine.resume().await;
        wait_until_drained(&rig, endpoint.id).await;
        assert_eq!(received.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_probe_reports_status_and_latency() {
        let (addr, _received) = spawn_server(vec![204]).await;
        let rig = rig();
        let endpoint = endpoint_for(addr, 5);

        let result = rig.engine.test_delivery(&endpoint).await;
        assert!(result.success);
        assert_eq!(result.status_code, Some(204));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_probe_reports_connection_failure() {
        let rig = rig();
        // Nothing listens on this port.
        let endpoint = endpoint_for("127.0.0.1:9".parse().unwrap(), 5);
        let result = rig.engine.test_delivery(&endpoint).await;
        assert!(!result.success);
        assert_eq!(result.status_code, None);
        assert!(result.error.is_some());
    }
}
