//! Asynchronous publish adapter over an injected [`BrokerProducer`].
//!
//! Every dispatch becomes one [`BrokerRecord`] whose value is a JSON envelope
//! carrying the payload, the headers, the correlation id and a timestamp.
//! Request/response over the broker only works when a reply topic is
//! configured: the adapter then parks the caller on a pending reply keyed by
//! correlation id until the consumer side hands the answer to
//! [`BrokerGateway::deliver_reply`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::TransportFault;
use crate::error::{GatewayError, Result};
use crate::gateway::{DeliveryHandle, DispatchHandle, MessageGateway};
use crate::health::{TransportHealth, DEFAULT_UNHEALTHY_AFTER};
use crate::message::{
    Headers, TransportKind, DEFAULT_TIMEOUT_MS, HEADER_CORRELATION_ID, HEADER_MESSAGE_KEY,
};
use crate::metrics::{GatewayMetrics, MetricsMap};

/// Header naming the topic replies are expected on.
pub const HEADER_REPLY_TOPIC: &str = "reply-topic";
/// Header carrying the event type of a published event.
pub const HEADER_EVENT_TYPE: &str = "event-type";
/// Header carrying the publication time of an event.
pub const HEADER_EVENT_TIMESTAMP: &str = "event-timestamp";
/// Default prefix of event topics.
pub const DEFAULT_EVENT_TOPIC_PREFIX: &str = "events.";

const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// One record handed to the producer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerRecord {
    pub topic: String,
    pub key: String,
    pub value: Value,
}

/// Minimal producer the adapter publishes through.
#[async_trait]
pub trait BrokerProducer: Send + Sync + 'static {
    /// Resolves once the broker acknowledged the record.
    async fn send(&self, record: BrokerRecord) -> std::result::Result<(), TransportFault>;
}

#[async_trait]
impl<P: BrokerProducer + ?Sized> BrokerProducer for Arc<P> {
    async fn send(&self, record: BrokerRecord) -> std::result::Result<(), TransportFault> {
        (**self).send(record).await
    }
}

/// Broker adapter settings.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Prepended to the event type by `publish_event` (default: `events.`).
    pub event_topic_prefix: String,
    /// Topic replies arrive on; request/response is refused without one.
    pub reply_topic: Option<String>,
    /// Bound of `send_async`, acknowledgement included (default: 30s).
    pub reply_timeout: Duration,
    /// Longest wait for the broker to acknowledge a one-way record (default: 30s).
    pub publish_timeout: Duration,
    /// Consecutive unacknowledged records before the adapter reports unhealthy.
    pub unhealthy_after: u32,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            event_topic_prefix: DEFAULT_EVENT_TOPIC_PREFIX.to_string(),
            reply_topic: None,
            reply_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            publish_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            unhealthy_after: DEFAULT_UNHEALTHY_AFTER,
        }
    }
}

/// A caller parked on a reply. `token` tells registrations under a reused
/// correlation id apart.
struct PendingReply {
    token: u64,
    tx: oneshot::Sender<Value>,
}

struct BrokerInner<P> {
    producer: P,
    options: BrokerOptions,
    pending: DashMap<String, PendingReply>,
    next_token: AtomicU64,
    metrics: GatewayMetrics,
    health: TransportHealth,
}

/// Removes its own pending registration when the waiting caller gives up.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingReply>,
    correlation_id: String,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .remove_if(&self.correlation_id, |_, reply| reply.token == self.token);
    }
}

fn elapsed(topic: &str, timeout: Duration) -> GatewayError {
    GatewayError::Timeout {
        destination: topic.to_string(),
        timeout_ms: timeout.as_millis() as u64,
    }
}

impl<P: BrokerProducer> BrokerInner<P> {
    /// Publishes one record, failing with a `timeout` error if the broker has
    /// not acknowledged it by `deadline`.
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        headers: &Headers,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<()> {
        self.metrics.inc_total_requests();
        let started = Instant::now();

        let key = headers
            .get(HEADER_MESSAGE_KEY)
            .cloned()
            .unwrap_or_else(|| message_key(&payload));
        let record = BrokerRecord {
            topic: topic.to_string(),
            key,
            value: envelope(payload, headers),
        };
        let key = record.key.clone();

        let outcome = match tokio::time::timeout_at(deadline, self.producer.send(record)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(fault)) => Err(GatewayError::communication(topic, fault)),
            Err(_) => Err(elapsed(topic, timeout)),
        };

        match &outcome {
            Ok(()) => {
                self.metrics.inc_successful_requests();
                self.health.record_success();
                debug!(topic, key = %key, elapsed_ms = started.elapsed().as_millis() as u64, "record acknowledged");
            }
            Err(e) => {
                self.metrics.inc_failed_requests();
                self.health.record_failure();
                warn!(topic, key = %key, error = %e, "record not acknowledged");
            }
        }
        outcome
    }

    /// Publishes and waits for the correlated reply; `timeout` bounds both.
    async fn request(
        &self,
        topic: &str,
        payload: Value,
        mut headers: Headers,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        let deadline = Instant::now() + timeout;
        let reply_topic = self.options.reply_topic.clone().ok_or_else(|| {
            GatewayError::Configuration(format!(
                "request/response to {topic} needs a reply topic on the broker transport"
            ))
        })?;

        let correlation_id = headers
            .entry(HEADER_CORRELATION_ID.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        headers.insert(HEADER_REPLY_TOPIC.to_string(), reply_topic);

        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        match self.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => {
                return Err(GatewayError::Configuration(format!(
                    "a request with correlation id {correlation_id} is already waiting for a reply"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingReply { token, tx });
            }
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
            token,
        };

        self.publish(topic, payload, &headers, deadline, timeout).await?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(Value::Null)) => Ok(None),
            Ok(Ok(body)) => Ok(Some(body)),
            Ok(Err(_)) => Err(GatewayError::communication(
                topic,
                format!("reply channel for {correlation_id} closed"),
            )),
            Err(_) => Err(elapsed(topic, timeout)),
        }
    }
}

/// Broker adapter. Cloning shares the producer, pending replies and counters.
pub struct BrokerGateway<P> {
    inner: Arc<BrokerInner<P>>,
}

impl<P> Clone for BrokerGateway<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: BrokerProducer> BrokerGateway<P> {
    pub fn new(producer: P) -> Self {
        Self::with_options(producer, BrokerOptions::default())
    }

    pub fn with_options(producer: P, options: BrokerOptions) -> Self {
        let health = TransportHealth::new(options.unhealthy_after);
        Self {
            inner: Arc::new(BrokerInner {
                producer,
                options,
                pending: DashMap::new(),
                next_token: AtomicU64::new(0),
                metrics: GatewayMetrics::new(),
                health,
            }),
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.inner.options
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Completes the pending request registered under `correlation_id`.
    ///
    /// Returns `false` when nobody is waiting, e.g. the caller already timed out.
    pub fn deliver_reply(&self, correlation_id: &str, body: Value) -> bool {
        match self.inner.pending.remove(correlation_id) {
            Some((_, reply)) => reply.tx.send(body).is_ok(),
            None => {
                debug!(correlation_id, "reply without a waiting request dropped");
                false
            }
        }
    }
}

#[async_trait]
impl<P: BrokerProducer> MessageGateway for BrokerGateway<P> {
    async fn send_sync(
        &self,
        destination: &str,
        payload: &Value,
        headers: &Headers,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        info!(topic = destination, "sending request over broker");
        self.inner
            .request(destination, payload.clone(), headers.clone(), timeout)
            .await
    }

    fn send_async(
        &self,
        destination: &str,
        payload: Value,
        headers: Headers,
    ) -> DispatchHandle<Option<Value>> {
        if self.inner.options.reply_topic.is_none() {
            return DispatchHandle::ready(Err(GatewayError::Configuration(format!(
                "request/response to {destination} needs a reply topic on the broker transport"
            ))));
        }
        let inner = Arc::clone(&self.inner);
        let topic = destination.to_string();
        DispatchHandle::spawn(destination, async move {
            let timeout = inner.options.reply_timeout;
            inner.request(&topic, payload, headers, timeout).await
        })
    }

    fn send_fire_and_forget(
        &self,
        destination: &str,
        payload: Value,
        headers: Headers,
    ) -> DeliveryHandle {
        let inner = Arc::clone(&self.inner);
        let topic = destination.to_string();
        DeliveryHandle::spawn(async move {
            let timeout = inner.options.publish_timeout;
            inner
                .publish(&topic, payload, &headers, Instant::now() + timeout, timeout)
                .await
                .is_ok()
        })
    }

    fn publish_event(&self, event_type: &str, payload: Value, mut headers: Headers) -> DeliveryHandle {
        let topic = format!("{}{}", self.inner.options.event_topic_prefix, event_type);
        headers.insert(HEADER_EVENT_TYPE.to_string(), event_type.to_string());
        headers.insert(
            HEADER_EVENT_TIMESTAMP.to_string(),
            chrono::Utc::now().to_rfc3339(),
        );
        info!(event_type, topic = %topic, "publishing event");
        self.send_fire_and_forget(&topic, payload, headers)
    }

    fn communication_type(&self) -> String {
        TransportKind::Kafka.as_str().to_string()
    }

    fn is_healthy(&self) -> bool {
        self.inner.health.is_healthy()
    }

    fn metrics(&self) -> MetricsMap {
        let mut map = self.inner.metrics.to_map(TransportKind::Kafka.as_str());
        map.insert("pending_requests".into(), self.pending_requests().into());
        map.insert(
            "health_status".into(),
            self.inner.health.status().as_str().into(),
        );
        map
    }
}

impl<P> std::fmt::Debug for BrokerGateway<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerGateway")
            .field("options", &self.inner.options)
            .field("pending_requests", &self.inner.pending.len())
            .field("health", &self.inner.health)
            .finish()
    }
}

fn envelope(payload: Value, headers: &Headers) -> Value {
    json!({
        "payload": payload,
        "headers": headers,
        "correlationId": headers.get(HEADER_CORRELATION_ID),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

/// `INCIDENT_<id>_<ts>` for incident payloads, `MSG_<ts>_<uuid>` otherwise.
fn message_key(payload: &Value) -> String {
    let timestamp = chrono::Utc::now().format(KEY_TIMESTAMP_FORMAT);
    match payload.get("incidentId").and_then(Value::as_str) {
        Some(incident_id) => format!("INCIDENT_{incident_id}_{timestamp}"),
        None => format!("MSG_{timestamp}_{}", uuid::Uuid::new_v4()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProducer {
        records: Mutex<Vec<BrokerRecord>>,
        reject: AtomicBool,
    }

    impl RecordingProducer {
        fn records(&self) -> Vec<BrokerRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerProducer for RecordingProducer {
        async fn send(&self, record: BrokerRecord) -> std::result::Result<(), TransportFault> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(TransportFault::Rejected("broker unavailable".to_string()));
            }
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    /// Never acknowledges a record.
    struct SilentProducer;

    #[async_trait]
    impl BrokerProducer for SilentProducer {
        async fn send(&self, _record: BrokerRecord) -> std::result::Result<(), TransportFault> {
            std::future::pending().await
        }
    }

    fn with_reply_topic(producer: Arc<RecordingProducer>) -> BrokerGateway<Arc<RecordingProducer>> {
        BrokerGateway::with_options(
            producer,
            BrokerOptions {
                reply_topic: Some("itoms.service-desk.replies".to_string()),
                reply_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_fire_and_forget_envelope_and_key() {
        let producer = Arc::new(RecordingProducer::default());
        let gateway = BrokerGateway::new(producer.clone());
        let mut headers = Headers::new();
        headers.insert(HEADER_CORRELATION_ID.to_string(), "c-1".to_string());

        assert!(
            gateway
                .send_fire_and_forget("itoms.audit", json!({"a": 1}), headers)
                .await
        );

        let record = &producer.records()[0];
        assert_eq!(record.topic, "itoms.audit");
        assert!(record.key.starts_with("MSG_"));
        assert_eq!(record.value["payload"], json!({"a": 1}));
        assert_eq!(record.value["correlationId"], "c-1");
        assert_eq!(record.value["headers"][HEADER_CORRELATION_ID], "c-1");
        assert!(record.value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_message_key_header_and_incident_key() {
        let producer = Arc::new(RecordingProducer::default());
        let gateway = BrokerGateway::new(producer.clone());
        let mut headers = Headers::new();
        headers.insert(HEADER_MESSAGE_KEY.to_string(), "inc-42".to_string());

        assert!(gateway.send_fire_and_forget("t", json!(1), headers).await);
        assert!(
            gateway
                .send_fire_and_forget("t", json!({"incidentId": "inc-7"}), Headers::new())
                .await
        );

        let records = producer.records();
        assert_eq!(records[0].key, "inc-42");
        assert!(records[1].key.starts_with("INCIDENT_inc-7_"));
    }

    #[tokio::test]
    async fn test_publish_event_topic_and_headers() {
        let producer = Arc::new(RecordingProducer::default());
        let gateway = BrokerGateway::new(producer.clone());

        assert!(gateway.publish_event("incident.created", json!({}), Headers::new()).await);

        let record = &producer.records()[0];
        assert_eq!(record.topic, "events.incident.created");
        assert_eq!(record.value["headers"][HEADER_EVENT_TYPE], "incident.created");
        assert!(record.value["headers"][HEADER_EVENT_TIMESTAMP].is_string());
    }

    #[tokio::test]
    async fn test_rejected_record_resolves_false() {
        let producer = Arc::new(RecordingProducer::default());
        producer.reject.store(true, Ordering::SeqCst);
        let gateway = BrokerGateway::new(producer);

        assert!(!gateway.send_fire_and_forget("t", json!(1), Headers::new()).await);
        let metrics = gateway.metrics();
        assert_eq!(metrics["failed_requests"], 1);
        assert_eq!(metrics["communication_type"], "KAFKA");
    }

    #[tokio::test]
    async fn test_request_without_reply_topic_is_configuration_error() {
        let producer = Arc::new(RecordingProducer::default());
        let gateway = BrokerGateway::new(producer.clone());

        let err = gateway
            .send_sync("t", &json!(1), &Headers::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));

        let err = gateway.send_async("t", json!(1), Headers::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
        assert!(producer.records().is_empty());
    }

    #[tokio::test]
    async fn test_request_completed_by_reply() {
        let producer = Arc::new(RecordingProducer::default());
        let gateway = with_reply_topic(producer.clone());
        let mut headers = Headers::new();
        headers.insert(HEADER_CORRELATION_ID.to_string(), "c-9".to_string());

        let handle = gateway.send_async("itoms.user.random.request", json!({}), headers);
        while gateway.pending_requests() == 0 || producer.records().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            producer.records()[0].value["headers"][HEADER_REPLY_TOPIC],
            "itoms.service-desk.replies"
        );
        assert_eq!(gateway.metrics()["pending_requests"], 1);

        assert!(gateway.deliver_reply("c-9", json!({"userName": "kim"})));
        assert_eq!(handle.await.unwrap(), Some(json!({"userName": "kim"})));
        assert_eq!(gateway.pending_requests(), 0);
        assert!(!gateway.deliver_reply("c-9", json!({})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_and_clears_pending() {
        let producer = Arc::new(RecordingProducer::default());
        let gateway = with_reply_topic(producer);

        let err = gateway
            .send_sync("t", &json!(1), &Headers::new(), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Timeout { timeout_ms: 200, .. }));
        assert_eq!(gateway.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_bounded_when_broker_never_acknowledges() {
        let gateway = BrokerGateway::with_options(
            SilentProducer,
            BrokerOptions {
                reply_topic: Some("replies".to_string()),
                reply_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );

        let err = gateway
            .send_sync("t", &json!(1), &Headers::new(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { timeout_ms: 200, .. }));

        let err = gateway.send_async("t", json!(1), Headers::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { timeout_ms: 5_000, .. }));

        assert_eq!(gateway.pending_requests(), 0);
        assert_eq!(gateway.metrics()["failed_requests"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_way_bounded_when_broker_never_acknowledges() {
        let gateway = BrokerGateway::with_options(
            SilentProducer,
            BrokerOptions {
                publish_timeout: Duration::from_secs(1),
                unhealthy_after: 2,
                ..Default::default()
            },
        );

        assert!(!gateway.send_fire_and_forget("t", json!(1), Headers::new()).await);
        assert!(gateway.is_healthy());
        assert!(!gateway.publish_event("incident.created", json!({}), Headers::new()).await);
        assert!(!gateway.is_healthy());
        assert_eq!(gateway.metrics()["health_status"], "UNHEALTHY");
    }

    #[tokio::test]
    async fn test_reused_correlation_id_is_refused_while_pending() {
        let producer = Arc::new(RecordingProducer::default());
        let gateway = with_reply_topic(producer.clone());
        let mut headers = Headers::new();
        headers.insert(HEADER_CORRELATION_ID.to_string(), "dup".to_string());

        let first = gateway.send_async("t", json!(1), headers.clone());
        while gateway.pending_requests() == 0 || producer.records().is_empty() {
            tokio::task::yield_now().await;
        }

        let err = gateway
            .send_sync("t", &json!(2), &headers, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
        assert_eq!(gateway.pending_requests(), 1);
        assert_eq!(producer.records().len(), 1);

        assert!(gateway.deliver_reply("dup", json!("first")));
        assert_eq!(first.await.unwrap(), Some(json!("first")));

        let second = gateway.send_async("t", json!(3), headers);
        while gateway.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(gateway.deliver_reply("dup", json!("second")));
        assert_eq!(second.await.unwrap(), Some(json!("second")));
    }
}
