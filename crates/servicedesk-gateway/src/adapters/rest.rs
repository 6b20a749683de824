//! Synchronous request/response adapter over an injected [`HttpClient`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::TransportFault;
use crate::error::{GatewayError, Result};
use crate::gateway::{DeliveryHandle, DispatchHandle, MessageGateway};
use crate::health::{TransportHealth, DEFAULT_UNHEALTHY_AFTER};
use crate::message::{Headers, TransportKind, DEFAULT_TIMEOUT_MS};
use crate::metrics::{GatewayMetrics, MetricsMap};

/// Path prefix for events published to relative topics.
pub const EVENTS_PATH: &str = "/api/events/";

/// Minimal HTTP client the adapter posts through.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// POSTs `body` as JSON to `url`. `Ok(None)` means an empty response body.
    async fn post(
        &self,
        url: &str,
        headers: &Headers,
        body: &Value,
    ) -> std::result::Result<Option<Value>, TransportFault>;
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    async fn post(
        &self,
        url: &str,
        headers: &Headers,
        body: &Value,
    ) -> std::result::Result<Option<Value>, TransportFault> {
        (**self).post(url, headers, body).await
    }
}

/// REST adapter settings.
#[derive(Debug, Clone)]
pub struct RestOptions {
    /// Base of relative event topics.
    pub base_url: String,
    /// Bound of the non-blocking operations (default: 30s).
    pub default_timeout: Duration,
    /// Consecutive failed calls before the adapter reports unhealthy.
    pub unhealthy_after: u32,
}

impl RestOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            unhealthy_after: DEFAULT_UNHEALTHY_AFTER,
        }
    }
}

struct RestInner<C> {
    client: C,
    options: RestOptions,
    metrics: GatewayMetrics,
    health: TransportHealth,
}

impl<C: HttpClient> RestInner<C> {
    async fn post(
        &self,
        destination: &str,
        payload: &Value,
        headers: &Headers,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        self.metrics.inc_total_requests();
        let started = Instant::now();

        let outcome = match tokio::time::timeout(timeout, self.client.post(destination, headers, payload)).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(fault)) => Err(GatewayError::communication(destination, fault)),
            Err(_) => Err(GatewayError::Timeout {
                destination: destination.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match &outcome {
            Ok(_) => {
                self.metrics.inc_successful_requests();
                self.health.record_success();
                debug!(destination, elapsed_ms = started.elapsed().as_millis() as u64, "REST call succeeded");
            }
            Err(e) => {
                self.metrics.inc_failed_requests();
                self.health.record_failure();
                warn!(destination, error = %e, "REST call failed");
            }
        }
        outcome
    }

    fn event_url(&self, event_topic: &str) -> String {
        if event_topic.starts_with("http://") || event_topic.starts_with("https://") {
            event_topic.to_string()
        } else {
            format!(
                "{}{}{}",
                self.options.base_url.trim_end_matches('/'),
                EVENTS_PATH,
                event_topic
            )
        }
    }
}

/// REST adapter. Cloning shares the client, counters and health.
pub struct RestGateway<C> {
    inner: Arc<RestInner<C>>,
}

impl<C> Clone for RestGateway<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: HttpClient> RestGateway<C> {
    /// Creates an adapter posting through `client`, publishing relative events under `base_url`.
    pub fn new(client: C, base_url: impl Into<String>) -> Self {
        Self::with_options(client, RestOptions::new(base_url))
    }

    pub fn with_options(client: C, options: RestOptions) -> Self {
        let health = TransportHealth::new(options.unhealthy_after);
        Self {
            inner: Arc::new(RestInner {
                client,
                options,
                metrics: GatewayMetrics::new(),
                health,
            }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.options.base_url
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.options.default_timeout
    }

    pub fn health(&self) -> &TransportHealth {
        &self.inner.health
    }
}

#[async_trait]
impl<C: HttpClient> MessageGateway for RestGateway<C> {
    async fn send_sync(
        &self,
        destination: &str,
        payload: &Value,
        headers: &Headers,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        self.inner.post(destination, payload, headers, timeout).await
    }

    fn send_async(
        &self,
        destination: &str,
        payload: Value,
        headers: Headers,
    ) -> DispatchHandle<Option<Value>> {
        let inner = Arc::clone(&self.inner);
        let target = destination.to_string();
        DispatchHandle::spawn(destination, async move {
            let timeout = inner.options.default_timeout;
            inner.post(&target, &payload, &headers, timeout).await
        })
    }

    fn send_fire_and_forget(
        &self,
        destination: &str,
        payload: Value,
        headers: Headers,
    ) -> DeliveryHandle {
        let inner = Arc::clone(&self.inner);
        let target = destination.to_string();
        DeliveryHandle::spawn(async move {
            let timeout = inner.options.default_timeout;
            inner.post(&target, &payload, &headers, timeout).await.is_ok()
        })
    }

    fn publish_event(&self, event_topic: &str, payload: Value, headers: Headers) -> DeliveryHandle {
        let url = self.inner.event_url(event_topic);
        self.send_fire_and_forget(&url, payload, headers)
    }

    fn communication_type(&self) -> String {
        TransportKind::Rest.as_str().to_string()
    }

    fn is_healthy(&self) -> bool {
        self.inner.health.is_healthy()
    }

    fn metrics(&self) -> MetricsMap {
        let mut map = self.inner.metrics.to_map(TransportKind::Rest.as_str());
        map.insert(
            "health_status".into(),
            self.inner.health.status().as_str().into(),
        );
        map
    }
}

impl<C> std::fmt::Debug for RestGateway<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestGateway")
            .field("options", &self.inner.options)
            .field("health", &self.inner.health)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Reply = std::result::Result<Option<Value>, TransportFault>;

    /// Scripted client; answers `Ok(None)` once the script is exhausted.
    #[derive(Default)]
    struct ScriptedHttp {
        script: Mutex<VecDeque<Reply>>,
        delay: Option<Duration>,
        urls: Mutex<Vec<String>>,
        headers: Mutex<Vec<Headers>>,
    }

    impl ScriptedHttp {
        fn replying(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(replies.into()),
                ..Default::default()
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay: Some(delay),
                ..Default::default()
            })
        }

        fn urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedHttp {
        async fn post(&self, url: &str, headers: &Headers, _body: &Value) -> Reply {
            self.urls.lock().unwrap().push(url.to_string());
            self.headers.lock().unwrap().push(headers.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    fn refused() -> Reply {
        Err(TransportFault::Connection("connection refused".to_string()))
    }

    #[tokio::test]
    async fn test_send_sync_returns_body() {
        let http = ScriptedHttp::replying(vec![Ok(Some(json!({"ticketId": "T-1"})))]);
        let gateway = RestGateway::new(http.clone(), "http://ticket:8080");
        let mut headers = Headers::new();
        headers.insert("correlation-id".to_string(), "c-1".to_string());

        let body = gateway
            .send_sync("http://ticket:8080/api/ticket", &json!({}), &headers, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(body, Some(json!({"ticketId": "T-1"})));
        assert_eq!(http.urls(), vec!["http://ticket:8080/api/ticket"]);
        assert_eq!(http.headers.lock().unwrap()[0]["correlation-id"], "c-1");
        assert_eq!(gateway.health().status(), crate::health::HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_empty_body_is_none() {
        let gateway = RestGateway::new(ScriptedHttp::replying(vec![]), "http://x");
        let body = gateway
            .send_sync("http://x/a", &json!(1), &Headers::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(body, None);
    }

    #[tokio::test]
    async fn test_fault_is_communication_error_and_hurts_health() {
        let http = ScriptedHttp::replying(vec![refused(), refused(), refused()]);
        let gateway = RestGateway::new(http, "http://x");

        for _ in 0..3 {
            let err = gateway
                .send_sync("http://x/a", &json!(1), &Headers::new(), Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::Communication { .. }));
        }

        assert!(!gateway.is_healthy());
        let metrics = gateway.metrics();
        assert_eq!(metrics["failed_requests"], 3);
        assert_eq!(metrics["health_status"], "UNHEALTHY");
        assert_eq!(metrics["communication_type"], "REST");
    }

    #[tokio::test]
    async fn test_unhealthy_after_follows_options() {
        let http = ScriptedHttp::replying(vec![refused(), Ok(None)]);
        let gateway = RestGateway::with_options(
            http,
            RestOptions {
                unhealthy_after: 1,
                ..RestOptions::new("http://x")
            },
        );

        assert!(!gateway.send_fire_and_forget("http://x/a", json!(1), Headers::new()).await);
        assert!(!gateway.is_healthy());
        assert!(gateway.send_fire_and_forget("http://x/a", json!(1), Headers::new()).await);
        assert!(gateway.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported() {
        let gateway = RestGateway::new(ScriptedHttp::slow(Duration::from_secs(60)), "http://x");

        let err = gateway
            .send_sync("http://x/a", &json!(1), &Headers::new(), Duration::from_millis(500))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GatewayError::Timeout {
                timeout_ms: 500,
                ..
            }
        ));
        assert!(err.is_communication());
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_operations_use_default_timeout() {
        let gateway = RestGateway::with_options(
            ScriptedHttp::slow(Duration::from_secs(60)),
            RestOptions {
                default_timeout: Duration::from_secs(2),
                ..RestOptions::new("http://x")
            },
        );

        let err = gateway
            .send_async("http://x/a", json!(1), Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { timeout_ms: 2000, .. }));
        assert!(!gateway.send_fire_and_forget("http://x/a", json!(1), Headers::new()).await);
    }

    #[tokio::test]
    async fn test_fire_and_forget_reports_acceptance() {
        let http = ScriptedHttp::replying(vec![Ok(None), refused()]);
        let gateway = RestGateway::new(http, "http://x");

        assert!(gateway.send_fire_and_forget("http://x/a", json!(1), Headers::new()).await);
        assert!(!gateway.send_fire_and_forget("http://x/a", json!(1), Headers::new()).await);
    }

    #[tokio::test]
    async fn test_publish_event_url_resolution() {
        let http = ScriptedHttp::replying(vec![]);
        let gateway = RestGateway::new(http.clone(), "http://events:9000/");

        assert!(gateway.publish_event("incident.created", json!({}), Headers::new()).await);
        assert!(
            gateway
                .publish_event("https://hooks.example.com/in", json!({}), Headers::new())
                .await
        );

        assert_eq!(
            http.urls(),
            vec![
                "http://events:9000/api/events/incident.created",
                "https://hooks.example.com/in"
            ]
        );
    }
}
