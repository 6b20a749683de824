//! Resilient decorator over any [`MessageGateway`].
//!
//! `ResilientGateway` composes:
//! - a circuit breaker for admission control
//! - bounded retry with linear backoff
//! - request metrics
//!
//! It wraps the inner gateway by composition and satisfies the same contract,
//! so callers cannot tell a decorated gateway from a bare adapter. One breaker
//! is shared by every caller of an instance; callers needing per-destination
//! isolation wrap each destination in its own `ResilientGateway`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::{GatewayError, Result};
use crate::gateway::{DeliveryHandle, DispatchHandle, MessageGateway};
use crate::message::Headers;
use crate::metrics::{GatewayMetrics, MetricsMap, MetricsSnapshot};
use crate::retry::{RetryConfig, RetryExecutor, RetryOutcome};

/// Configuration for the ResilientGateway.
///
/// Composes sub-configurations for retry and circuit breaker.
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfig {
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Circuit breaker configuration.
    pub circuit_breaker: CircuitBreakerConfig,
}

/// State shared between the decorator and its in-flight dispatch tasks.
struct Resilience {
    name: String,
    breaker: CircuitBreaker,
    retry: RetryExecutor,
    metrics: GatewayMetrics,
    shutdown: CancellationToken,
}

impl Resilience {
    /// Admission control; a denial is counted but never reaches the inner gateway.
    fn admit(&self) -> Result<()> {
        self.metrics.inc_total_requests();
        if self.breaker.try_acquire() {
            return Ok(());
        }
        self.metrics.inc_failed_requests();
        debug!(gateway = %self.name, "request denied, circuit is OPEN");
        Err(GatewayError::CircuitOpen {
            gateway: self.name.clone(),
        })
    }

    async fn run<T, F, Fut>(&self, destination: &str, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.retry.execute(&self.shutdown, operation).await {
            RetryOutcome::Success { value, .. } => {
                self.breaker.record_success();
                self.metrics.inc_successful_requests();
                Ok(value)
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                self.record_exhaustion();
                warn!(
                    gateway = %self.name,
                    destination,
                    attempts,
                    error = %last_error,
                    "all retry attempts failed"
                );
                Err(GatewayError::RetryExhausted {
                    attempts,
                    source: Box::new(last_error),
                })
            }
            RetryOutcome::Interrupted {
                last_error,
                attempts,
            } => {
                self.record_exhaustion();
                warn!(gateway = %self.name, destination, attempts, "retry loop interrupted");
                Err(GatewayError::Interrupted {
                    attempts,
                    source: Box::new(last_error),
                })
            }
            RetryOutcome::Permanent { error, .. } => {
                self.metrics.inc_failed_requests();
                warn!(gateway = %self.name, destination, error = %error, "dispatch failed permanently");
                Err(error)
            }
        }
    }

    fn record_exhaustion(&self) {
        if self.breaker.record_failure() {
            self.metrics.inc_open_transitions();
        }
        self.metrics.inc_failed_requests();
    }
}

/// Circuit-breaking, retrying decorator around one inner gateway.
pub struct ResilientGateway {
    inner: Arc<dyn MessageGateway>,
    core: Arc<Resilience>,
}

impl ResilientGateway {
    /// Wraps `inner` with the default resilience settings.
    pub fn new(inner: Arc<dyn MessageGateway>) -> Self {
        Self::with_config(inner, ResilienceConfig::default())
    }

    pub fn with_config(inner: Arc<dyn MessageGateway>, config: ResilienceConfig) -> Self {
        let name = format!("Resilient-{}", inner.communication_type());
        Self {
            inner,
            core: Arc::new(Resilience {
                name,
                breaker: CircuitBreaker::new(config.circuit_breaker),
                retry: RetryExecutor::new(config.retry),
                metrics: GatewayMetrics::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Returns the wrapped gateway.
    pub fn inner(&self) -> &Arc<dyn MessageGateway> {
        &self.inner
    }

    /// Returns a reference to the circuit breaker.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.core.breaker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.core.breaker.state()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Forces the breaker back to CLOSED.
    pub fn reset(&self) {
        self.core.breaker.reset();
    }

    /// Aborts every retry loop currently waiting in backoff.
    ///
    /// Interrupted dispatches are bookkept like exhausted ones. Requests
    /// admitted afterwards are no longer retried past their first backoff.
    pub fn shutdown(&self) {
        self.core.shutdown.cancel();
    }

    fn deliver<F>(&self, destination: &str, payload: Value, headers: Headers, send: F) -> DeliveryHandle
    where
        F: Fn(&dyn MessageGateway, &str, Value, Headers) -> DeliveryHandle + Send + Sync + 'static,
    {
        if self.core.admit().is_err() {
            return DeliveryHandle::resolved(false);
        }
        let inner = Arc::clone(&self.inner);
        let core = Arc::clone(&self.core);
        let destination = destination.to_string();

        DeliveryHandle::spawn(async move {
            core.run(&destination, |_| {
                let accepted = send(inner.as_ref(), &destination, payload.clone(), headers.clone());
                let destination = destination.clone();
                async move {
                    if accepted.await {
                        Ok(())
                    } else {
                        Err(GatewayError::communication(
                            destination,
                            "transport did not accept the message",
                        ))
                    }
                }
            })
            .await
            .is_ok()
        })
    }
}

#[async_trait]
impl MessageGateway for ResilientGateway {
    async fn send_sync(
        &self,
        destination: &str,
        payload: &Value,
        headers: &Headers,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        self.core.admit()?;
        let inner = self.inner.as_ref();
        self.core
            .run(destination, move |_| {
                inner.send_sync(destination, payload, headers, timeout)
            })
            .await
    }

    fn send_async(
        &self,
        destination: &str,
        payload: Value,
        headers: Headers,
    ) -> DispatchHandle<Option<Value>> {
        if let Err(e) = self.core.admit() {
            return DispatchHandle::ready(Err(e));
        }
        let inner = Arc::clone(&self.inner);
        let core = Arc::clone(&self.core);
        let target = destination.to_string();

        DispatchHandle::spawn(destination, async move {
            core.run(&target, |_| {
                inner.send_async(&target, payload.clone(), headers.clone())
            })
            .await
        })
    }

    fn send_fire_and_forget(
        &self,
        destination: &str,
        payload: Value,
        headers: Headers,
    ) -> DeliveryHandle {
        self.deliver(destination, payload, headers, |gateway, destination, payload, headers| {
            gateway.send_fire_and_forget(destination, payload, headers)
        })
    }

    fn publish_event(&self, event_topic: &str, payload: Value, headers: Headers) -> DeliveryHandle {
        self.deliver(event_topic, payload, headers, |gateway, topic, payload, headers| {
            gateway.publish_event(topic, payload, headers)
        })
    }

    fn communication_type(&self) -> String {
        self.core.name.clone()
    }

    fn is_healthy(&self) -> bool {
        self.core.breaker.state() != CircuitState::Open && self.inner.is_healthy()
    }

    fn metrics(&self) -> MetricsMap {
        let mut map = self.inner.metrics();
        map.extend(self.core.metrics.to_map(&self.core.name));
        map.insert(
            "circuit_state".into(),
            self.core.breaker.state().as_str().into(),
        );
        map.insert(
            "failure_count".into(),
            self.core.breaker.consecutive_failures().into(),
        );
        map.insert(
            "circuit_breaker_open_count".into(),
            self.core
                .metrics
                .snapshot()
                .circuit_breaker_open_transitions
                .into(),
        );
        map
    }
}

impl std::fmt::Debug for ResilientGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientGateway")
            .field("name", &self.core.name)
            .field("circuit_breaker", &self.core.breaker.state())
            .field("metrics", &self.core.metrics.snapshot())
            .finish()
    }
}
