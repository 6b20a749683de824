//! Transport-agnostic dispatch contract.
//!
//! This module defines the [`MessageGateway`] trait implemented by every
//! transport adapter and by the [`ResilientGateway`](crate::resilient::ResilientGateway)
//! decorator, together with the handles returned by the non-blocking
//! operations.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::message::Headers;
use crate::metrics::MetricsMap;

/// Capability set shared by all transports.
///
/// Payloads and responses cross this boundary as JSON values; typing happens
/// in the [builder](crate::builder). The three non-blocking operations must be
/// called from within a tokio runtime: they start the dispatch immediately and
/// return a handle that resolves exactly once.
#[async_trait]
pub trait MessageGateway: Send + Sync + 'static {
    /// Sends `payload` and waits for the response.
    ///
    /// Returns `Ok(None)` when the transport legitimately answers without a
    /// body. Fails with a communication error if the transport call errors or
    /// `timeout` elapses.
    async fn send_sync(
        &self,
        destination: &str,
        payload: &Value,
        headers: &Headers,
        timeout: Duration,
    ) -> Result<Option<Value>>;

    /// Sends `payload` without waiting; the handle resolves with the response
    /// or an error.
    fn send_async(
        &self,
        destination: &str,
        payload: Value,
        headers: Headers,
    ) -> DispatchHandle<Option<Value>>;

    /// Point-to-point one-way send. Resolves `true` iff the transport accepted
    /// the message and never raises.
    fn send_fire_and_forget(&self, destination: &str, payload: Value, headers: Headers)
        -> DeliveryHandle;

    /// Topic-addressed one-way send with the same contract as
    /// [`send_fire_and_forget`](Self::send_fire_and_forget).
    fn publish_event(&self, event_topic: &str, payload: Value, headers: Headers) -> DeliveryHandle;

    /// Static identifier of the transport, e.g. `"REST"` or `"KAFKA"`.
    fn communication_type(&self) -> String;

    /// Whether the transport currently accepts traffic.
    fn is_healthy(&self) -> bool;

    /// Counters and transport-specific entries.
    fn metrics(&self) -> MetricsMap;
}

/// Pending result of a [`MessageGateway::send_async`] dispatch.
///
/// The dispatch runs on its own tokio task; dropping the handle detaches it
/// and does not cancel the in-flight transport call.
#[must_use = "a DispatchHandle carries the dispatch result"]
pub struct DispatchHandle<T> {
    inner: Pin<Box<dyn Future<Output = Result<T>> + Send>>,
}

impl<T: Send + 'static> DispatchHandle<T> {
    /// Spawns `future` onto the current runtime.
    pub fn spawn<F>(destination: &str, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let destination = destination.to_string();
        let task = tokio::spawn(future);
        Self {
            inner: Box::pin(async move {
                match task.await {
                    Ok(result) => result,
                    Err(e) => Err(GatewayError::communication(
                        destination,
                        format!("dispatch task failed: {e}"),
                    )),
                }
            }),
        }
    }

    /// A handle that is already resolved.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            inner: Box::pin(std::future::ready(result)),
        }
    }

    /// Fails the handle with [`GatewayError::Timeout`] if it has not resolved
    /// within `timeout`. The underlying dispatch keeps running.
    pub fn with_deadline(self, destination: &str, timeout: Duration) -> Self {
        let destination = destination.to_string();
        let inner = self.inner;
        Self {
            inner: Box::pin(async move {
                match tokio::time::timeout(timeout, inner).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout {
                        destination,
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }),
        }
    }

    /// Transforms the eventual value; an error from `f` fails the handle.
    pub fn map<U, F>(self, f: F) -> DispatchHandle<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let inner = self.inner;
        DispatchHandle {
            inner: Box::pin(async move { inner.await.and_then(f) }),
        }
    }
}

impl<T> Future for DispatchHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> std::fmt::Debug for DispatchHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandle").finish_non_exhaustive()
    }
}

/// Pending acceptance flag of a one-way dispatch.
///
/// Resolves `false` on any failure, including a panicked dispatch task.
#[must_use = "a DeliveryHandle carries the delivery result"]
pub struct DeliveryHandle {
    inner: Pin<Box<dyn Future<Output = bool> + Send>>,
}

impl DeliveryHandle {
    /// Spawns `future` onto the current runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let task = tokio::spawn(future);
        Self {
            inner: Box::pin(async move {
                task.await.unwrap_or_else(|e| {
                    warn!(error = %e, "delivery task failed");
                    false
                })
            }),
        }
    }

    /// A handle that is already resolved.
    pub fn resolved(accepted: bool) -> Self {
        Self {
            inner: Box::pin(std::future::ready(accepted)),
        }
    }
}

impl Future for DeliveryHandle {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        self.inner.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryHandle").finish_non_exhaustive()
    }
}

/// Deserializes an optional response body into the caller's type.
pub(crate) fn decode_response<R: DeserializeOwned>(body: Option<Value>) -> Result<Option<R>> {
    match body {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
    }
}
