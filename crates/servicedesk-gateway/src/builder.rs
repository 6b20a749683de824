//! Staged, type-safe construction of gateway dispatches.
//!
//! Each stage is a distinct type that only exposes the next legal step:
//!
//! ```text
//! MessageBuilder::create(gw)
//!     -> TransportStage      transport(kind) | rest() | kafka() | grpc()
//!     -> DestinationStage    destination(s)  | service_destination(key, path)?
//!     -> PayloadStage        message(payload)
//!     -> PatternStage<T>     request_response() | callback(url)? | event_driven()
//!                            | pattern(p)? | default_pattern()
//!     -> ExecutableStage<T>  options..., then exactly one terminal operation
//! ```
//!
//! Skipping a stage does not compile:
//!
//! ```compile_fail
//! use std::sync::Arc;
//! use servicedesk_gateway::builder::MessageBuilder;
//! use servicedesk_gateway::gateway::MessageGateway;
//!
//! fn skip(gateway: Arc<dyn MessageGateway>) {
//!     // no pattern chosen, so there is no terminal operation yet
//!     let _ = MessageBuilder::create(gateway)
//!         .rest()
//!         .destination("svc://x")
//!         .message(1)
//!         .send_fire_and_forget();
//! }
//! ```
//!
//! Terminal operations consume the stage, so a built request cannot be replayed.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::{decode_response, DeliveryHandle, DispatchHandle, MessageGateway};
use crate::message::{
    DeliveryPattern, DispatchRequest, Headers, TransportKind, DEFAULT_TIMEOUT_MS,
    HEADER_CALLBACK_URL, HEADER_CORRELATION_ID, HEADER_PRIORITY, HEADER_SOURCE, HEADER_VERSION,
};
use crate::registry::{join_url, ServiceRegistry};

/// Gateway binding carried through every stage.
#[derive(Clone)]
struct Binding {
    gateway: Arc<dyn MessageGateway>,
    registry: Option<Arc<dyn ServiceRegistry>>,
}

/// Entry point of the staged builder.
pub struct MessageBuilder;

impl MessageBuilder {
    /// Starts a request bound to `gateway`.
    pub fn create(gateway: Arc<dyn MessageGateway>) -> TransportStage {
        TransportStage {
            binding: Binding {
                gateway,
                registry: None,
            },
        }
    }

    /// Starts a request that can resolve service destinations through `registry`.
    pub fn with_registry(
        gateway: Arc<dyn MessageGateway>,
        registry: Arc<dyn ServiceRegistry>,
    ) -> TransportStage {
        TransportStage {
            binding: Binding {
                gateway,
                registry: Some(registry),
            },
        }
    }
}

/// Stage 1: pick the transport kind.
pub struct TransportStage {
    binding: Binding,
}

impl TransportStage {
    pub fn transport(self, kind: TransportKind) -> DestinationStage {
        DestinationStage {
            binding: self.binding,
            kind,
        }
    }

    pub fn rest(self) -> DestinationStage {
        self.transport(TransportKind::Rest)
    }

    pub fn kafka(self) -> DestinationStage {
        self.transport(TransportKind::Kafka)
    }

    pub fn grpc(self) -> DestinationStage {
        self.transport(TransportKind::Grpc)
    }
}

/// Stage 2: address the request.
pub struct DestinationStage {
    binding: Binding,
    kind: TransportKind,
}

impl DestinationStage {
    pub fn destination(self, destination: impl Into<String>) -> PayloadStage {
        PayloadStage {
            binding: self.binding,
            kind: self.kind,
            destination: destination.into(),
        }
    }

    /// Resolves `key` through the bound registry and appends `path`.
    ///
    /// Fails with [`GatewayError::Configuration`] when no registry is bound or
    /// the key does not resolve.
    pub fn service_destination(self, key: &str, path: &str) -> Result<PayloadStage> {
        let registry = self.binding.registry.as_ref().ok_or_else(|| {
            GatewayError::Configuration(format!(
                "no service registry bound, cannot resolve {key}"
            ))
        })?;
        let base = registry.resolve(key).ok_or_else(|| {
            GatewayError::Configuration(format!("service URL not found for key: {key}"))
        })?;
        let destination = join_url(&base, path);
        Ok(self.destination(destination))
    }
}

/// Stage 3: attach the payload.
pub struct PayloadStage {
    binding: Binding,
    kind: TransportKind,
    destination: String,
}

impl PayloadStage {
    pub fn message<T: Serialize + Send>(self, payload: T) -> PatternStage<T> {
        PatternStage {
            binding: self.binding,
            kind: self.kind,
            destination: self.destination,
            payload,
        }
    }
}

/// Stage 4: choose the delivery pattern.
pub struct PatternStage<T> {
    binding: Binding,
    kind: TransportKind,
    destination: String,
    payload: T,
}

impl<T: Serialize + Send> PatternStage<T> {
    pub fn request_response(self) -> ExecutableStage<T> {
        self.into_executable(DeliveryPattern::RequestResponse, Headers::new())
    }

    /// CALLBACK exchange answered later at `callback_url`.
    pub fn callback(self, callback_url: impl Into<String>) -> Result<ExecutableStage<T>> {
        let callback_url = callback_url.into();
        if callback_url.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "CALLBACK pattern requires a callback URL".to_string(),
            ));
        }
        let mut headers = Headers::new();
        headers.insert(HEADER_CALLBACK_URL.to_string(), callback_url);
        Ok(self.into_executable(DeliveryPattern::Callback, headers))
    }

    pub fn event_driven(self) -> ExecutableStage<T> {
        self.into_executable(DeliveryPattern::EventDriven, Headers::new())
    }

    /// Picks `pattern` explicitly. CALLBACK must go through [`callback`](Self::callback).
    pub fn pattern(self, pattern: DeliveryPattern) -> Result<ExecutableStage<T>> {
        match pattern {
            DeliveryPattern::Callback => Err(GatewayError::Configuration(
                "CALLBACK pattern requires a callback URL".to_string(),
            )),
            other => Ok(self.into_executable(other, Headers::new())),
        }
    }

    /// EVENT_DRIVEN for publish-style transports, REQUEST_RESPONSE otherwise.
    pub fn default_pattern(self) -> ExecutableStage<T> {
        let pattern = self.kind.default_pattern();
        self.into_executable(pattern, Headers::new())
    }

    fn into_executable(self, pattern: DeliveryPattern, headers: Headers) -> ExecutableStage<T> {
        ExecutableStage {
            binding: self.binding,
            kind: self.kind,
            destination: self.destination,
            payload: self.payload,
            pattern,
            headers,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Stage 5: optional settings and the terminal dispatch operations.
pub struct ExecutableStage<T> {
    binding: Binding,
    kind: TransportKind,
    destination: String,
    payload: T,
    pattern: DeliveryPattern,
    headers: Headers,
    timeout: Duration,
}

impl<T: Serialize + Send> ExecutableStage<T> {
    pub fn correlation_id(self, correlation_id: impl Into<String>) -> Self {
        self.header(HEADER_CORRELATION_ID, correlation_id)
    }

    /// Sets a random v4 UUID as the correlation id.
    pub fn auto_correlation_id(self) -> Self {
        self.correlation_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn priority(self, priority: impl Into<String>) -> Self {
        self.header(HEADER_PRIORITY, priority)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn source(self, source: impl Into<String>) -> Self {
        self.header(HEADER_SOURCE, source)
    }

    pub fn version(self, version: impl Into<String>) -> Self {
        self.header(HEADER_VERSION, version)
    }

    /// Overrides the 30s default bounding [`send_sync`](Self::send_sync) and
    /// the handle returned by [`send_async`](Self::send_async).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Freezes the accumulated state without dispatching it.
    pub fn into_request(self) -> Result<DispatchRequest> {
        self.freeze().map(|(_, request)| request)
    }

    fn freeze(self) -> Result<(Arc<dyn MessageGateway>, DispatchRequest)> {
        let payload = serde_json::to_value(&self.payload)?;
        let request = DispatchRequest::new(
            self.kind,
            self.destination,
            payload,
            self.pattern,
            self.headers,
            self.timeout,
        );
        Ok((self.binding.gateway, request))
    }

    /// Sends and waits for the response, decoded as `R`.
    pub async fn send_sync<R: DeserializeOwned>(self) -> Result<Option<R>> {
        let (gateway, request) = self.freeze()?;
        log_operation("sync", &request);
        let (destination, payload, headers, timeout) = request.into_parts();
        let body = gateway
            .send_sync(&destination, &payload, &headers, timeout)
            .await?;
        decode_response(body)
    }

    /// Sends without waiting; the handle resolves with the decoded response.
    pub fn send_async<R>(self) -> DispatchHandle<Option<R>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let (gateway, request) = match self.freeze() {
            Ok(frozen) => frozen,
            Err(e) => return DispatchHandle::ready(Err(e)),
        };
        log_operation("async", &request);
        let (destination, payload, headers, timeout) = request.into_parts();
        gateway
            .send_async(&destination, payload, headers)
            .with_deadline(&destination, timeout)
            .map(decode_response)
    }

    /// One-way send; resolves `false` if the payload cannot be serialized.
    pub fn send_fire_and_forget(self) -> DeliveryHandle {
        let (gateway, request) = match self.freeze() {
            Ok(frozen) => frozen,
            Err(e) => {
                warn!(error = %e, "payload serialization failed, nothing sent");
                return DeliveryHandle::resolved(false);
            }
        };
        log_operation("fire-and-forget", &request);
        let (destination, payload, headers, _) = request.into_parts();
        gateway.send_fire_and_forget(&destination, payload, headers)
    }

    /// Publishes the payload as an event to the destination topic.
    pub fn publish_event(self) -> DeliveryHandle {
        let (gateway, request) = match self.freeze() {
            Ok(frozen) => frozen,
            Err(e) => {
                warn!(error = %e, "event serialization failed, nothing published");
                return DeliveryHandle::resolved(false);
            }
        };
        log_operation("event publish", &request);
        let (destination, payload, headers, _) = request.into_parts();
        gateway.publish_event(&destination, payload, headers)
    }
}

fn log_operation(operation: &str, request: &DispatchRequest) {
    info!(
        operation,
        transport = %request.transport_kind(),
        pattern = %request.pattern(),
        destination = request.destination(),
        correlation_id = request.correlation_id().unwrap_or("-"),
        "dispatching message"
    );
}

fn inferred_kind(gateway: &dyn MessageGateway) -> TransportKind {
    TransportKind::from_communication_type(&gateway.communication_type())
        .unwrap_or(TransportKind::Rest)
}

/// Publishes `event` to `event_type` with an auto-generated correlation id.
pub fn publish_simple_event<T: Serialize + Send>(
    gateway: Arc<dyn MessageGateway>,
    event_type: &str,
    event: T,
) -> DeliveryHandle {
    let kind = inferred_kind(gateway.as_ref());
    MessageBuilder::create(gateway)
        .transport(kind)
        .destination(event_type)
        .message(event)
        .event_driven()
        .auto_correlation_id()
        .publish_event()
}

/// Fire-and-forget request/response send with an auto-generated correlation id.
pub fn send_simple<T: Serialize + Send>(
    gateway: Arc<dyn MessageGateway>,
    destination: &str,
    message: T,
) -> DeliveryHandle {
    let kind = inferred_kind(gateway.as_ref());
    MessageBuilder::create(gateway)
        .transport(kind)
        .destination(destination)
        .message(message)
        .request_response()
        .auto_correlation_id()
        .send_fire_and_forget()
}

/// Synchronous call with an auto-generated correlation id.
pub async fn call_simple<T, R>(
    gateway: Arc<dyn MessageGateway>,
    destination: &str,
    message: T,
) -> Result<Option<R>>
where
    T: Serialize + Send,
    R: DeserializeOwned,
{
    let kind = inferred_kind(gateway.as_ref());
    MessageBuilder::create(gateway)
        .transport(kind)
        .destination(destination)
        .message(message)
        .request_response()
        .auto_correlation_id()
        .send_sync()
        .await
}
