//! Dispatch request vocabulary: transport kinds, delivery patterns and headers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Header carrying the transport kind of the request.
pub const HEADER_COMMUNICATION_TYPE: &str = "communication-type";
/// Header carrying the delivery pattern of the request.
pub const HEADER_COMMUNICATION_PATTERN: &str = "communication-pattern";
/// Header carrying the construction time of the request (RFC 3339).
pub const HEADER_TIMESTAMP: &str = "timestamp";
/// Header carrying the caller's correlation id.
pub const HEADER_CORRELATION_ID: &str = "correlation-id";
/// Header carrying the callback URL of a CALLBACK exchange.
pub const HEADER_CALLBACK_URL: &str = "callback-url";
/// Header carrying the caller-assigned priority.
pub const HEADER_PRIORITY: &str = "priority";
/// Header naming the originating service.
pub const HEADER_SOURCE: &str = "source";
/// Header carrying the payload schema version.
pub const HEADER_VERSION: &str = "version";
/// Header overriding the broker record key.
pub const HEADER_MESSAGE_KEY: &str = "message-key";

/// Default timeout for synchronous and async-with-response dispatch.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// String headers attached to every dispatch. Insertion order is irrelevant.
pub type Headers = HashMap<String, String>;

/// Wire transport a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Synchronous HTTP request/response.
    Rest,
    /// Asynchronous broker publish.
    Kafka,
    /// RPC stub call.
    Grpc,
}

impl TransportKind {
    /// Identifier used in headers and `communication_type()`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Rest => "REST",
            TransportKind::Kafka => "KAFKA",
            TransportKind::Grpc => "GRPC",
        }
    }

    /// Transports without a response channel.
    pub fn is_publish_style(&self) -> bool {
        matches!(self, TransportKind::Kafka)
    }

    /// Pattern used when the caller does not pick one.
    pub fn default_pattern(&self) -> DeliveryPattern {
        if self.is_publish_style() {
            DeliveryPattern::EventDriven
        } else {
            DeliveryPattern::RequestResponse
        }
    }

    /// Recovers the kind from a gateway's `communication_type()`, decorators included.
    pub fn from_communication_type(communication_type: &str) -> Option<Self> {
        let base = communication_type
            .rsplit('-')
            .next()
            .unwrap_or(communication_type);
        base.parse().ok()
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REST" | "HTTP" => Ok(TransportKind::Rest),
            "KAFKA" | "BROKER" => Ok(TransportKind::Kafka),
            "GRPC" | "RPC" => Ok(TransportKind::Grpc),
            other => Err(GatewayError::Configuration(format!(
                "unknown communication type: {other}"
            ))),
        }
    }
}

/// Semantic shape of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryPattern {
    /// Caller waits for the response.
    RequestResponse,
    /// Response is delivered later to a `callback-url`.
    Callback,
    /// One-way event, no response channel.
    EventDriven,
}

impl DeliveryPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryPattern::RequestResponse => "REQUEST_RESPONSE",
            DeliveryPattern::Callback => "CALLBACK",
            DeliveryPattern::EventDriven => "EVENT_DRIVEN",
        }
    }
}

impl fmt::Display for DeliveryPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully specified request, frozen by the builder's terminal stage.
///
/// Fields are private; the only way to obtain one is
/// [`ExecutableStage::into_request`](crate::builder::ExecutableStage::into_request)
/// or the terminal dispatch operations, so the base headers are always present.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    transport_kind: TransportKind,
    destination: String,
    payload: Value,
    pattern: DeliveryPattern,
    headers: Headers,
    timeout: Duration,
}

impl DispatchRequest {
    pub(crate) fn new(
        transport_kind: TransportKind,
        destination: String,
        payload: Value,
        pattern: DeliveryPattern,
        mut headers: Headers,
        timeout: Duration,
    ) -> Self {
        headers
            .entry(HEADER_COMMUNICATION_TYPE.to_string())
            .or_insert_with(|| transport_kind.as_str().to_string());
        headers
            .entry(HEADER_COMMUNICATION_PATTERN.to_string())
            .or_insert_with(|| pattern.as_str().to_string());
        headers
            .entry(HEADER_TIMESTAMP.to_string())
            .or_insert_with(|| chrono::Utc::now().to_rfc3339());
        Self {
            transport_kind,
            destination,
            payload,
            pattern,
            headers,
            timeout,
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn pattern(&self) -> DeliveryPattern {
        self.pattern
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(HEADER_CORRELATION_ID).map(String::as_str)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn into_parts(self) -> (String, Value, Headers, Duration) {
        (self.destination, self.payload, self.headers, self.timeout)
    }
}
