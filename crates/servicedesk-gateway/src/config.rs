//! Gateway configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::broker::{BrokerOptions, DEFAULT_EVENT_TOPIC_PREFIX};
use crate::adapters::rest::RestOptions;
use crate::circuitbreaker::{CircuitBreakerConfig, DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_TIMEOUT_MS};
use crate::error::{GatewayError, Result};
use crate::health::DEFAULT_UNHEALTHY_AFTER;
use crate::message::{TransportKind, DEFAULT_TIMEOUT_MS};
use crate::resilient::ResilienceConfig;
use crate::retry::{RetryConfig, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY_MS};

/// Default topic for random-requester lookups.
pub const DEFAULT_USER_RANDOM_REQUEST_TOPIC: &str = "itoms.user.random.request";
/// Default topic for ticket creation requests.
pub const DEFAULT_TICKET_REQUEST_TOPIC: &str = "itoms.ticket.request";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub base_url: String,
    pub default_timeout_ms: u64,
    pub unhealthy_after: u32,
}

impl RestConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn to_options(&self) -> RestOptions {
        RestOptions {
            base_url: self.base_url.clone(),
            default_timeout: self.default_timeout(),
            unhealthy_after: self.unhealthy_after,
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            unhealthy_after: DEFAULT_UNHEALTHY_AFTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub event_topic_prefix: String,
    pub reply_topic: Option<String>,
    pub reply_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub unhealthy_after: u32,
    pub user_random_request_topic: String,
    pub ticket_request_topic: String,
}

impl BrokerConfig {
    pub fn to_options(&self) -> BrokerOptions {
        BrokerOptions {
            event_topic_prefix: self.event_topic_prefix.clone(),
            reply_topic: self.reply_topic.clone(),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            unhealthy_after: self.unhealthy_after,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            event_topic_prefix: DEFAULT_EVENT_TOPIC_PREFIX.to_string(),
            reply_topic: None,
            reply_timeout_ms: DEFAULT_TIMEOUT_MS,
            publish_timeout_ms: DEFAULT_TIMEOUT_MS,
            unhealthy_after: DEFAULT_UNHEALTHY_AFTER,
            user_random_request_topic: DEFAULT_USER_RANDOM_REQUEST_TOPIC.to_string(),
            ticket_request_topic: DEFAULT_TICKET_REQUEST_TOPIC.to_string(),
        }
    }
}

/// Circuit breaker and retry settings in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl ResilienceSettings {
    pub fn to_resilience_config(&self) -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryConfig {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.failure_threshold,
                open_timeout: Duration::from_millis(self.open_timeout_ms),
            },
        }
    }
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_timeout_ms: DEFAULT_OPEN_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub communication_type: TransportKind,
    pub rest: RestConfig,
    pub broker: BrokerConfig,
    pub resilience: ResilienceSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            communication_type: TransportKind::Rest,
            rest: RestConfig::default(),
            broker: BrokerConfig::default(),
            resilience: ResilienceSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Loads the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from `lookup`; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(kind) = get("COMMUNICATION_TYPE") {
            config.communication_type = kind.parse()?;
        }

        if let Some(url) = get("MESSAGING_REST_BASE_URL") {
            config.rest.base_url = url;
        }
        if let Some(raw) = get("MESSAGING_REST_TIMEOUT_MS") {
            config.rest.default_timeout_ms = parse_number("MESSAGING_REST_TIMEOUT_MS", &raw)?;
        }

        if let Some(prefix) = get("MESSAGING_EVENT_TOPIC_PREFIX") {
            config.broker.event_topic_prefix = prefix;
        }
        config.broker.reply_topic = get("MESSAGING_REPLY_TOPIC");
        if let Some(raw) = get("MESSAGING_REPLY_TIMEOUT_MS") {
            config.broker.reply_timeout_ms = parse_number("MESSAGING_REPLY_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("MESSAGING_PUBLISH_TIMEOUT_MS") {
            config.broker.publish_timeout_ms = parse_number("MESSAGING_PUBLISH_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("MESSAGING_UNHEALTHY_AFTER") {
            let unhealthy_after = parse_number("MESSAGING_UNHEALTHY_AFTER", &raw)?;
            config.rest.unhealthy_after = unhealthy_after;
            config.broker.unhealthy_after = unhealthy_after;
        }
        if let Some(topic) = get("KAFKA_TOPIC_USER_RANDOM_REQUEST") {
            config.broker.user_random_request_topic = topic;
        }
        if let Some(topic) = get("KAFKA_TOPIC_TICKET_REQUEST") {
            config.broker.ticket_request_topic = topic;
        }

        let resilience = &mut config.resilience;
        if let Some(raw) = get("RESILIENCE_FAILURE_THRESHOLD") {
            resilience.failure_threshold = parse_number("RESILIENCE_FAILURE_THRESHOLD", &raw)?;
        }
        if let Some(raw) = get("RESILIENCE_OPEN_TIMEOUT_MS") {
            resilience.open_timeout_ms = parse_number("RESILIENCE_OPEN_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("RESILIENCE_MAX_RETRIES") {
            resilience.max_retries = parse_number("RESILIENCE_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = get("RESILIENCE_RETRY_BASE_DELAY_MS") {
            resilience.retry_base_delay_ms = parse_number("RESILIENCE_RETRY_BASE_DELAY_MS", &raw)?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resilience.failure_threshold == 0 {
            return Err(GatewayError::Configuration(
                "failure threshold must be at least 1".to_string(),
            ));
        }

        if self.resilience.open_timeout_ms == 0 {
            return Err(GatewayError::Configuration(
                "circuit open timeout must be positive".to_string(),
            ));
        }

        match self.communication_type {
            TransportKind::Rest => {
                if self.rest.base_url.trim().is_empty() {
                    return Err(GatewayError::Configuration(
                        "REST transport needs a base URL".to_string(),
                    ));
                }
                if self.rest.default_timeout_ms == 0 {
                    return Err(GatewayError::Configuration(
                        "REST timeout must be positive".to_string(),
                    ));
                }
            }
            TransportKind::Kafka => {
                if self.broker.event_topic_prefix.is_empty() {
                    return Err(GatewayError::Configuration(
                        "broker transport needs an event topic prefix".to_string(),
                    ));
                }
                if self.broker.publish_timeout_ms == 0 {
                    return Err(GatewayError::Configuration(
                        "publish timeout must be positive".to_string(),
                    ));
                }
                if self.broker.reply_topic.is_some() && self.broker.reply_timeout_ms == 0 {
                    return Err(GatewayError::Configuration(
                        "reply timeout must be positive when a reply topic is set".to_string(),
                    ));
                }
            }
            TransportKind::Grpc => {
                return Err(GatewayError::Configuration(
                    "no adapter is available for the GRPC transport".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn parse_number<N: std::str::FromStr>(key: &str, raw: &str) -> Result<N> {
    raw.trim()
        .parse()
        .map_err(|_| GatewayError::Configuration(format!("{key} is not a valid number: {raw}")))
}
