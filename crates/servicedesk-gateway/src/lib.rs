//! Service desk messaging: a transport-agnostic, resilient message gateway
//! and a staged request builder on top of it.
//!
//! Business code builds requests with [`builder::MessageBuilder`] against any
//! [`gateway::MessageGateway`]. The reference adapters in [`adapters`] are
//! normally wrapped in a [`resilient::ResilientGateway`], which adds circuit
//! breaking, bounded retry and request metrics without changing the contract.

pub mod adapters;
pub mod builder;
pub mod circuitbreaker;
pub mod config;
pub mod downstream;
pub mod error;
pub mod factory;
pub mod gateway;
pub mod health;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod resilient;
pub mod retry;

pub use builder::MessageBuilder;
pub use circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use factory::{build_gateway, TransportClients, Wiring};
pub use gateway::{DeliveryHandle, DispatchHandle, MessageGateway};
pub use message::{DeliveryPattern, DispatchRequest, Headers, TransportKind};
pub use metrics::{GatewayMetrics, MetricsMap, MetricsSnapshot};
pub use resilient::{ResilienceConfig, ResilientGateway};
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};
