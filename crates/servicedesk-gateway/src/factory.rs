//! Builds the configured adapter wrapped in a [`ResilientGateway`].

use std::sync::Arc;

use tracing::info;

use crate::adapters::{BrokerGateway, BrokerProducer, HttpClient, RestGateway};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::MessageGateway;
use crate::message::TransportKind;
use crate::resilient::ResilientGateway;

/// Transport clients available to the factory. Only the one matching the
/// configured communication type is required.
#[derive(Default, Clone)]
pub struct TransportClients {
    pub http: Option<Arc<dyn HttpClient>>,
    pub broker: Option<Arc<dyn BrokerProducer>>,
}

impl TransportClients {
    pub fn http(client: Arc<dyn HttpClient>) -> Self {
        Self {
            http: Some(client),
            broker: None,
        }
    }

    pub fn broker(producer: Arc<dyn BrokerProducer>) -> Self {
        Self {
            http: None,
            broker: Some(producer),
        }
    }
}

/// A wired gateway.
#[derive(Debug)]
pub struct Wiring {
    /// The resilient gateway every caller should use.
    pub gateway: Arc<ResilientGateway>,
    /// The broker adapter, kept for feeding replies from the consumer side.
    pub broker: Option<BrokerGateway<Arc<dyn BrokerProducer>>>,
}

impl Wiring {
    /// The gateway as a trait object, ready for the builder.
    pub fn shared(&self) -> Arc<dyn MessageGateway> {
        self.gateway.clone()
    }
}

/// Validates `config` and wires the adapter it selects.
pub fn build_gateway(config: &GatewayConfig, clients: TransportClients) -> Result<Wiring> {
    config.validate()?;
    let resilience = config.resilience.to_resilience_config();

    let (inner, broker) = match config.communication_type {
        TransportKind::Rest => {
            let http = clients.http.ok_or_else(|| {
                GatewayError::Configuration("REST transport selected but no HTTP client supplied".to_string())
            })?;
            let rest = RestGateway::with_options(http, config.rest.to_options());
            let inner: Arc<dyn MessageGateway> = Arc::new(rest);
            (inner, None)
        }
        TransportKind::Kafka => {
            let producer = clients.broker.ok_or_else(|| {
                GatewayError::Configuration("broker transport selected but no producer supplied".to_string())
            })?;
            let broker = BrokerGateway::with_options(producer, config.broker.to_options());
            let inner: Arc<dyn MessageGateway> = Arc::new(broker.clone());
            (inner, Some(broker))
        }
        TransportKind::Grpc => {
            return Err(GatewayError::Configuration(
                "no adapter is available for the GRPC transport".to_string(),
            ));
        }
    };

    let gateway = Arc::new(ResilientGateway::with_config(inner, resilience));
    info!(
        communication_type = %gateway.communication_type(),
        failure_threshold = config.resilience.failure_threshold,
        max_retries = config.resilience.max_retries,
        "message gateway wired"
    );
    Ok(Wiring { gateway, broker })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{BrokerRecord, TransportFault};
    use crate::message::Headers;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct NullHttp;

    #[async_trait]
    impl HttpClient for NullHttp {
        async fn post(&self, _: &str, _: &Headers, _: &Value) -> std::result::Result<Option<Value>, TransportFault> {
            Ok(None)
        }
    }

    struct NullProducer;

    #[async_trait]
    impl BrokerProducer for NullProducer {
        async fn send(&self, _: BrokerRecord) -> std::result::Result<(), TransportFault> {
            Ok(())
        }
    }

    #[test]
    fn test_build_rest_gateway() {
        let wiring = build_gateway(&GatewayConfig::default(), TransportClients::http(Arc::new(NullHttp))).unwrap();
        assert_eq!(wiring.gateway.communication_type(), "Resilient-REST");
        assert!(wiring.broker.is_none());
    }

    #[tokio::test]
    async fn test_build_broker_gateway_shares_pending_replies() {
        let mut config = GatewayConfig::default();
        config.communication_type = TransportKind::Kafka;
        config.broker.reply_topic = Some("replies".to_string());

        let wiring = build_gateway(&config, TransportClients::broker(Arc::new(NullProducer))).unwrap();
        assert_eq!(wiring.shared().communication_type(), "Resilient-KAFKA");

        let mut headers = Headers::new();
        headers.insert("correlation-id".to_string(), "c-1".to_string());
        let handle = wiring.gateway.send_async("t", json!({}), headers);
        let broker = wiring.broker.clone().unwrap();
        while broker.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(broker.deliver_reply("c-1", json!("pong")));
        assert_eq!(handle.await.unwrap(), Some(json!("pong")));
    }

    #[test]
    fn test_missing_client_is_configuration_error() {
        let err = build_gateway(&GatewayConfig::default(), TransportClients::default()).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));

        let mut config = GatewayConfig::default();
        config.communication_type = TransportKind::Kafka;
        let err = build_gateway(&config, TransportClients::http(Arc::new(NullHttp))).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }
}
