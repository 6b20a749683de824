//! Service desk gateway configuration check.
//!
//! Loads the gateway configuration from the environment, validates it and
//! reports the wiring the service would start with.

use anyhow::Context;
use servicedesk_gateway::config::GatewayConfig;
use servicedesk_gateway::message::TransportKind;
use servicedesk_gateway::registry::{EnvRegistry, ServiceRegistry, TICKET_SERVICE_URL, USER_SERVICE_URL};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let json = std::env::var("SD_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = GatewayConfig::from_env().context("loading gateway configuration")?;
    config.validate().context("validating gateway configuration")?;

    tracing::info!(
        communication_type = %config.communication_type,
        failure_threshold = config.resilience.failure_threshold,
        open_timeout_ms = config.resilience.open_timeout_ms,
        max_retries = config.resilience.max_retries,
        retry_base_delay_ms = config.resilience.retry_base_delay_ms,
        "resilient gateway settings"
    );

    match config.communication_type {
        TransportKind::Rest => {
            tracing::info!(
                base_url = %config.rest.base_url,
                timeout_ms = config.rest.default_timeout_ms,
                "REST adapter"
            );
            for key in [USER_SERVICE_URL, TICKET_SERVICE_URL] {
                match EnvRegistry.resolve(key) {
                    Some(url) => tracing::info!(service = key, url = %url, "downstream service"),
                    None => tracing::warn!(service = key, "downstream service URL not set"),
                }
            }
        }
        TransportKind::Kafka => {
            tracing::info!(
                event_topic_prefix = %config.broker.event_topic_prefix,
                reply_topic = config.broker.reply_topic.as_deref().unwrap_or("-"),
                user_random_request_topic = %config.broker.user_random_request_topic,
                ticket_request_topic = %config.broker.ticket_request_topic,
                "broker adapter"
            );
            if config.broker.reply_topic.is_none() {
                tracing::warn!("no reply topic set, request/response over the broker is disabled");
            }
        }
        TransportKind::Grpc => {}
    }

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
