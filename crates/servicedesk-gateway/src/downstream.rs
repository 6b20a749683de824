//! Typed callers of the user and ticket services.
//!
//! Every call goes through the staged [`MessageBuilder`], so the bound
//! gateway (usually a [`ResilientGateway`](crate::resilient::ResilientGateway))
//! decides the transport behavior.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::builder::MessageBuilder;
use crate::config::BrokerConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::{DeliveryHandle, MessageGateway};
use crate::message::HEADER_MESSAGE_KEY;
use crate::registry::{ServiceRegistry, TICKET_SERVICE_URL, USER_SERVICE_URL};

/// User-service endpoint returning a random member.
pub const RANDOM_MEMBER_PATH: &str = "/api/user/randomMember";
/// Ticket-service endpoint creating a ticket.
pub const CREATE_TICKET_PATH: &str = "/api/ticket-core/v1/ticket";

const SOURCE: &str = "service-desk";

/// Envelope used by the user service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub is_success: bool,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub result: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Unwraps a successful envelope; anything else is a communication error.
    pub fn into_result(self, destination: &str) -> Result<T> {
        match (self.is_success, self.result) {
            (true, Some(result)) => Ok(result),
            (true, None) => Err(GatewayError::communication(destination, "successful response without result")),
            (false, _) => Err(GatewayError::communication(
                destination,
                format!(
                    "service reported failure {}: {}",
                    self.code.as_deref().unwrap_or("-"),
                    self.message.as_deref().unwrap_or("no message")
                ),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub requester_id: String,
    pub requester_name: String,
}

impl From<&UserSummary> for Requester {
    fn from(user: &UserSummary) -> Self {
        Self {
            requester_id: user.id.to_string(),
            requester_name: user.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTicketRequest {
    pub incident_id: Uuid,
    pub requester: Requester,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTicketResponse {
    pub ticket_id: Uuid,
}

/// Reply published by the user service for a random-requester request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RandomUserResponse {
    pub incident_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
}

impl From<&RandomUserResponse> for Requester {
    fn from(reply: &RandomUserResponse) -> Self {
        Self {
            requester_id: reply.user_id.to_string(),
            requester_name: reply.user_name.clone(),
        }
    }
}

/// Callers of the downstream services over one gateway.
pub struct DownstreamClients {
    gateway: Arc<dyn MessageGateway>,
    registry: Arc<dyn ServiceRegistry>,
    user_random_request_topic: String,
    ticket_request_topic: String,
}

impl DownstreamClients {
    pub fn new(
        gateway: Arc<dyn MessageGateway>,
        registry: Arc<dyn ServiceRegistry>,
        topics: &BrokerConfig,
    ) -> Self {
        Self {
            gateway,
            registry,
            user_random_request_topic: topics.user_random_request_topic.clone(),
            ticket_request_topic: topics.ticket_request_topic.clone(),
        }
    }

    fn builder(&self) -> crate::builder::TransportStage {
        MessageBuilder::with_registry(Arc::clone(&self.gateway), Arc::clone(&self.registry))
    }

    /// Asks the user service for a random requester.
    pub async fn random_requester(&self) -> Result<UserSummary> {
        let response: Option<ApiResponse<UserSummary>> = self
            .builder()
            .rest()
            .service_destination(USER_SERVICE_URL, RANDOM_MEMBER_PATH)?
            .message(())
            .request_response()
            .auto_correlation_id()
            .source(SOURCE)
            .send_sync()
            .await?;

        let user = response
            .ok_or_else(|| GatewayError::communication(USER_SERVICE_URL, "empty response"))?
            .into_result(USER_SERVICE_URL)?;
        info!(user_id = %user.id, "random requester resolved");
        Ok(user)
    }

    /// Creates a ticket for an incident and returns its id.
    pub async fn create_ticket(&self, request: &CreateTicketRequest) -> Result<CreateTicketResponse> {
        let response: Option<CreateTicketResponse> = self
            .builder()
            .rest()
            .service_destination(TICKET_SERVICE_URL, CREATE_TICKET_PATH)?
            .message(request)
            .request_response()
            .auto_correlation_id()
            .source(SOURCE)
            .send_sync()
            .await?;

        let created = response
            .ok_or_else(|| GatewayError::communication(TICKET_SERVICE_URL, "empty response"))?;
        info!(incident_id = %request.incident_id, ticket_id = %created.ticket_id, "ticket created");
        Ok(created)
    }

    /// Publishes a random-requester request keyed by the incident id.
    pub fn request_random_requester(&self, incident_id: Uuid) -> DeliveryHandle {
        self.builder()
            .kafka()
            .destination(self.user_random_request_topic.as_str())
            .message(incident_id)
            .event_driven()
            .header(HEADER_MESSAGE_KEY, incident_id.to_string())
            .auto_correlation_id()
            .source(SOURCE)
            .send_fire_and_forget()
    }

    /// Consumes a random-requester reply from the user service and publishes
    /// the ticket request for its incident.
    ///
    /// Fails with a serialization error if `body` is not a [`RandomUserResponse`].
    pub fn on_random_user_response(&self, body: Value) -> Result<DeliveryHandle> {
        let reply: RandomUserResponse = serde_json::from_value(body)?;
        info!(
            incident_id = %reply.incident_id,
            user_id = %reply.user_id,
            user_name = %reply.user_name,
            "random requester received"
        );
        Ok(self.publish_create_ticket(CreateTicketRequest {
            incident_id: reply.incident_id,
            requester: Requester::from(&reply),
        }))
    }

    /// Publishes a ticket creation request keyed by the incident id.
    pub fn publish_create_ticket(&self, request: CreateTicketRequest) -> DeliveryHandle {
        let key = request.incident_id.to_string();
        self.builder()
            .kafka()
            .destination(self.ticket_request_topic.as_str())
            .message(request)
            .event_driven()
            .header(HEADER_MESSAGE_KEY, key)
            .auto_correlation_id()
            .source(SOURCE)
            .send_fire_and_forget()
    }
}
