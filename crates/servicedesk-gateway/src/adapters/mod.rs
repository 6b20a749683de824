//! Reference transport adapters.
//!
//! Each adapter implements the full [`MessageGateway`](crate::gateway::MessageGateway)
//! contract over an injected client trait, so no network stack is linked here.

pub mod broker;
pub mod rest;

pub use broker::{BrokerGateway, BrokerOptions, BrokerProducer, BrokerRecord};
pub use rest::{HttpClient, RestGateway, RestOptions};

use thiserror::Error;

/// Failure reported by an injected transport client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportFault {
    /// The remote could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The remote answered with a non-success status.
    #[error("remote returned status {status}: {body}")]
    Status {
        /// HTTP or broker status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The broker refused the record.
    #[error("record rejected: {0}")]
    Rejected(String),
}
