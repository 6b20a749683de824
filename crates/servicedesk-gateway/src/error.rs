use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("communication with {destination} failed: {reason}")]
    Communication { destination: String, reason: String },

    #[error("request to {destination} timed out after {timeout_ms}ms")]
    Timeout { destination: String, timeout_ms: u64 },

    #[error("circuit breaker for {gateway} is OPEN, request rejected")]
    CircuitOpen { gateway: String },

    #[error("all {attempts} attempts failed")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<GatewayError>,
    },

    #[error("retry loop interrupted after {attempts} attempts")]
    Interrupted {
        attempts: u32,
        #[source]
        source: Box<GatewayError>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Builds a [`GatewayError::Communication`] for `destination`.
    pub fn communication(destination: impl Into<String>, reason: impl ToString) -> Self {
        GatewayError::Communication {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    /// Transport-level failure of a single attempt, timeouts included.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            GatewayError::Communication { .. } | GatewayError::Timeout { .. }
        )
    }

    /// The root transport failure behind retry wrappers.
    pub fn last_cause(&self) -> &GatewayError {
        match self {
            GatewayError::RetryExhausted { source, .. } | GatewayError::Interrupted { source, .. } => {
                source.last_cause()
            }
            other => other,
        }
    }
}

/// Returns true for errors that a retry could plausibly fix.
///
/// Configuration and serialization failures are deterministic and fail immediately.
pub fn is_retryable(error: &GatewayError) -> bool {
    match error {
        GatewayError::Communication { .. } => true,
        GatewayError::Timeout { .. } => true,
        GatewayError::RetryExhausted { .. } => true,
        GatewayError::Interrupted { .. } => true,
        GatewayError::CircuitOpen { .. } => true,
        GatewayError::Configuration(_) => false,
        GatewayError::Serialization(_) => false,
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
