//! Error types for broker, management API and gateway operations.

use thiserror::Error;

/// Failures of a single broker session operation.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Failed to connect after {attempts} attempts")]
    ConnectExhausted { attempts: u32 },

    #[error("Delivery tag {tag} belongs to connection generation {generation}, current is {current}")]
    StaleDelivery {
        tag: u64,
        generation: u64,
        current: u64,
    },
}

impl BrokerError {
    /// Whether reconnecting and trying again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Amqp(_) | BrokerError::NotConnected)
    }
}

/// Failures talking to the management HTTP API.
#[derive(Error, Debug)]
pub enum ManagementError {
    #[error("Management API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid management API URL: {0}")]
    InvalidUrl(String),
}

/// Failures surfaced by `QueueGateway` to its callers.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Reconnection failed during {operation}")]
    ReconnectFailed { operation: &'static str },

    #[error("Message does not carry a delivery handle")]
    MissingDeliveryHandle,

    #[error("Failed to encode message body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Message from queue '{queue}' is not a JSON object: {source}")]
    Decode {
        queue: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Management(#[from] ManagementError),

    #[error("Invalid message count kind '{0}', expected ready, unacked or total")]
    InvalidCountKind(String),
}
