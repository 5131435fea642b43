//! Error types for Carrier

use crate::broker::BrokerError;
use crate::envelope::EnvelopeError;
use thiserror::Error;

/// Errors that can occur when using a Carrier
#[derive(Error, Debug)]
pub enum CarrierError {
    /// Invalid listener or configuration, detected before any traffic flows
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Failed to encode or decode a wire envelope
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// The broker collaborator failed
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A registered handler returned an error or panicked
    #[error("Handler '{listener}' failed for message '{message_id}': {reason}")]
    Handler {
        listener: String,
        message_id: String,
        reason: String,
    },

    /// The subscription session could not be established
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// The carrier has been closed
    #[error("Carrier closed")]
    Closed,

    /// No tokio runtime is available to run the subscription session
    #[error("No tokio runtime available")]
    NoRuntime,
}

/// Result type for Carrier operations
pub type Result<T> = std::result::Result<T, CarrierError>;
