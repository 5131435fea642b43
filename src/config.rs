//! Configuration for a Carrier

use crate::error::{CarrierError, Result};
use std::time::Duration;

/// Configuration for a Carrier bound to one broker channel
#[derive(Debug, Clone)]
pub struct CarrierConfig {
    /// Broker channel to publish to and subscribe on
    pub channel: String,

    /// How long `close` waits for the subscription session to wind down
    pub close_timeout: Duration,
}

impl CarrierConfig {
    /// Create a new configuration for the given channel
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            close_timeout: Duration::from_secs(5),
        }
    }

    /// Set the close timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Check the configuration before a session is started
    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(CarrierError::Configuration(
                "channel name cannot be empty".into(),
            ));
        }

        Ok(())
    }
}
