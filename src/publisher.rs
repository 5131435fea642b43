//! Publishing messages onto the carrier channel

use crate::broker::ConnectionFactory;
use crate::envelope::Message;
use crate::error::{CarrierError, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives publish failures instead of the caller
pub trait PublishErrorHandler: Send + Sync {
    fn on_error(&self, error: &CarrierError);
}

impl<F> PublishErrorHandler for F
where
    F: Fn(&CarrierError) + Send + Sync,
{
    fn on_error(&self, error: &CarrierError) {
        self(error)
    }
}

/// Default policy: log the failure and carry on
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrors;

impl PublishErrorHandler for LogErrors {
    fn on_error(&self, error: &CarrierError) {
        warn!(error = %error, "Failed to publish message");
    }
}

/// Encodes messages and publishes them on one channel
pub struct Publisher {
    channel: String,
    factory: Arc<dyn ConnectionFactory>,
}

impl Publisher {
    pub fn new(channel: impl Into<String>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            channel: channel.into(),
            factory,
        }
    }

    /// Publish a message, returning how many subscribers the broker reached.
    ///
    /// The connection goes back to the pool whether or not this succeeds.
    pub async fn try_send<T>(&self, message: &Message<T>) -> Result<usize>
    where
        T: Serialize + Sync,
    {
        let wire = message.encode()?;

        let mut conn = self.factory.acquire().await?;
        let receivers = conn.publish(&self.channel, &wire).await?;

        debug!(
            channel = %self.channel,
            message_id = message.id(),
            receivers = receivers,
            "Published message"
        );

        Ok(receivers)
    }

    /// Publish a message, routing any failure to `handler`
    pub async fn send_with<T, H>(&self, message: &Message<T>, handler: &H)
    where
        T: Serialize + Sync,
        H: PublishErrorHandler + ?Sized,
    {
        if let Err(e) = self.try_send(message).await {
            handler.on_error(&e);
        }
    }

    /// Publish a message, logging any failure
    pub async fn send<T>(&self, message: &Message<T>)
    where
        T: Serialize + Sync,
    {
        self.send_with(message, &LogErrors).await
    }
}
