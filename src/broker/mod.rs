//! Broker collaborator contract
//!
//! Carrier does not talk to any particular broker. It consumes a
//! [`ConnectionFactory`] that hands out pooled connections; a connection
//! either publishes strings to a channel or turns into a long-lived
//! [`ChannelSubscription`].
//!
//! - Memory: in-process broker for tests, demos and single-process setups

pub mod memory;

pub use memory::{MemoryBroker, MemoryConnection, MemoryPool};

pub use async_trait::async_trait;
use thiserror::Error;

/// Broker errors
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("pool error: {0}")]
    Pool(String),

    #[error("pool is closed")]
    PoolClosed,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// A raw message pushed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Channel the message was published on
    pub channel: String,
    /// Undecoded wire string
    pub payload: String,
}

impl RawMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Source of broker connections.
///
/// Implementations are expected to pool connections and to support
/// concurrent, independent checkouts. A connection goes back to the pool
/// when it is dropped.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Check out a connection
    async fn acquire(&self) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// A checked-out broker connection
#[async_trait]
pub trait BrokerConnection: Send {
    /// Publish a payload to a channel, returning how many subscribers got it
    async fn publish(&mut self, channel: &str, payload: &str) -> Result<usize, BrokerError>;

    /// Turn this connection into a subscription on `channel`.
    ///
    /// The subscription keeps the connection checked out until it is dropped.
    async fn subscribe(
        self: Box<Self>,
        channel: &str,
    ) -> Result<Box<dyn ChannelSubscription>, BrokerError>;
}

/// A live subscription on one channel
#[async_trait]
pub trait ChannelSubscription: Send {
    /// Wait for the next message. `None` means the broker ended the
    /// subscription (unsubscribed or connection gone).
    async fn next_message(&mut self) -> Option<RawMessage>;

    /// Stop receiving messages
    async fn unsubscribe(&mut self) -> Result<(), BrokerError>;

    /// Whether the subscription is still active
    fn is_subscribed(&self) -> bool;
}
