//! The carrier: one channel, one subscription, many listeners

use crate::broker::ConnectionFactory;
use crate::config::CarrierConfig;
use crate::envelope::Message;
use crate::error::{CarrierError, Result};
use crate::publisher::{LogErrors, PublishErrorHandler, Publisher};
use crate::router::{Listener, Router};
use crate::session::{SessionState, SubscriptionSession};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

struct CarrierInner {
    config: CarrierConfig,
    router: Arc<Router>,
    publisher: Publisher,
    session: SubscriptionSession,
    closed: AtomicBool,
}

/// Publish/subscribe bus over a single broker channel
///
/// Construction subscribes to the channel right away, on a background task.
/// Messages published by any carrier on the same channel, this one included,
/// are routed to the handlers registered here.
///
/// This struct is cheaply cloneable as it uses an internal Arc. When the last
/// clone is dropped the subscription shuts down.
#[derive(Clone)]
pub struct Carrier {
    inner: Arc<CarrierInner>,
}

impl Carrier {
    /// Create a carrier and start its subscription session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: CarrierConfig, factory: impl ConnectionFactory) -> Result<Self> {
        Self::with_shared_factory(config, Arc::new(factory))
    }

    /// Like [`Carrier::new`], for a factory shared with other carriers
    pub fn with_shared_factory(
        config: CarrierConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let router = Arc::new(Router::new());
        let publisher = Publisher::new(config.channel.clone(), factory.clone());
        let session = SubscriptionSession::start(config.channel.clone(), factory, router.clone())?;

        info!(channel = %config.channel, "Carrier started");

        Ok(Self {
            inner: Arc::new(CarrierInner {
                config,
                router,
                publisher,
                session,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The channel this carrier publishes to and subscribes on
    pub fn channel(&self) -> &str {
        &self.inner.config.channel
    }

    /// Get the current subscription state
    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    /// Get a receiver for subscription state changes
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.inner.session.state_receiver()
    }

    /// Wait until the subscription is live
    pub async fn ready(&self) -> Result<()> {
        self.inner.session.ready().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Register a listener's handlers.
    ///
    /// Fails with [`CarrierError::Configuration`] if a message id contains the
    /// envelope delimiter, in which case none of its handlers are registered.
    pub fn register_listener(&self, listener: Listener) -> Result<usize> {
        if self.is_closed() {
            return Err(CarrierError::Closed);
        }

        let name = listener.name().to_string();
        let count = self.inner.router.register(listener)?;
        debug!(channel = %self.channel(), listener = %name, handlers = count, "Listener registered");
        Ok(count)
    }

    /// Number of handlers registered for a message id
    pub fn handler_count(&self, message_id: &str) -> usize {
        self.inner.router.handler_count(message_id)
    }

    /// Publish a message, returning how many subscribers the broker reached
    pub async fn try_send<T>(&self, message: &Message<T>) -> Result<usize>
    where
        T: Serialize + Sync,
    {
        if self.is_closed() {
            return Err(CarrierError::Closed);
        }
        self.inner.publisher.try_send(message).await
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

    /// Unsubscribe and release the subscription's connection.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!(channel = %self.channel(), "Closing carrier");
        }
        self.inner
            .session
            .close(self.inner.config.close_timeout)
            .await;
    }
}
