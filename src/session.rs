//! Subscription session
//!
//! A session owns one broker subscription on the configured channel. It runs
//! on its own tokio task, filters messages by channel, decodes envelopes and
//! hands them to the [`Router`]. Handlers run on that task, one message at a
//! time, so a slow handler delays the messages behind it.

use crate::broker::{BrokerError, ChannelSubscription, ConnectionFactory, RawMessage};
use crate::envelope::{self, EnvelopeError};
use crate::error::{CarrierError, Result};
use crate::router::{DispatchReport, Router};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of a subscription session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started
    Idle,
    /// Acquiring a connection and subscribing
    Subscribing,
    /// Receiving messages
    Subscribed,
    /// Shutting down the subscription
    Unsubscribing,
    /// Finished; the connection has been released
    Closed,
}

/// Whether a message published on `incoming` belongs to `configured`.
/// Channel names compare case-insensitively.
pub fn channel_matches(configured: &str, incoming: &str) -> bool {
    if configured.is_ascii() && incoming.is_ascii() {
        return configured.eq_ignore_ascii_case(incoming);
    }
    // Per character, so context rules like final sigma do not apply
    configured
        .chars()
        .flat_map(char::to_lowercase)
        .eq(incoming.chars().flat_map(char::to_lowercase))
}

/// What happened to one raw message
#[derive(Debug)]
pub enum Delivery {
    /// Published on another channel; not decoded
    Ignored,
    /// Could not be decoded; dropped
    Malformed(EnvelopeError),
    /// No handler registered for the message id; dropped
    Unrouted,
    /// Handed to the router
    Dispatched(DispatchReport),
}

/// Filters, decodes and routes raw broker messages for one channel
pub struct Inbound {
    channel: String,
    router: Arc<Router>,
}

impl Inbound {
    pub fn new(channel: impl Into<String>, router: Arc<Router>) -> Self {
        Self {
            channel: channel.into(),
            router,
        }
    }

    /// Process one raw message
    pub fn deliver(&self, raw: &RawMessage) -> Delivery {
        if !channel_matches(&self.channel, &raw.channel) {
            debug!(
                channel = %self.channel,
                incoming = %raw.channel,
                "Ignoring message from another channel"
            );
            return Delivery::Ignored;
        }

        let (message_id, body) = match envelope::split(&raw.payload) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "Dropping message");
                return Delivery::Malformed(e);
            }
        };

        // Only parse bodies somebody is going to read
        if !self.router.is_routed(message_id) {
            debug!(message_id = message_id, "No handlers for message");
            return Delivery::Unrouted;
        }

        let payload = match envelope::parse_payload(body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    channel = %self.channel,
                    message_id = message_id,
                    error = %e,
                    "Dropping message"
                );
                return Delivery::Malformed(e);
            }
        };

        Delivery::Dispatched(self.router.dispatch(message_id, &payload))
    }
}

/// A running subscription on one broker channel
pub struct SubscriptionSession {
    channel: String,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    failure: Arc<Mutex<Option<BrokerError>>>,
}

impl SubscriptionSession {
    /// Start subscribing on `channel` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        channel: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        router: Arc<Router>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CarrierError::NoRuntime)?;
        let channel = channel.into();

        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let state_tx = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let failure = Arc::new(Mutex::new(None));

        state_tx.send_replace(SessionState::Subscribing);

        let task = runtime.spawn(run_session(
            channel.clone(),
            factory,
            Inbound::new(channel.clone(), router),
            state_tx.clone(),
            shutdown_rx,
            failure.clone(),
        ));

        Ok(Self {
            channel,
            state_tx,
            state_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
            failure,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Get a receiver for session state changes
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait until the session is subscribed.
    ///
    /// Fails if the session closed before subscribing, or has closed since.
    pub async fn ready(&self) -> Result<()> {
        let mut state_rx = self.state_rx.clone();
        let state = *state_rx
            .wait_for(|s| !matches!(s, SessionState::Idle | SessionState::Subscribing))
            .await
            .map_err(|_| CarrierError::Closed)?;

        match state {
            SessionState::Subscribed => Ok(()),
            _ => match self.failure.lock().clone() {
                Some(e) => Err(CarrierError::SubscribeFailed(e.to_string())),
                None => Err(CarrierError::Closed),
            },
        }
    }

    /// Stop the session and release its connection.
    ///
    /// Idempotent. Waits up to `timeout` for the session task, then aborts it.
    pub async fn close(&self, timeout: Duration) {
        self.shutdown.send_replace(true);

        let task = self.task.lock().take();
        match task {
            Some(task) => {
                let abort = task.abort_handle();
                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(channel = %self.channel, error = %e, "Session task failed"),
                    Err(_) => {
                        warn!(
                            channel = %self.channel,
                            timeout = ?timeout,
                            "Session did not stop in time, aborting"
                        );
                        abort.abort();
                    }
                }

                advance(&self.state_tx, SessionState::Closed);
            }
            None => {
                // Closed already, or another caller is closing it
                let mut state_rx = self.state_rx.clone();
                let _ = tokio::time::timeout(
                    timeout,
                    state_rx.wait_for(|s| *s == SessionState::Closed),
                )
                .await;
            }
        }
    }
}

/// Move to `next` unless the session is already `Closed`, which is final
fn advance(state: &watch::Sender<SessionState>, next: SessionState) {
    state.send_if_modified(|current| {
        if *current == SessionState::Closed || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

async fn open_subscription(
    factory: &dyn ConnectionFactory,
    channel: &str,
) -> std::result::Result<Box<dyn ChannelSubscription>, BrokerError> {
    let conn = factory.acquire().await?;
    conn.subscribe(channel).await
}

async fn run_session(
    channel: String,
    factory: Arc<dyn ConnectionFactory>,
    inbound: Inbound,
    state: Arc<watch::Sender<SessionState>>,
    mut shutdown: watch::Receiver<bool>,
    failure: Arc<Mutex<Option<BrokerError>>>,
) {
    let opened = tokio::select! {
        biased;
        _ = shutdown.wait_for(|stop| *stop) => {
            debug!(channel = %channel, "Session closed before subscribing");
            advance(&state, SessionState::Closed);
            return;
        }
        opened = open_subscription(&*factory, &channel) => opened,
    };

    let mut subscription = match opened {
        Ok(subscription) => subscription,
        Err(e) => {
            error!(channel = %channel, error = %e, "Failed to subscribe");
            *failure.lock() = Some(e);
            advance(&state, SessionState::Closed);
            return;
        }
    };

    advance(&state, SessionState::Subscribed);
    info!(channel = %channel, "Subscribed");

    loop {
        tokio::select! {
            // A dropped sender means the owning carrier is gone
            _ = shutdown.wait_for(|stop| *stop) => break,

            msg = subscription.next_message() => match msg {
                Some(raw) => {
                    inbound.deliver(&raw);
                }
                None => {
                    warn!(channel = %channel, "Subscription ended by broker");
                    break;
                }
            },
        }
    }

    advance(&state, SessionState::Unsubscribing);

    if subscription.is_subscribed() {
        if let Err(e) = subscription.unsubscribe().await {
            warn!(channel = %channel, error = %e, "Failed to unsubscribe");
        }
    }

    // Returns the connection to its pool
    drop(subscription);

    advance(&state, SessionState::Closed);
    info!(channel = %channel, "Session closed");
}
