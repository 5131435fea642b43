//! In-process broker
//!
//! Channels are tokio broadcast senders keyed by exact channel name, so every
//! subscriber of a channel sees every message published to it while it is
//! subscribed. Connections are handed out by a deadpool managed pool.

use super::{async_trait, BrokerConnection, BrokerError, ChannelSubscription, ConnectionFactory, RawMessage};
use dashmap::DashMap;
use deadpool::managed::{self, Metrics, Object, Pool, PoolError, RecycleResult};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default per-channel buffer before slow subscribers start lagging
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

struct BrokerInner {
    channels: DashMap<Arc<str>, broadcast::Sender<RawMessage>>,
    capacity: usize,
    offline: AtomicBool,
    publish_count: AtomicUsize,
}

/// In-process pub/sub broker. Cheap to clone; clones share channels.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                channels: DashMap::new(),
                capacity: capacity.max(1),
                offline: AtomicBool::new(false),
                publish_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Publish a payload, returning the number of subscribers that got it
    pub fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        if self.is_offline() {
            return Err(BrokerError::ConnectionLost("broker offline".into()));
        }

        self.inner.publish_count.fetch_add(1, Ordering::Relaxed);

        let Some(tx) = self.inner.channels.get(channel).map(|e| e.value().clone()) else {
            debug!(channel = channel, "No subscribers for channel");
            return Ok(0);
        };

        match tx.send(RawMessage::new(channel, payload)) {
            Ok(count) => Ok(count),
            Err(_) => {
                // Every receiver is gone; drop the channel
                self.inner
                    .channels
                    .remove_if(channel, |_, tx| tx.receiver_count() == 0);
                Ok(0)
            }
        }
    }

    /// Open a receiver on a channel
    pub fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<RawMessage>, BrokerError> {
        if self.is_offline() {
            return Err(BrokerError::Subscribe("broker offline".into()));
        }

        let rx = self
            .inner
            .channels
            .entry(Arc::from(channel))
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe();

        Ok(rx)
    }

    /// Number of live receivers on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .map(|e| e.value().receiver_count())
            .unwrap_or(0)
    }

    /// Total number of publish calls that reached the broker
    pub fn publish_count(&self) -> usize {
        self.inner.publish_count.load(Ordering::Relaxed)
    }

    /// Take the broker offline (or back online). While offline, publish and
    /// subscribe fail.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// Drop every channel, ending all current subscriptions
    pub fn disconnect_all(&self) {
        self.inner.channels.clear();
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// A raw connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// deadpool manager creating [`MemoryConnection`]s
pub struct MemoryManager {
    broker: MemoryBroker,
    next_id: AtomicU64,
}

impl managed::Manager for MemoryManager {
    type Type = MemoryConnection;
    type Error = BrokerError;

    async fn create(&self) -> Result<MemoryConnection, BrokerError> {
        if self.broker.is_offline() {
            return Err(BrokerError::ConnectionLost("broker offline".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = id, "Opened broker connection");

        Ok(MemoryConnection {
            id,
            broker: self.broker.clone(),
        })
    }

    async fn recycle(&self, _conn: &mut MemoryConnection, _: &Metrics) -> RecycleResult<BrokerError> {
        Ok(())
    }
}

/// Connection pool over a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryPool {
    pool: Pool<MemoryManager>,
}

impl MemoryPool {
    /// Create a pool holding at most `max_size` connections
    pub fn new(broker: MemoryBroker, max_size: usize) -> Result<Self, BrokerError> {
        let manager = MemoryManager {
            broker,
            next_id: AtomicU64::new(1),
        };

        let pool = Pool::builder(manager)
            .max_size(max_size)
            .build()
            .map_err(|e| BrokerError::Pool(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Close the pool. Checked-out connections stay usable; further
    /// acquisitions fail.
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Number of connections currently checked out
    pub fn in_use(&self) -> usize {
        let status = self.pool.status();
        status.size.saturating_sub(status.available)
    }

    /// Number of connections the pool has open, idle or not
    pub fn size(&self) -> usize {
        self.pool.status().size
    }
}

#[async_trait]
impl ConnectionFactory for MemoryPool {
    async fn acquire(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let conn = self.pool.get().await.map_err(|e| match e {
            PoolError::Closed => BrokerError::PoolClosed,
            PoolError::Backend(e) => e,
            other => BrokerError::Pool(other.to_string()),
        })?;

        Ok(Box::new(PooledConnection { conn }))
    }
}

/// A connection checked out of a [`MemoryPool`]; returns to it on drop
struct PooledConnection {
    conn: Object<MemoryManager>,
}

#[async_trait]
impl BrokerConnection for PooledConnection {
    async fn publish(&mut self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        self.conn.broker.publish(channel, payload)
    }

    async fn subscribe(
        self: Box<Self>,
        channel: &str,
    ) -> Result<Box<dyn ChannelSubscription>, BrokerError> {
        let rx = self.conn.broker.subscribe(channel)?;
        debug!(connection_id = self.conn.id, channel = channel, "Subscribed");

        Ok(Box::new(MemorySubscription {
            conn: self.conn,
            channel: channel.to_string(),
            rx: Some(rx),
        }))
    }
}

/// Subscription on a [`MemoryBroker`] channel
struct MemorySubscription {
    // Held so the connection stays checked out for the subscription's lifetime
    conn: Object<MemoryManager>,
    channel: String,
    rx: Option<broadcast::Receiver<RawMessage>>,
}

#[async_trait]
impl ChannelSubscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<RawMessage> {
        loop {
            let rx = self.rx.as_mut()?;

            match rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        channel = %self.channel,
                        skipped = skipped,
                        "Subscriber lagged, messages dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(channel = %self.channel, "Channel closed by broker");
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), BrokerError> {
        if self.rx.take().is_some() {
            debug!(connection_id = self.conn.id, channel = %self.channel, "Unsubscribed");
        }
        Ok(())
    }

    fn is_subscribed(&self) -> bool {
        self.rx.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.publish("hops", "ping;{}").unwrap(), 0);
        assert_eq!(broker.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_fan_out() {
        let broker = MemoryBroker::new();
        let mut rx1 = broker.subscribe("hops").unwrap();
        let mut rx2 = broker.subscribe("hops").unwrap();

        assert_eq!(broker.subscriber_count("hops"), 2);
        assert_eq!(broker.publish("hops", "ping;{}").unwrap(), 2);

        assert_eq!(rx1.recv().await.unwrap(), RawMessage::new("hops", "ping;{}"));
        assert_eq!(rx2.recv().await.unwrap(), RawMessage::new("hops", "ping;{}"));
    }

    #[tokio::test]
    async fn test_channels_are_exact() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe("hops").unwrap();

        assert_eq!(broker.publish("other", "ping;{}").unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_offline_broker() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);

        assert!(matches!(
            broker.publish("hops", "x;{}"),
            Err(BrokerError::ConnectionLost(_))
        ));
        assert!(matches!(
            broker.subscribe("hops"),
            Err(BrokerError::Subscribe(_))
        ));

        broker.set_offline(false);
        assert!(broker.publish("hops", "x;{}").is_ok());
    }

    #[tokio::test]
    async fn test_pool_checkout_and_return() {
        let pool = MemoryPool::new(MemoryBroker::new(), 4).unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        drop(b);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_pool_closed() {
        let pool = MemoryPool::new(MemoryBroker::new(), 1).unwrap();
        pool.close();

        assert!(pool.is_closed());
        assert!(matches!(
            pool.acquire().await.err(),
            Some(BrokerError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_subscription_holds_connection() {
        let broker = MemoryBroker::new();
        let pool = MemoryPool::new(broker.clone(), 2).unwrap();

        let conn = pool.acquire().await.unwrap();
        let mut sub = conn.subscribe("hops").await.unwrap();
        assert!(sub.is_subscribed());
        assert_eq!(pool.in_use(), 1);

        let mut publisher = pool.acquire().await.unwrap();
        assert_eq!(publisher.publish("hops", "ping;{}").await.unwrap(), 1);
        drop(publisher);

        let msg = sub.next_message().await.unwrap();
        assert_eq!(msg.payload, "ping;{}");

        sub.unsubscribe().await.unwrap();
        assert!(!sub.is_subscribed());
        assert!(sub.next_message().await.is_none());

        drop(sub);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_all_ends_subscriptions() {
        let broker = MemoryBroker::new();
        let pool = MemoryPool::new(broker.clone(), 1).unwrap();

        let mut sub = pool.acquire().await.unwrap().subscribe("hops").await.unwrap();
        broker.disconnect_all();

        assert!(sub.next_message().await.is_none());
        assert!(!sub.is_subscribed());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let broker = MemoryBroker::with_capacity(2);
        let pool = MemoryPool::new(broker.clone(), 1).unwrap();
        let mut sub = pool.acquire().await.unwrap().subscribe("hops").await.unwrap();

        for i in 0..5 {
            broker.publish("hops", &format!("n;{{\"i\":{}}}", i)).unwrap();
        }

        // Oldest messages were overwritten; the newest are still delivered
        let msg = sub.next_message().await.unwrap();
        assert_eq!(msg.payload, "n;{\"i\":3}");
        let msg = sub.next_message().await.unwrap();
        assert_eq!(msg.payload, "n;{\"i\":4}");
    }
}
