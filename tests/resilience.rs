//! Resilience tests: failing handlers, malformed traffic, broker outages
//! and shutdown under load.

use carrier::broker::{MemoryBroker, MemoryPool};
use carrier::{Carrier, CarrierConfig, CarrierError, Listener, Message, Payload, SessionState};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn setup(max_size: usize) -> (MemoryBroker, MemoryPool, Carrier) {
    let broker = MemoryBroker::new();
    let pool = MemoryPool::new(broker.clone(), max_size).unwrap();
    let carrier = Carrier::new(CarrierConfig::new("hops"), pool.clone()).unwrap();
    (broker, pool, carrier)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Payload {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("handler dropped")
}

#[tokio::test]
async fn test_failing_handler_does_not_stop_others() {
    let (_broker, _pool, carrier) = setup(4);
    let (tx, mut rx) = mpsc::unbounded_channel();

    carrier
        .register_listener(Listener::new("broken").on("ping", |_| anyhow::bail!("boom")))
        .unwrap();
    carrier
        .register_listener(Listener::new("panicky").on("ping", |_| panic!("handler panicked")))
        .unwrap();
    carrier
        .register_listener(Listener::new("healthy").on("ping", move |p| {
            tx.send(p.clone())?;
            Ok(())
        }))
        .unwrap();
    carrier.ready().await.unwrap();

    for n in 0..3 {
        carrier.try_send(&Message::new("ping", json!({ "n": n }))).await.unwrap();
    }
    for n in 0..3 {
        assert_eq!(recv(&mut rx).await["n"], n);
    }

    assert_eq!(carrier.state(), SessionState::Subscribed);
    carrier.close().await;
}

#[tokio::test]
async fn test_malformed_traffic_is_dropped() {
    let (broker, _pool, carrier) = setup(4);
    let (tx, mut rx) = mpsc::unbounded_channel();

    carrier
        .register_listener(Listener::new("l").on("ping", move |p| {
            tx.send(p.clone())?;
            Ok(())
        }))
        .unwrap();
    carrier.ready().await.unwrap();

    // Raw publishes bypass the encoder
    for garbage in [
        "no delimiter",
        "ping;not json",
        "ping;[1,2,3]",
        "ping;\"string\"",
        ";{}",
        "unrouted;{\"x\":1}",
        "",
    ] {
        broker.publish("hops", garbage).unwrap();
    }
    broker.publish("hops", r#"ping;{"ok":true}"#).unwrap();

    let payload = recv(&mut rx).await;
    assert_eq!(payload["ok"], true);
    assert!(rx.try_recv().is_err());
    assert_eq!(carrier.state(), SessionState::Subscribed);

    carrier.close().await;
}

#[tokio::test]
async fn test_register_while_receiving() {
    let (_broker, _pool, carrier) = setup(4);
    let (marker_tx, mut marker_rx) = mpsc::unbounded_channel();
    carrier
        .register_listener(Listener::new("marker").on("marker", move |p| {
            marker_tx.send(p.clone())?;
            Ok(())
        }))
        .unwrap();
    carrier.ready().await.unwrap();

    // Nobody listens for "late" yet; the marker proves it was consumed
    carrier.try_send(&Message::new("late", json!({}))).await.unwrap();
    carrier.try_send(&Message::new("marker", json!({}))).await.unwrap();
    recv(&mut marker_rx).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    carrier
        .register_listener(Listener::new("late").on("late", move |p| {
            tx.send(p.clone())?;
            Ok(())
        }))
        .unwrap();

    carrier.try_send(&Message::new("late", json!({"n": 2}))).await.unwrap();

    assert_eq!(recv(&mut rx).await["n"], 2);
    assert!(rx.try_recv().is_err());

    carrier.close().await;
}

#[tokio::test]
async fn test_publish_failure_reaches_error_handler() {
    let (broker, pool, carrier) = setup(4);
    carrier.ready().await.unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let on_error = move |e: &CarrierError| sink.lock().push(e.to_string());

    // No idle connection exists yet, so the send has to open one
    broker.set_offline(true);
    carrier
        .send_with(&Message::new("ping", json!({})), &on_error)
        .await;
    broker.set_offline(false);

    assert_eq!(errors.lock().len(), 1);
    assert_eq!(pool.in_use(), 1);

    carrier.close().await;
}

#[tokio::test]
async fn test_pool_closed_after_start() {
    let (_broker, pool, carrier) = setup(4);
    carrier.ready().await.unwrap();

    pool.close();

    let err = carrier
        .try_send(&Message::new("ping", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, CarrierError::Broker(_)));

    // The default send swallows the failure
    carrier.send(&Message::new("ping", json!({}))).await;

    carrier.close().await;
}

#[tokio::test]
async fn test_broker_disconnect_closes_session() {
    let (broker, _pool, carrier) = setup(4);
    carrier.ready().await.unwrap();

    broker.disconnect_all();

    let mut state_rx = carrier.state_receiver();
    timeout(
        Duration::from_secs(1),
        state_rx.wait_for(|s| *s == SessionState::Closed),
    )
    .await
    .unwrap()
    .unwrap();

    // Publishing still works through fresh connections
    assert!(carrier.try_send(&Message::new("ping", json!({}))).await.is_ok());
    carrier.close().await;
}

#[tokio::test]
async fn test_concurrent_senders() {
    let (_broker, pool, carrier) = setup(8);
    let received = Arc::new(AtomicUsize::new(0));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

    let counter = received.clone();
    carrier
        .register_listener(Listener::new("counter").on("tick", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 100 {
                done_tx.send(())?;
            }
            Ok(())
        }))
        .unwrap();
    carrier.ready().await.unwrap();

    let mut tasks = Vec::new();
    for worker in 0..10 {
        let carrier = carrier.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..10 {
                carrier
                    .try_send(&Message::new("tick", json!({ "worker": worker, "n": n })))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.load(Ordering::SeqCst), 100);
    assert!(pool.size() <= 8);

    carrier.close().await;
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_gives_up_on_stuck_handler() {
    let broker = MemoryBroker::new();
    let pool = MemoryPool::new(broker, 4).unwrap();
    let config = CarrierConfig::new("hops").close_timeout(Duration::from_millis(50));
    let carrier = Carrier::new(config, pool).unwrap();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
    carrier
        .register_listener(Listener::new("slow").on("slow", move |_| {
            started_tx.send(())?;
            std::thread::sleep(Duration::from_millis(400));
            Ok(())
        }))
        .unwrap();
    carrier.ready().await.unwrap();

    carrier.try_send(&Message::new("slow", json!({}))).await.unwrap();
    timeout(Duration::from_secs(1), started_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let start = Instant::now();
    carrier.close().await;
    assert!(start.elapsed() < Duration::from_millis(300));
    assert_eq!(carrier.state(), SessionState::Closed);
    assert!(carrier.is_closed());

    // Once the handler returns, the session must not leave Closed again
    let mut state_rx = carrier.state_receiver();
    state_rx.borrow_and_update();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!state_rx.has_changed().unwrap());
    assert_eq!(carrier.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_closed_carrier_rejects_work() {
    let (_broker, pool, carrier) = setup(4);
    carrier.ready().await.unwrap();
    carrier.close().await;
    carrier.close().await;

    assert!(matches!(
        carrier.try_send(&Message::new("ping", json!({}))).await,
        Err(CarrierError::Closed)
    ));
    assert!(matches!(
        carrier.register_listener(Listener::new("l").on("ping", |_| Ok(()))),
        Err(CarrierError::Closed)
    ));
    assert_eq!(pool.in_use(), 0);
}
