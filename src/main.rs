//! Carrier CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use carrier::broker::{MemoryBroker, MemoryPool};
use carrier::{envelope, Carrier, CarrierConfig, Listener, Message};
use clap::Parser;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Loopback { id, data, count, wait_ms } => {
            loopback(cli.channel, id, data, count, Duration::from_millis(wait_ms)).await
        }
        Commands::Encode { id, data } => encode(&id, &data),
        Commands::Decode { wire } => decode(&wire),
    }
}

async fn loopback(
    channel: String,
    id: String,
    data: serde_json::Value,
    count: u32,
    wait: Duration,
) -> Result<()> {
    let broker = MemoryBroker::new();
    let pool = MemoryPool::new(broker, 4).context("Failed to create connection pool")?;
    let carrier = Carrier::new(CarrierConfig::new(channel), pool)?;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    carrier.register_listener(Listener::new("cli").on(id.clone(), move |payload| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        println!("#{} {}", n, serde_json::to_string(payload)?);
        Ok(())
    }))?;

    carrier.ready().await.context("Subscription did not start")?;

    let message = Message::new(id, data);
    for _ in 0..count {
        carrier.try_send(&message).await.context("Failed to send")?;
    }

    tokio::time::sleep(wait).await;
    carrier.close().await;

    let received = received.load(Ordering::SeqCst);
    info!(sent = count, received = received, "Loopback finished");
    if received < count as usize {
        anyhow::bail!("only {} of {} messages arrived", received, count);
    }

    Ok(())
}

fn encode(id: &str, data: &serde_json::Value) -> Result<()> {
    let wire = envelope::encode(id, data)?;
    println!("{}", wire);
    Ok(())
}

fn decode(wire: &str) -> Result<()> {
    let envelope = envelope::decode(wire)?;
    println!("id: {}", envelope.id);
    println!(
        "payload: {}",
        serde_json::to_string_pretty(&envelope.payload)?
    );
    Ok(())
}
