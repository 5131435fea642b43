//! CLI command definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "carrier")]
#[command(about = "Publish/subscribe message bus over a broker channel", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Broker channel name
    #[arg(long, env = "CARRIER_CHANNEL", default_value = "carrier", global = true)]
    pub channel: String,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send messages through an in-process broker and print what arrives
    ///
    /// Examples:
    ///   carrier loopback ping '{"n": 1}'
    ///   carrier loopback --count 5 server.restart '{"reason": "update"}'
    Loopback {
        /// Message id
        id: String,

        /// JSON object payload
        #[arg(value_parser = parse_object, default_value = "{}")]
        data: serde_json::Value,

        /// Number of messages to send
        #[arg(short, long, default_value_t = 1)]
        count: u32,

        /// How long to wait for deliveries, in milliseconds
        #[arg(long, default_value_t = 500)]
        wait_ms: u64,
    },

    /// Print the wire form of a message
    Encode {
        /// Message id
        id: String,

        /// JSON object payload
        #[arg(value_parser = parse_object)]
        data: serde_json::Value,
    },

    /// Decode a wire string and print its parts
    Decode {
        /// Wire string, e.g. 'ping;{"n":1}'
        wire: String,
    },
}

fn parse_object(s: &str) -> Result<serde_json::Value, String> {
    match serde_json::from_str::<serde_json::Value>(s) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) => Err("payload must be a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}
