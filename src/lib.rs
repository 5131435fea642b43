//! Carrier - publish/subscribe message bus over a shared broker channel
//!
//! Components publish identified JSON messages onto one named broker channel;
//! every carrier subscribed to that channel routes them to the handlers
//! registered for the message id.
//!
//! # Example
//!
//! ```no_run
//! use carrier::broker::{MemoryBroker, MemoryPool};
//! use carrier::{Carrier, CarrierConfig, Listener, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = MemoryPool::new(MemoryBroker::new(), 8)?;
//!     let carrier = Carrier::new(CarrierConfig::new("hops"), pool)?;
//!
//!     carrier.register_listener(Listener::new("presence").on("ping", |payload| {
//!         println!("ping: {:?}", payload);
//!         Ok(())
//!     }))?;
//!
//!     carrier.ready().await?;
//!     carrier.send(&Message::new("ping", serde_json::json!({"n": 1}))).await;
//!
//!     carrier.close().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
mod bus;
mod config;
pub mod envelope;
mod error;
mod publisher;
mod router;
pub mod session;

pub use bus::Carrier;
pub use config::CarrierConfig;
pub use envelope::{Envelope, EnvelopeError, Message, Payload};
pub use error::{CarrierError, Result};
pub use publisher::{LogErrors, PublishErrorHandler, Publisher};
pub use router::{DispatchReport, Listener, MessageHandler, Router};
pub use session::{Delivery, SessionState, SubscriptionSession};
