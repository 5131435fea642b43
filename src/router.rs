//! Message-id routing and handler fan-out

use crate::envelope::{self, Payload};
use crate::error::{CarrierError, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handler for incoming messages with a given id
pub type MessageHandler = Arc<dyn Fn(&Payload) -> anyhow::Result<()> + Send + Sync>;

/// A named set of handlers, registered together
///
/// ```
/// use carrier::Listener;
///
/// let listener = Listener::new("presence")
///     .on("ping", |payload| {
///         println!("ping {:?}", payload.get("n"));
///         Ok(())
///     })
///     .on("pong", |_| Ok(()));
///
/// assert_eq!(listener.len(), 2);
/// ```
pub struct Listener {
    id: Uuid,
    name: String,
    handlers: Vec<(String, MessageHandler)>,
}

impl Listener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    /// Handle messages with `message_id`, receiving the raw JSON object
    pub fn on<F>(mut self, message_id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((message_id.into(), Arc::new(handler)));
        self
    }

    /// Handle messages with `message_id`, deserializing the payload into `T`
    /// first. A payload that does not fit `T` counts as a handler failure.
    pub fn on_typed<T, F>(self, message_id: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(message_id, move |payload: &Payload| {
            let data: T = serde_json::from_value(serde_json::Value::Object(payload.clone()))?;
            handler(data)
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of handlers in this listener
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Message ids this listener handles, in declaration order
    pub fn message_ids(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|(id, _)| id.as_str())
    }

    fn validate(&self) -> Result<()> {
        for (message_id, _) in &self.handlers {
            if envelope::validate_id(message_id).is_err() {
                return Err(CarrierError::Configuration(format!(
                    "listener '{}': message id '{}' contains '{}'",
                    self.name,
                    message_id,
                    envelope::DELIMITER
                )));
            }
        }

        Ok(())
    }
}

/// One handler bound to one message id
struct Registration {
    listener_id: Uuid,
    listener: Arc<str>,
    handler: MessageHandler,
}

type Routes = HashMap<String, Vec<Arc<Registration>>>;

/// Outcome of dispatching one message
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Handlers invoked, including the ones that failed
    pub invoked: usize,
    /// One entry per failed handler, in invocation order
    pub failures: Vec<CarrierError>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.invoked - self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Routes decoded messages to registered handlers by message id
///
/// The route table is copy-on-write: registration swaps in a new table, and
/// dispatch works on the snapshot it started with without holding the lock.
#[derive(Default)]
pub struct Router {
    routes: RwLock<Arc<Routes>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every handler of a listener, returning how many were added.
    ///
    /// Either all of the listener's handlers become visible at once or, on a
    /// configuration error, none do.
    pub fn register(&self, listener: Listener) -> Result<usize> {
        listener.validate()?;

        let name: Arc<str> = Arc::from(listener.name.as_str());
        let count = listener.handlers.len();

        let mut routes = self.routes.write();
        let mut next: Routes = (**routes).clone();

        for (message_id, handler) in listener.handlers {
            debug!(listener = %name, message_id = %message_id, "Registering handler");
            next.entry(message_id).or_default().push(Arc::new(Registration {
                listener_id: listener.id,
                listener: name.clone(),
                handler,
            }));
        }

        *routes = Arc::new(next);
        Ok(count)
    }

    /// Invoke every handler registered for `message_id`, in registration order
    pub fn dispatch(&self, message_id: &str, payload: &Payload) -> DispatchReport {
        let routes = self.routes.read().clone();
        let mut report = DispatchReport::default();

        let Some(registrations) = routes.get(message_id) else {
            debug!(message_id = message_id, "No handlers for message");
            return report;
        };

        for registration in registrations {
            report.invoked += 1;

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (registration.handler)(payload)));

            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => format!("panicked: {}", panic_message(&*panic)),
            };

            warn!(
                listener = %registration.listener,
                listener_id = %registration.listener_id,
                message_id = message_id,
                error = %reason,
                "Handler failed"
            );

            report.failures.push(CarrierError::Handler {
                listener: registration.listener.to_string(),
                message_id: message_id.to_string(),
                reason,
            });
        }

        report
    }

    /// Whether any handler is registered for `message_id`
    pub fn is_routed(&self, message_id: &str) -> bool {
        self.routes.read().contains_key(message_id)
    }

    /// Number of handlers registered for `message_id`
    pub fn handler_count(&self, message_id: &str) -> usize {
        self.routes
            .read()
            .get(message_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// All message ids with at least one handler
    pub fn message_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
