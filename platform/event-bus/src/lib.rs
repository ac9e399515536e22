//! # EventBus Abstraction
//!
//! Broker-facing messaging layer shared by every service in the workspace.
//! Services depend on the [`EventBus`] trait only, so the transport can be
//! swapped by configuration:
//!
//! - **NatsBus**: production implementation on top of `async-nats`
//! - **InMemoryBus**: dev/test implementation using broadcast channels
//!
//! The crate also owns the cross-service [`EventEnvelope`] contract and the
//! jittered backoff policy consumers use when a delivery has to be retried.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{BusMessage, EventBus, InMemoryBus, ATTEMPT_HEADER};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = InMemoryBus::new();
//! let mut stream = bus.subscribe("payment.to.learning.*").await?;
//!
//! let msg = BusMessage::new("payment.to.learning.payment_completed".to_string(), b"{}".to_vec())
//!     .with_header(ATTEMPT_HEADER, "2");
//! bus.publish_message(msg).await?;
//!
//! while let Some(msg) = futures::StreamExt::next(&mut stream).await {
//!     println!("attempt {} on {}", msg.delivery_attempt(), msg.subject);
//! }
//! # Ok(())
//! # }
//! ```

pub mod consumer_retry;
mod envelope;
mod inmemory_bus;
mod nats_bus;

pub use consumer_retry::{backoff_delay, RetryConfig};
pub use envelope::{validate_envelope_fields, EventEnvelope};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// Header carrying the 1-based delivery attempt of a message.
pub const ATTEMPT_HEADER: &str = "x-delivery-attempt";

/// A message received from (or handed to) the event bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The subject/topic this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Transport headers (delivery attempt, tracing ids)
    pub headers: Option<HashMap<String, String>>,
    /// Optional reply-to subject (for request-response patterns)
    pub reply_to: Option<String>,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            reply_to: None,
        }
    }

    /// Replace all headers
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Set a single header, keeping the others
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(name.to_string(), value.into());
        self
    }

    /// Add a reply-to subject
    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Look up a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|h| h.get(name))
            .map(String::as_str)
    }

    /// Delivery attempt carried in [`ATTEMPT_HEADER`].
    ///
    /// A missing or unparsable header means this is the first delivery.
    pub fn delivery_attempt(&self) -> u32 {
        self.header(ATTEMPT_HEADER)
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|attempt| *attempt >= 1)
            .unwrap_or(1)
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core event bus abstraction for publish-subscribe messaging
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a raw payload to a subject without headers
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Publish a full message, headers included
    ///
    /// Consumers rely on headers surviving the round trip (the delivery attempt
    /// counter travels this way), so implementations must forward them.
    async fn publish_message(&self, msg: BusMessage) -> BusResult<()>;

    /// Subscribe to messages matching a subject pattern
    ///
    /// Wildcards follow NATS semantics:
    /// - `*` matches a single token (e.g., `payment.to.learning.*`)
    /// - `>` matches one or more tokens (e.g., `learning.>`)
    ///
    /// The returned stream ends when the underlying connection is gone.
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Subscribe as one member of the queue group `group`
    ///
    /// Every message matching `subject` goes to exactly one member of the
    /// group, across all processes sharing the broker. Competing service
    /// instances use this so that a message, and each redelivery of it, is
    /// handled once.
    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
