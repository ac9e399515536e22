//! In-memory implementation of the EventBus trait for testing and development

use crate::{BusMessage, BusResult, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Members of one queue group pull from a single shared receiver
type GroupReceiver = Arc<Mutex<mpsc::Receiver<BusMessage>>>;

/// EventBus implementation using in-memory channels
///
/// Messages, headers included, are broadcast to every subscriber whose
/// pattern matches the subject. Suitable for unit tests, local development,
/// and integration tests that need a fast, isolated bus.
///
/// Queue groups are keyed by `(pattern, group)`. One feeder task per group
/// copies matching messages into a channel its members compete on, so every
/// message reaches exactly one member.
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// let mut stream = bus.subscribe("payment.to.learning.*").await?;
///
/// bus.publish("payment.to.learning.payment_completed", b"hello".to_vec()).await?;
///
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.subject, "payment.to.learning.payment_completed");
/// assert_eq!(msg.payload, b"hello");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    sender: Arc<broadcast::Sender<BusMessage>>,
    groups: Arc<Mutex<HashMap<(String, String), GroupReceiver>>>,
    buffer_size: usize,
}

impl InMemoryBus {
    /// Create a new in-memory event bus with a buffer of 1000 messages
    ///
    /// Slow subscribers that fall further behind lose the oldest messages.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new in-memory event bus with a custom buffer size
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
            groups: Arc::new(Mutex::new(HashMap::new())),
            buffer_size,
        }
    }

    /// Start the feeder for a new queue group
    ///
    /// The broadcast receiver is taken before returning, so nothing published
    /// after the first `queue_subscribe` call is missed.
    fn spawn_group_feed(&self, pattern: &str) -> GroupReceiver {
        let mut receiver = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(self.buffer_size.max(1));
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if Self::matches_pattern(&msg.subject, &pattern)
                            && tx.send(msg).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            pattern = %pattern,
                            skipped = skipped,
                            "InMemoryBus queue group lagged, messages dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Arc::new(Mutex::new(rx))
    }

    /// Check if a subject matches a subscription pattern
    ///
    /// Supports NATS-style wildcards:
    /// - `*` matches exactly one token
    /// - `>` matches one or more tokens
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.publish_message(BusMessage::new(subject.to_string(), payload))
            .await
    }

    async fn publish_message(&self, msg: BusMessage) -> BusResult<()> {
        // No receivers is not an error
        let _ = self.sender.send(msg);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if Self::matches_pattern(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            pattern = %pattern,
                            skipped = skipped,
                            "InMemoryBus subscriber lagged, messages dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn queue_subscribe(
        &self,
        pattern: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        let shared = {
            let mut groups = self.groups.lock().await;
            groups
                .entry((pattern.to_string(), group.to_string()))
                .or_insert_with(|| self.spawn_group_feed(pattern))
                .clone()
        };

        let stream = async_stream::stream! {
            loop {
                let next = shared.lock().await.recv().await;
                match next {
                    Some(msg) => yield msg,
                    None => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}
