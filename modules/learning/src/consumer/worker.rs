//! Consumer worker pool
//!
//! The inbound subscriptions feed one channel shared by `workers` tasks.
//! Each worker owns its own RNG for backoff jitter. Delayed redelivery is a
//! spawned timer that republishes the message, so a worker never sleeps on a
//! retry.
//!
//! Subscriptions join the [`CONSUMER_GROUP`] queue group: with several
//! service instances on one broker, each delivery (redeliveries included)
//! reaches exactly one of them.
//!
//! A pending redelivery lives only in this process until its timer fires.
//! If the republish fails the message is dead-lettered instead. If the
//! process stops first, the message is lost.

use event_bus::{BusError, BusMessage, EventBus, ATTEMPT_HEADER};
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::dispatcher::{Ack, Dispatched, Dispatcher, Disposition};
use crate::events::catalog::INBOUND_SUBJECTS;
use crate::events::dlq::{DeadLetterReason, DeadLetterRecord, DeadLetterSink};
use crate::metrics::Metrics;

const CHANNEL_CAPACITY: usize = 256;

/// Queue group shared by every instance of the learning service
pub const CONSUMER_GROUP: &str = "learning-enrollment";

#[derive(Clone)]
pub struct ConsumerContext {
    pub bus: Arc<dyn EventBus>,
    pub dispatcher: Arc<Dispatcher>,
    pub dlq: DeadLetterSink,
    pub metrics: Arc<Metrics>,
}

/// Running subscription forwarders and workers
pub struct ConsumerSet {
    forwarders: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerSet {
    /// Resolve once any subscription stream has ended
    ///
    /// The remaining forwarders are stopped and the workers drain what is
    /// already queued before this returns.
    pub async fn wait(self) {
        if !self.forwarders.is_empty() {
            let (_, _, rest) = futures::future::select_all(self.forwarders).await;
            for forwarder in rest {
                forwarder.abort();
            }
        }

        for worker in self.workers {
            let _ = worker.await;
        }
    }

    pub fn abort(&self) {
        for handle in self.forwarders.iter().chain(self.workers.iter()) {
            handle.abort();
        }
    }
}

/// Subscribe to every inbound subject and start `workers` consumers
pub async fn start_learning_consumers(
    ctx: ConsumerContext,
    workers: usize,
) -> Result<ConsumerSet, BusError> {
    let (tx, rx) = mpsc::channel::<BusMessage>(CHANNEL_CAPACITY);

    let mut streams = Vec::with_capacity(INBOUND_SUBJECTS.len());
    for subject in INBOUND_SUBJECTS {
        streams.push((subject, ctx.bus.queue_subscribe(subject, CONSUMER_GROUP).await?));
        tracing::info!(subject = %subject, group = CONSUMER_GROUP, "Subscribed");
    }

    let forwarders = streams
        .into_iter()
        .map(|(subject, mut stream)| {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
                tracing::error!(subject = %subject, "Subscription stream ended");
            })
        })
        .collect();
    drop(tx);

    let rx = Arc::new(Mutex::new(rx));
    let workers = (0..workers.max(1))
        .map(|worker_id| {
            let ctx = ctx.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                let mut rng = StdRng::from_entropy();
                tracing::debug!(worker_id, "Consumer worker started");

                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(msg) = next else { break };
                    process_message(&ctx, msg, &mut rng).await;
                }

                tracing::debug!(worker_id, "Consumer worker stopped");
            })
        })
        .collect();

    Ok(ConsumerSet {
        forwarders,
        workers,
    })
}

pub async fn process_message(ctx: &ConsumerContext, msg: BusMessage, rng: &mut StdRng) {
    let span = tracing::info_span!(
        "learning_event",
        event_id = tracing::field::Empty,
        event_type = tracing::field::Empty,
        correlation_id = tracing::field::Empty,
        subject = %msg.subject,
        attempt = msg.delivery_attempt(),
    );

    async {
        let dispatched = ctx.dispatcher.dispatch(&msg, rng).await;
        apply_disposition(ctx, msg, dispatched).await;
    }
    .instrument(span)
    .await
}

async fn apply_disposition(ctx: &ConsumerContext, msg: BusMessage, dispatched: Dispatched) {
    let Dispatched {
        event_type,
        disposition,
    } = dispatched;
    ctx.metrics.record_event(event_type, disposition.outcome());

    match disposition {
        Disposition::Ack(Ack::Processed) => {
            tracing::info!("Event processed");
        }
        Disposition::Ack(Ack::Duplicate) => {}
        Disposition::Retry {
            next_attempt,
            delay,
            error,
        } => {
            tracing::warn!(
                error = %error,
                next_attempt = next_attempt,
                delay_ms = delay.as_millis() as u64,
                "Event processing failed, scheduling redelivery"
            );

            let bus = ctx.bus.clone();
            let dlq = ctx.dlq.clone();
            let redelivery = msg.with_header(ATTEMPT_HEADER, next_attempt.to_string());
            tokio::spawn(
                async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = bus.publish_message(redelivery.clone()).await {
                        tracing::error!(error = %e, "Redelivery publish failed, dead-lettering");
                        let record = DeadLetterRecord::from_message(
                            &redelivery,
                            DeadLetterReason::RedeliveryFailed,
                            format!("{}; redelivery failed: {}", error, e),
                            next_attempt - 1,
                        );
                        publish_dead_letter(&dlq, &record).await;
                    }
                }
                .in_current_span(),
            );
        }
        Disposition::DeadLetter(record) => publish_dead_letter(&ctx.dlq, &record).await,
    }
}

async fn publish_dead_letter(dlq: &DeadLetterSink, record: &DeadLetterRecord) {
    if let Err(e) = dlq.publish(record).await {
        tracing::error!(
            dlq_subject = %dlq.subject(),
            subject = %record.subject,
            event_id = %record.event_id.as_deref().unwrap_or("unknown"),
            reason = record.reason.as_str(),
            attempts = record.attempts,
            failure = %record.error,
            payload = %record.payload,
            error = %e,
            "Failed to publish dead letter"
        );
    }
}
