#![allow(dead_code)]

use async_trait::async_trait;
use event_bus::{BusMessage, EventBus, InMemoryBus, RetryConfig, ATTEMPT_HEADER};
use futures::stream::BoxStream;
use futures::StreamExt;
use learning_rs::booking::{
    BookingMetadataResolver, ScheduledEventSource, ScheduledEventView, SchedulingClientError,
};
use learning_rs::consumer::{learning_handlers, start_learning_consumers, ConsumerContext, ConsumerSet, Dispatcher};
use learning_rs::events::DeadLetterSink;
use learning_rs::repos::InMemoryEnrollmentStore;
use learning_rs::{EnrollmentService, Metrics};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const DLQ_SUBJECT: &str = "learning.dlq";

/// Scheduling service with a single bookable session (id 11, product 42)
pub struct StubSchedule;

#[async_trait]
impl ScheduledEventSource for StubSchedule {
    async fn fetch_scheduled_event(
        &self,
        id: i64,
    ) -> Result<Option<ScheduledEventView>, SchedulingClientError> {
        Ok((id == 11).then(|| ScheduledEventView {
            id,
            educator_id: "edu-1".to_string(),
            product_id: 42,
            title: "Lifetimes in practice".to_string(),
            start_time: None,
            end_time: None,
            canceled: false,
        }))
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_interval: Duration::from_millis(1),
        multiplier: 2.0,
        max_interval: Duration::from_millis(5),
    }
}

pub fn service(store: Arc<InMemoryEnrollmentStore>) -> Arc<EnrollmentService> {
    Arc::new(EnrollmentService::new(
        store,
        BookingMetadataResolver::new(Arc::new(StubSchedule)),
    ))
}

pub struct Harness {
    pub bus: Arc<InMemoryBus>,
    pub store: Arc<InMemoryEnrollmentStore>,
    pub service: Arc<EnrollmentService>,
    pub metrics: Arc<Metrics>,
    retry: RetryConfig,
    consumers: Vec<ConsumerSet>,
}

impl Harness {
    pub async fn start(retry: RetryConfig) -> Self {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryEnrollmentStore::new());
        let service = service(store.clone());
        let metrics = Arc::new(Metrics::new().unwrap());

        let mut harness = Self {
            bus,
            store,
            service,
            metrics,
            retry,
            consumers: Vec::new(),
        };
        harness.add_instance().await;
        harness
    }

    /// Start another service instance on the same bus and store
    pub async fn add_instance(&mut self) {
        let dispatcher = Dispatcher::new(
            learning_handlers(self.service.clone()),
            self.store.clone(),
            self.retry.clone(),
        );
        let consumers = start_learning_consumers(
            ConsumerContext {
                bus: self.bus.clone(),
                dispatcher: Arc::new(dispatcher),
                dlq: DeadLetterSink::new(self.bus.clone(), DLQ_SUBJECT),
                metrics: self.metrics.clone(),
            },
            2,
        )
        .await
        .unwrap();
        self.consumers.push(consumers);
    }

    pub async fn dlq_stream(&self) -> BoxStream<'static, BusMessage> {
        self.bus.subscribe(DLQ_SUBJECT).await.unwrap()
    }

    pub async fn publish_raw(&self, subject: &str, payload: Vec<u8>) {
        self.bus.publish(subject, payload).await.unwrap();
    }

    pub async fn publish_event(
        &self,
        subject: &str,
        event_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) {
        let body = envelope_bytes(event_id, event_type, payload);
        let msg = BusMessage::new(subject.to_string(), body).with_header(ATTEMPT_HEADER, "1");
        self.bus.publish_message(msg).await.unwrap();
    }

    pub fn count(&self, event_type: &str, outcome: &str) -> u64 {
        self.metrics
            .learning_events_total
            .with_label_values(&[event_type, outcome])
            .get()
    }

    /// Poll until `event_type` has `expected` deliveries with `outcome`
    pub async fn wait_for_count(&self, event_type: &str, outcome: &str, expected: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.count(event_type, outcome) < expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} {} x{} (saw {})",
                event_type,
                outcome,
                expected,
                self.count(event_type, outcome)
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        for consumers in &self.consumers {
            consumers.abort();
        }
    }
}

pub fn envelope_bytes(event_id: Uuid, event_type: &str, payload: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event_id": event_id,
        "event_type": event_type,
        "correlation_id": format!("corr-{}", event_id),
        "timestamp": chrono::Utc::now(),
        "source_module": "test",
        "payload": payload,
    }))
    .unwrap()
}

pub async fn next_message(stream: &mut BoxStream<'static, BusMessage>) -> BusMessage {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timeout waiting for message")
        .expect("stream ended")
}

/// Asserts nothing arrives on `stream` within `window`
pub async fn assert_quiet(stream: &mut BoxStream<'static, BusMessage>, window: Duration) {
    let result = tokio::time::timeout(window, stream.next()).await;
    assert!(result.is_err(), "unexpected message: {:?}", result);
}

pub fn app(store: Arc<InMemoryEnrollmentStore>) -> axum::Router {
    learning_rs::learning_router(learning_rs::AppState {
        service: service(store),
        metrics: Arc::new(Metrics::new().unwrap()),
    })
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
