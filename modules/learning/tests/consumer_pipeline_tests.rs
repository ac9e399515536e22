mod common;

use common::{assert_quiet, fast_retry, next_message, Harness};
use event_bus::{EventBus, RetryConfig};
use learning_rs::events::{DeadLetterReason, DeadLetterRecord, EventPublisher, OutboxRelay};
use learning_rs::models::{CreateEnrollmentRequest, EnrollmentStatus};
use learning_rs::repos::EnrollmentStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const PAYMENT_SUBJECT: &str = "payment.to.learning.payment_completed";
const SCHEDULED_SUBJECT: &str = "scheduling.to.learning.event_scheduled";
const CANCELED_SUBJECT: &str = "scheduling.to.learning.booking_canceled";

fn enroll(product_id: i64) -> CreateEnrollmentRequest {
    CreateEnrollmentRequest {
        user_id: "learner-1".to_string(),
        product_id,
        scheduled_event_id: None,
        educator_id: None,
    }
}

fn payment(product_id: i64) -> serde_json::Value {
    json!({"user_id": "learner-1", "product_id": product_id})
}

/// Scenario: E1 active for product 42, PAYMENT_COMPLETED X delivered twice
#[tokio::test]
async fn test_duplicate_payment_completes_once_and_announces_once() {
    let h = Harness::start(RetryConfig::default()).await;
    let e1 = h.service.create_enrollment(enroll(42)).await.unwrap();
    let x = Uuid::new_v4();

    h.publish_event(PAYMENT_SUBJECT, x, "PAYMENT_COMPLETED", payment(42)).await;
    h.wait_for_count("PAYMENT_COMPLETED", "processed", 1).await;
    let after_first = h.service.get_enrollment(e1.id).await.unwrap();

    h.publish_event(PAYMENT_SUBJECT, x, "PAYMENT_COMPLETED", payment(42)).await;
    h.wait_for_count("PAYMENT_COMPLETED", "duplicate", 1).await;
    let after_second = h.service.get_enrollment(e1.id).await.unwrap();

    assert_eq!(after_second.status, EnrollmentStatus::Completed);
    assert_eq!(after_second.updated_at, after_first.updated_at);
    assert_eq!(h.store.ledger_len().await, 1);
    assert_eq!(h.store.ledger_event_type(x).await.as_deref(), Some("PAYMENT_COMPLETED"));

    // Exactly one BOOKING_COMPLETED leaves through the outbox
    let mut outbound = h.bus.subscribe("learning.to.scheduling.*").await.unwrap();
    let relay = OutboxRelay::new(
        h.store.clone(),
        EventPublisher::new(h.bus.clone(), Duration::from_secs(1)),
        h.metrics.clone(),
        Duration::from_millis(10),
        5,
        Duration::from_secs(60),
    );
    assert_eq!(relay.relay_once().await.unwrap().published, 1);
    assert_eq!(relay.relay_once().await.unwrap().published, 0);

    let msg = next_message(&mut outbound).await;
    let body: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(body["event_type"], "BOOKING_COMPLETED");
    assert_eq!(body["payload"]["enrollment_id"], e1.id.to_string());
    assert_eq!(body["causation_id"], x.to_string());
    assert_eq!(body["correlation_id"], format!("corr-{}", x));
    assert_quiet(&mut outbound, Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_terminal_enrollment_ignores_later_events() {
    let h = Harness::start(RetryConfig::default()).await;
    let enrollment = h.service.create_enrollment(enroll(42)).await.unwrap();
    let canceled = h.service.cancel_enrollment(enrollment.id).await.unwrap();

    h.publish_event(PAYMENT_SUBJECT, Uuid::new_v4(), "PAYMENT_COMPLETED", payment(42))
        .await;
    h.publish_event(
        SCHEDULED_SUBJECT,
        Uuid::new_v4(),
        "EVENT_SCHEDULED",
        json!({
            "user_id": "learner-1",
            "product_id": 42,
            "start_time": "2026-05-01T09:00:00Z",
            "end_time": "2026-05-01T10:00:00Z",
        }),
    )
    .await;
    h.publish_event(
        CANCELED_SUBJECT,
        Uuid::new_v4(),
        "BOOKING_CANCELED",
        json!({"user_id": "learner-1", "product_id": 42, "reason": "learner request"}),
    )
    .await;

    h.wait_for_count("PAYMENT_COMPLETED", "processed", 1).await;
    h.wait_for_count("EVENT_SCHEDULED", "processed", 1).await;
    h.wait_for_count("BOOKING_CANCELED", "processed", 1).await;

    let stored = h.service.get_enrollment(enrollment.id).await.unwrap();
    assert_eq!(stored, canceled);
    assert!(h.store.outbox_rows().await.is_empty());
    assert_eq!(h.store.ledger_len().await, 3);
}

#[tokio::test]
async fn test_cancellation_before_payment_wins() {
    let h = Harness::start(RetryConfig::default()).await;
    let enrollment = h.service.create_enrollment(enroll(42)).await.unwrap();

    h.publish_event(
        CANCELED_SUBJECT,
        Uuid::new_v4(),
        "BOOKING_CANCELED",
        json!({"user_id": "learner-1", "product_id": 42}),
    )
    .await;
    h.wait_for_count("BOOKING_CANCELED", "processed", 1).await;

    h.publish_event(PAYMENT_SUBJECT, Uuid::new_v4(), "PAYMENT_COMPLETED", payment(42))
        .await;
    h.wait_for_count("PAYMENT_COMPLETED", "processed", 1).await;

    let stored = h.service.get_enrollment(enrollment.id).await.unwrap();
    assert_eq!(stored.status, EnrollmentStatus::Canceled);
    assert!(h.store.outbox_rows().await.is_empty());
}

#[tokio::test]
async fn test_malformed_message_dead_letters_on_first_attempt() {
    let h = Harness::start(fast_retry(5)).await;
    let mut dlq = h.dlq_stream().await;

    h.publish_raw(PAYMENT_SUBJECT, b"{\"event_id\": 12".to_vec()).await;

    let msg = next_message(&mut dlq).await;
    let record: DeadLetterRecord = serde_json::from_slice(&msg.payload).unwrap();

    assert_eq!(record.reason, DeadLetterReason::Malformed);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.subject, PAYMENT_SUBJECT);
    assert_eq!(record.payload, json!("{\"event_id\": 12"));

    assert_quiet(&mut dlq, Duration::from_millis(50)).await;
    assert_eq!(h.count("unknown", "retried"), 0);
}

#[tokio::test]
async fn test_unknown_and_outbound_types_are_not_handled() {
    let h = Harness::start(fast_retry(5)).await;
    let mut dlq = h.dlq_stream().await;

    h.publish_event(
        "scheduling.to.learning.course_archived",
        Uuid::new_v4(),
        "COURSE_ARCHIVED",
        json!({}),
    )
    .await;
    let first: DeadLetterRecord = serde_json::from_slice(&next_message(&mut dlq).await.payload).unwrap();
    assert_eq!(first.reason, DeadLetterReason::UnknownEventType);
    assert_eq!(first.event_type.as_deref(), Some("COURSE_ARCHIVED"));

    // An outbound-only type arriving inbound has no handler either
    h.publish_event(
        "scheduling.to.learning.booking_completed",
        Uuid::new_v4(),
        "BOOKING_COMPLETED",
        json!({"user_id": "learner-1", "enrollment_id": Uuid::new_v4()}),
    )
    .await;
    let second: DeadLetterRecord = serde_json::from_slice(&next_message(&mut dlq).await.payload).unwrap();
    assert_eq!(second.reason, DeadLetterReason::UnknownEventType);
    assert_eq!(second.attempts, 1);
}

#[tokio::test]
async fn test_retry_ceiling_yields_exactly_one_dead_letter() {
    let h = Harness::start(fast_retry(3)).await;
    let mut dlq = h.dlq_stream().await;
    h.store.inject_commit_failures(u32::MAX).await;
    let event_id = Uuid::new_v4();

    h.publish_event(PAYMENT_SUBJECT, event_id, "PAYMENT_COMPLETED", payment(42))
        .await;

    let record: DeadLetterRecord = serde_json::from_slice(&next_message(&mut dlq).await.payload).unwrap();
    assert_eq!(record.reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.event_id, Some(event_id.to_string()));
    assert!(record.error.contains("injected failure"));

    assert_quiet(&mut dlq, Duration::from_millis(100)).await;
    assert_eq!(h.count("PAYMENT_COMPLETED", "retried"), 2);
    assert_eq!(h.count("PAYMENT_COMPLETED", "dead_lettered"), 1);
    assert!(!h.store.is_processed(event_id).await.unwrap());
}

#[tokio::test]
async fn test_transient_failures_recover_before_ceiling() {
    let h = Harness::start(fast_retry(5)).await;
    let enrollment = h.service.create_enrollment(enroll(42)).await.unwrap();
    h.store.inject_commit_failures(2).await;

    h.publish_event(PAYMENT_SUBJECT, Uuid::new_v4(), "PAYMENT_COMPLETED", payment(42))
        .await;
    h.wait_for_count("PAYMENT_COMPLETED", "processed", 1).await;

    assert_eq!(h.count("PAYMENT_COMPLETED", "retried"), 2);
    let stored = h.service.get_enrollment(enrollment.id).await.unwrap();
    assert_eq!(stored.status, EnrollmentStatus::Completed);
    assert_eq!(h.store.outbox_rows().await.len(), 1);
}

#[tokio::test]
async fn test_inverted_session_window_dead_letters_without_retry() {
    let h = Harness::start(fast_retry(5)).await;
    let mut dlq = h.dlq_stream().await;
    h.service.create_enrollment(enroll(42)).await.unwrap();

    h.publish_event(
        SCHEDULED_SUBJECT,
        Uuid::new_v4(),
        "EVENT_SCHEDULED",
        json!({
            "user_id": "learner-1",
            "product_id": 42,
            "start_time": "2026-05-01T10:00:00Z",
            "end_time": "2026-05-01T09:00:00Z",
        }),
    )
    .await;

    let record: DeadLetterRecord = serde_json::from_slice(&next_message(&mut dlq).await.payload).unwrap();
    assert_eq!(record.reason, DeadLetterReason::Permanent);
    assert_eq!(record.attempts, 1);
    assert_eq!(h.count("EVENT_SCHEDULED", "retried"), 0);
}

#[tokio::test]
async fn test_profile_updates_apply_newest_version() {
    let h = Harness::start(RetryConfig::default()).await;
    let subject = "profile.to.learning.educator_profile_updated";

    let newer = json!({
        "event_id": Uuid::new_v4(),
        "event_type": "EDUCATOR_PROFILE_UPDATED",
        "correlation_id": "c-1",
        "timestamp": "2026-04-02T00:00:00Z",
        "payload": {"user_id": "edu-1", "first_name": "Barbara", "last_name": "Liskov", "image_url": null},
    });
    let older = json!({
        "event_id": Uuid::new_v4(),
        "event_type": "EDUCATOR_PROFILE_UPDATED",
        "correlation_id": "c-2",
        "timestamp": "2026-04-01T00:00:00Z",
        "payload": {"user_id": "edu-1", "first_name": "Old", "last_name": "Name"},
    });

    h.publish_raw(subject, serde_json::to_vec(&newer).unwrap()).await;
    h.wait_for_count("EDUCATOR_PROFILE_UPDATED", "processed", 1).await;
    h.publish_raw(subject, serde_json::to_vec(&older).unwrap()).await;
    h.wait_for_count("EDUCATOR_PROFILE_UPDATED", "processed", 2).await;

    let profile = h.store.get_educator_profile("edu-1").await.unwrap().unwrap();
    assert_eq!(profile.first_name, "Barbara");
}

#[tokio::test]
async fn test_consumer_set_survives_handler_failures() {
    let h = Harness::start(fast_retry(1)).await;
    let store: Arc<dyn EnrollmentStore> = h.store.clone();
    h.store.inject_commit_failures(1).await;

    h.publish_event(PAYMENT_SUBJECT, Uuid::new_v4(), "PAYMENT_COMPLETED", payment(42))
        .await;
    h.wait_for_count("PAYMENT_COMPLETED", "dead_lettered", 1).await;

    let event_id = Uuid::new_v4();
    h.publish_event(PAYMENT_SUBJECT, event_id, "PAYMENT_COMPLETED", payment(42))
        .await;
    h.wait_for_count("PAYMENT_COMPLETED", "processed", 1).await;
    assert!(store.is_processed(event_id).await.unwrap());
}

#[tokio::test]
async fn test_two_instances_dead_letter_once_at_ceiling() {
    let mut h = Harness::start(fast_retry(3)).await;
    h.add_instance().await;
    let mut dlq = h.dlq_stream().await;
    h.store.inject_commit_failures(10_000).await;

    h.publish_event(PAYMENT_SUBJECT, Uuid::new_v4(), "PAYMENT_COMPLETED", payment(42))
        .await;

    let record: DeadLetterRecord = serde_json::from_slice(&next_message(&mut dlq).await.payload).unwrap();
    assert_eq!(record.reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(record.attempts, 3);

    assert_quiet(&mut dlq, Duration::from_millis(200)).await;
    assert_eq!(h.count("PAYMENT_COMPLETED", "retried"), 2);
    assert_eq!(h.count("PAYMENT_COMPLETED", "dead_lettered"), 1);
}

#[tokio::test]
async fn test_two_instances_share_the_inbound_stream() {
    let mut h = Harness::start(RetryConfig::default()).await;
    h.add_instance().await;

    for _ in 0..20 {
        h.publish_event(PAYMENT_SUBJECT, Uuid::new_v4(), "PAYMENT_COMPLETED", payment(42))
            .await;
    }
    h.wait_for_count("PAYMENT_COMPLETED", "processed", 20).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.count("PAYMENT_COMPLETED", "processed"), 20);
    assert_eq!(h.count("PAYMENT_COMPLETED", "duplicate"), 0);
    assert_eq!(h.store.ledger_len().await, 20);
}
