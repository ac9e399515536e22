mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use learning_rs::repos::InMemoryEnrollmentStore;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = common::app(Arc::new(InMemoryEnrollmentStore::new()));

    let response = app.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = common::body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["module"], "learning");
}

#[tokio::test]
async fn test_metrics_endpoint_serves_text_exposition() {
    let app = common::app(Arc::new(InMemoryEnrollmentStore::new()));

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
}

/// Session 11 is bookable for product 42
#[tokio::test]
async fn test_create_enrollment_for_session() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    let app = common::app(store.clone());

    let response = app
        .oneshot(post_json(
            "/api/enrollments",
            serde_json::json!({
                "user_id": "learner-1",
                "product_id": 42,
                "scheduled_event_id": 11,
                "educator_id": "edu-1"
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = common::body_json(response).await;
    assert_eq!(json["status"], "active");
    assert_eq!(json["product_id"], 42);
    assert_eq!(json["scheduled_event_id"], 11);
    assert!(Uuid::parse_str(json["id"].as_str().unwrap()).is_ok());
    assert_eq!(store.enrollment_count().await, 1);
}

#[tokio::test]
async fn test_unknown_session_is_rejected_without_writing() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    let app = common::app(store.clone());

    let response = app
        .oneshot(post_json(
            "/api/enrollments",
            serde_json::json!({"user_id": "learner-1", "product_id": 42, "scheduled_event_id": 7}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = common::body_json(response).await;
    assert_eq!(json["error"], "booking_rejected");
    assert_eq!(json["message"], "session not found");
    assert_eq!(store.enrollment_count().await, 0);
}

#[tokio::test]
async fn test_session_of_another_product_is_rejected() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    let app = common::app(store.clone());

    let response = app
        .oneshot(post_json(
            "/api/enrollments",
            serde_json::json!({"user_id": "learner-1", "product_id": 43, "scheduled_event_id": 11}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(store.enrollment_count().await, 0);
}

#[tokio::test]
async fn test_second_active_enrollment_conflicts() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    let app = common::app(store.clone());
    let body = serde_json::json!({"user_id": "learner-1", "product_id": 42});

    let first = app
        .clone()
        .oneshot(post_json("/api/enrollments", body.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = app
        .oneshot(post_json("/api/enrollments", body))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(common::body_json(second).await["error"], "already_enrolled");
    assert_eq!(store.enrollment_count().await, 1);
}

#[tokio::test]
async fn test_get_and_cancel_enrollment() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    let app = common::app(store);

    let created = app
        .clone()
        .oneshot(post_json(
            "/api/enrollments",
            serde_json::json!({"user_id": "learner-1", "product_id": 42}),
        ))
        .await
        .unwrap();
    let id = common::body_json(created).await["id"]
        .as_str()
        .unwrap()
        .to_string();

    let fetched = app
        .clone()
        .oneshot(get(&format!("/api/enrollments/{}", id)))
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);
    assert_eq!(common::body_json(fetched).await["status"], "active");

    let canceled = app
        .clone()
        .oneshot(post_json(&format!("/api/enrollments/{}/cancel", id), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(canceled.status(), StatusCode::OK);
    assert_eq!(common::body_json(canceled).await["status"], "canceled");

    // Canceling again leaves the terminal state alone
    let again = app
        .oneshot(post_json(&format!("/api/enrollments/{}/cancel", id), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::OK);
    assert_eq!(common::body_json(again).await["status"], "canceled");
}

#[tokio::test]
async fn test_missing_enrollment_is_not_found() {
    let app = common::app(Arc::new(InMemoryEnrollmentStore::new()));
    let id = Uuid::new_v4();

    let response = app
        .clone()
        .oneshot(get(&format!("/api/enrollments/{}", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(common::body_json(response).await["error"], "not_found");

    let cancel = app
        .oneshot(post_json(&format!("/api/enrollments/{}/cancel", id), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(cancel.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_store_outage_maps_to_500() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    let app = common::app(store.clone());

    let created = app
        .clone()
        .oneshot(post_json(
            "/api/enrollments",
            serde_json::json!({"user_id": "learner-1", "product_id": 42}),
        ))
        .await
        .unwrap();
    let id = common::body_json(created).await["id"]
        .as_str()
        .unwrap()
        .to_string();

    store.inject_commit_failures(1).await;
    let response = app
        .oneshot(post_json(&format!("/api/enrollments/{}/cancel", id), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(common::body_json(response).await["error"], "database_error");
}

#[tokio::test]
async fn test_announce_product_queues_catalog_event() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    let app = common::app(store.clone());

    let response = app
        .oneshot(post_json(
            "/api/educator-products",
            serde_json::json!({"user_id": "edu-1", "correlation_id": "corr-9"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = common::body_json(response).await;
    let event_id = Uuid::parse_str(json["event_id"].as_str().unwrap()).unwrap();

    let rows = store.outbox_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_id, event_id);
    assert_eq!(rows[0].subject, "learning.to.catalog.educator_product_created");
}

#[tokio::test]
async fn test_announce_product_requires_user_id() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    let app = common::app(store.clone());

    let response = app
        .oneshot(post_json(
            "/api/educator-products",
            serde_json::json!({"user_id": "  "}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = common::body_json(response).await;
    assert_eq!(json["error"], "validation_error");
    assert!(store.outbox_rows().await.is_empty());
}
