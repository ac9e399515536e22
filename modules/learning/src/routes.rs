use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::enrollment::{EnrollmentError, EnrollmentService};
use crate::metrics::Metrics;
use crate::models::{
    AnnounceProductRequest, AnnounceProductResponse, CreateEnrollmentRequest, Enrollment,
    ErrorResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EnrollmentService>,
    pub metrics: Arc<Metrics>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn learning_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/enrollments", post(create_enrollment))
        .route("/api/enrollments/{id}", get(get_enrollment))
        .route("/api/enrollments/{id}/cancel", post(cancel_enrollment))
        .route("/api/educator-products", post(announce_product))
        .with_state(state)
}

fn error_response(e: EnrollmentError) -> ApiError {
    match e {
        EnrollmentError::BookingRejected(reason) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse::new("booking_rejected", reason)),
        ),
        EnrollmentError::InvalidRequest(reason) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("validation_error", reason)),
        ),
        EnrollmentError::AlreadyEnrolled => (
            StatusCode::CONFLICT,
            Json(ErrorResponse::new("already_enrolled", e.to_string())),
        ),
        EnrollmentError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", e.to_string())),
        ),
        EnrollmentError::Store(store_error) => {
            tracing::error!("Database error: {}", store_error);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("database_error", "Enrollment store unavailable")),
            )
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "module": "learning",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /metrics - Prometheus text exposition
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            e,
        ),
    }
}

/// POST /api/enrollments - Book a learner onto a product or session
async fn create_enrollment(
    State(state): State<AppState>,
    Json(req): Json<CreateEnrollmentRequest>,
) -> Result<(StatusCode, Json<Enrollment>), ApiError> {
    let enrollment = state
        .service
        .create_enrollment(req)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(enrollment)))
}

/// GET /api/enrollments/{id}
async fn get_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ApiError> {
    let enrollment = state
        .service
        .get_enrollment(id)
        .await
        .map_err(error_response)?;

    Ok(Json(enrollment))
}

/// POST /api/enrollments/{id}/cancel - Administrative cancellation
async fn cancel_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ApiError> {
    let enrollment = state
        .service
        .cancel_enrollment(id)
        .await
        .map_err(error_response)?;

    Ok(Json(enrollment))
}

/// POST /api/educator-products - Announce a newly published educator product
async fn announce_product(
    State(state): State<AppState>,
    Json(req): Json<AnnounceProductRequest>,
) -> Result<(StatusCode, Json<AnnounceProductResponse>), ApiError> {
    let event_id = state
        .service
        .announce_product(req)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::ACCEPTED, Json(AnnounceProductResponse { event_id })))
}
