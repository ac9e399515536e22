use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Enrollment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Canceled,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "active" => Some(EnrollmentStatus::Active),
            "completed" => Some(EnrollmentStatus::Completed),
            "canceled" => Some(EnrollmentStatus::Canceled),
            _ => None,
        }
    }

    /// Completed and Canceled accept no further transitions
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EnrollmentStatus::Active)
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub user_id: String,
    pub product_id: i64,
    pub scheduled_event_id: Option<i64>,
    pub status: EnrollmentStatus,
    pub session_start: Option<DateTime<Utc>>,
    pub session_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to persist a fresh enrollment
#[derive(Debug, Clone)]
pub struct NewEnrollment {
    pub user_id: String,
    pub product_id: i64,
    pub scheduled_event_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEnrollmentRequest {
    pub user_id: String,
    pub product_id: i64,
    pub scheduled_event_id: Option<i64>,
    /// Educator the learner expects to book with
    pub educator_id: Option<String>,
}

/// An educator has published a product; downstream services are told so
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceProductRequest {
    pub user_id: String,
    /// Joins an existing correlation chain
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceProductResponse {
    pub event_id: Uuid,
}

// ============================================================================
// Educator profile projection
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EducatorProfile {
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
    pub image_url: Option<String>,
    /// Envelope timestamp of the event that produced this version
    pub source_timestamp: DateTime<Utc>,
}

// ============================================================================
// Error Response
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
