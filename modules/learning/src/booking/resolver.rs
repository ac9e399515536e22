//! Booking metadata resolution
//!
//! Called while creating an enrollment, never during event replay. Every
//! failure mode collapses into `is_valid = false` with a readable message so
//! the caller can refuse the booking before writing anything.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::scheduling_client::ScheduledEventSource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingMetadata {
    pub is_valid: bool,
    pub error_message: Option<String>,
    pub educator_id: Option<String>,
    pub product_id: Option<i64>,
    pub title: Option<String>,
}

impl BookingMetadata {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error_message: Some(message.into()),
            educator_id: None,
            product_id: None,
            title: None,
        }
    }
}

#[derive(Clone)]
pub struct BookingMetadataResolver {
    source: Arc<dyn ScheduledEventSource>,
}

impl BookingMetadataResolver {
    pub fn new(source: Arc<dyn ScheduledEventSource>) -> Self {
        Self { source }
    }

    pub async fn resolve(&self, scheduled_event_id: i64) -> BookingMetadata {
        match self.source.fetch_scheduled_event(scheduled_event_id).await {
            Ok(Some(view)) if view.canceled => BookingMetadata {
                is_valid: false,
                error_message: Some("session has been canceled".to_string()),
                educator_id: Some(view.educator_id),
                product_id: Some(view.product_id),
                title: Some(view.title),
            },
            Ok(Some(view)) => BookingMetadata {
                is_valid: true,
                error_message: None,
                educator_id: Some(view.educator_id),
                product_id: Some(view.product_id),
                title: Some(view.title),
            },
            Ok(None) => BookingMetadata::invalid("session not found"),
            Err(e) => {
                tracing::warn!(
                    scheduled_event_id = scheduled_event_id,
                    error = %e,
                    "Scheduling service lookup failed"
                );
                BookingMetadata::invalid(format!("scheduling service unavailable: {}", e))
            }
        }
    }
}
