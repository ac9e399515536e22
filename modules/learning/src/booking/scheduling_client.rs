use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SchedulingClientError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Scheduled session as exposed by the scheduling service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEventView {
    pub id: i64,
    pub educator_id: String,
    pub product_id: i64,
    pub title: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub canceled: bool,
}

/// Read access to scheduled sessions
#[async_trait]
pub trait ScheduledEventSource: Send + Sync {
    /// `Ok(None)` when the session does not exist
    async fn fetch_scheduled_event(
        &self,
        id: i64,
    ) -> Result<Option<ScheduledEventView>, SchedulingClientError>;
}

#[derive(Clone)]
pub struct HttpSchedulingClient {
    base_url: String,
    http_client: Client,
}

impl HttpSchedulingClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SchedulingClientError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedulingClientError::Http(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }
}

#[async_trait]
impl ScheduledEventSource for HttpSchedulingClient {
    async fn fetch_scheduled_event(
        &self,
        id: i64,
    ) -> Result<Option<ScheduledEventView>, SchedulingClientError> {
        let url = format!("{}/api/scheduled-events/{}", self.base_url, id);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| SchedulingClientError::Http(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<ScheduledEventView>()
                .await
                .map(Some)
                .map_err(|e| SchedulingClientError::Decode(e.to_string())),
            status => Err(SchedulingClientError::UnexpectedStatus(status.as_u16())),
        }
    }
}
