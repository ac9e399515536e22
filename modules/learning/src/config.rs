use event_bus::RetryConfig;

use crate::events::OUTBOX_BATCH_SIZE;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            _ => {
                tracing::warn!("Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub database_url: String,
    pub nats_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub scheduling_base_url: String,
    pub scheduling_timeout: Duration,
    pub consumer_workers: usize,
    pub retry: RetryConfig,
    pub dlq_subject: String,
    pub publish_timeout: Duration,
    pub outbox_poll_interval: Duration,
    pub outbox_max_retries: i32,
    /// How long a relay may hold claimed outbox rows before another may take them
    pub outbox_claim_lease: Duration,
    pub ledger_retention: Duration,
}

/// Parse `name` if set, otherwise use `default`
fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} has an invalid value: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus_type = BusType::from_env();
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let nats_url = match bus_type {
            BusType::Nats => Some(
                env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            ),
            BusType::InMemory => None,
        };

        let retention_hours = parse_var("LEDGER_RETENTION_HOURS", 168u64)?;
        let ledger_retention = retention_hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("LEDGER_RETENTION_HOURS is too large: {}", retention_hours))?;

        let retry = RetryConfig {
            max_attempts: parse_var("RETRY_MAX_ATTEMPTS", 5u32)?,
            initial_interval: Duration::from_millis(parse_var("RETRY_INITIAL_INTERVAL_MS", 500u64)?),
            multiplier: parse_var("RETRY_MULTIPLIER", 2.0f64)?,
            max_interval: Duration::from_millis(parse_var("RETRY_MAX_INTERVAL_MS", 30_000u64)?),
        };

        let config = Self {
            bus_type,
            database_url,
            nats_url,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_var("PORT", 8095u16)?,
            scheduling_base_url: env::var("SCHEDULING_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8094".to_string()),
            scheduling_timeout: Duration::from_millis(parse_var("SCHEDULING_TIMEOUT_MS", 2000u64)?),
            consumer_workers: parse_var("CONSUMER_WORKERS", 4usize)?,
            retry,
            dlq_subject: env::var("DLQ_SUBJECT").unwrap_or_else(|_| "learning.dlq".to_string()),
            publish_timeout: Duration::from_millis(parse_var("PUBLISH_TIMEOUT_MS", 5000u64)?),
            outbox_poll_interval: Duration::from_millis(parse_var("OUTBOX_POLL_INTERVAL_MS", 1000u64)?),
            outbox_max_retries: parse_var("OUTBOX_MAX_RETRIES", 5i32)?,
            outbox_claim_lease: Duration::from_secs(parse_var("OUTBOX_CLAIM_LEASE_SECS", 900u64)?),
            ledger_retention,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the consumer cannot run safely with
    pub fn validate(&self) -> Result<(), String> {
        if self.retry.max_attempts == 0 {
            return Err("RETRY_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err("RETRY_MULTIPLIER must be a finite number >= 1.0".to_string());
        }
        if self.retry.initial_interval > self.retry.max_interval {
            return Err("RETRY_INITIAL_INTERVAL_MS must not exceed RETRY_MAX_INTERVAL_MS".to_string());
        }
        if self.consumer_workers == 0 {
            return Err("CONSUMER_WORKERS must be at least 1".to_string());
        }
        if self.outbox_max_retries < 1 {
            return Err("OUTBOX_MAX_RETRIES must be at least 1".to_string());
        }
        // A full batch of timed-out publishes must finish inside one lease
        let batch_span = self
            .publish_timeout
            .saturating_mul(u32::try_from(OUTBOX_BATCH_SIZE).unwrap_or(u32::MAX));
        if self.outbox_claim_lease <= batch_span {
            return Err(format!(
                "OUTBOX_CLAIM_LEASE_SECS ({}s) must exceed {} publish timeouts ({}s)",
                self.outbox_claim_lease.as_secs(),
                OUTBOX_BATCH_SIZE,
                batch_span.as_secs()
            ));
        }
        // A ledger entry must outlive every possible redelivery of its event
        if self.ledger_retention < self.retry.worst_case_span() {
            return Err(format!(
                "LEDGER_RETENTION_HOURS ({}h) is shorter than the worst-case redelivery span ({}s)",
                self.ledger_retention.as_secs() / 3600,
                self.retry.worst_case_span().as_secs()
            ));
        }
        Ok(())
    }
}
