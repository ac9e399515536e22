//! Learning service: enrollment lifecycle driven by cross-service events.
//!
//! Inbound events from payment, scheduling and profile services are decoded
//! against the [`events::catalog`], deduplicated through the processed-event
//! ledger and applied to enrollments by [`consumer`] workers. Outbound events
//! go through the transactional outbox.

pub mod booking;
pub mod config;
pub mod consumer;
pub mod db;
pub mod enrollment;
pub mod events;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod repos;
pub mod routes;

pub use consumer::{start_learning_consumers, ConsumerContext, ConsumerSet};
pub use enrollment::{EnrollmentError, EnrollmentService};
pub use events::{EventPublisher, OutboxRelay};
pub use metrics::Metrics;
pub use routes::{learning_router, AppState};
