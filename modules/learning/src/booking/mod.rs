pub mod resolver;
pub mod scheduling_client;

pub use resolver::{BookingMetadata, BookingMetadataResolver};
pub use scheduling_client::{
    HttpSchedulingClient, ScheduledEventSource, ScheduledEventView, SchedulingClientError,
};
