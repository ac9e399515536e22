pub mod service;
pub mod state_machine;

pub use service::{EnrollmentError, EnrollmentService, EventTarget};
pub use state_machine::{Decision, Trigger};
