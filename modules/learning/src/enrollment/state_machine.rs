//! Enrollment lifecycle
//!
//! ```text
//! Active --PAYMENT_COMPLETED--> Completed
//! Active --BOOKING_CANCELED / admin cancel--> Canceled
//! Active --EVENT_SCHEDULED--> Active (session window attached)
//! ```
//!
//! Completed and Canceled are terminal. Any trigger on a terminal enrollment
//! is ignored, which is what keeps out-of-order delivery safe.

use chrono::{DateTime, Utc};

use crate::models::{Enrollment, EnrollmentStatus};
use crate::repos::Mutation;

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    PaymentCompleted,
    BookingCanceled,
    AdminCancel,
    SessionScheduled {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Transition {
        from: EnrollmentStatus,
        to: EnrollmentStatus,
        at: DateTime<Utc>,
    },
    AttachSession {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    /// Enrollment is terminal; acknowledge without effect
    Ignore { status: EnrollmentStatus },
}

impl Decision {
    /// True when this decision completes the enrollment
    pub fn completes(&self) -> bool {
        matches!(
            self,
            Decision::Transition {
                to: EnrollmentStatus::Completed,
                ..
            }
        )
    }

    pub fn into_mutation(self, enrollment_id: uuid::Uuid) -> Option<Mutation> {
        match self {
            Decision::Transition { from, to, at } => Some(Mutation::Transition {
                enrollment_id,
                from,
                to,
                at,
            }),
            Decision::AttachSession { start, end, at } => Some(Mutation::AttachSession {
                enrollment_id,
                start,
                end,
                at,
            }),
            Decision::Ignore { .. } => None,
        }
    }
}

impl Enrollment {
    /// Decide how `trigger` affects this enrollment. Pure.
    pub fn decide(&self, trigger: &Trigger, now: DateTime<Utc>) -> Decision {
        if self.status.is_terminal() {
            return Decision::Ignore {
                status: self.status,
            };
        }

        // Never move updated_at backward
        let at = now.max(self.updated_at);

        match trigger {
            Trigger::PaymentCompleted => Decision::Transition {
                from: self.status,
                to: EnrollmentStatus::Completed,
                at,
            },
            Trigger::BookingCanceled | Trigger::AdminCancel => Decision::Transition {
                from: self.status,
                to: EnrollmentStatus::Canceled,
                at,
            },
            Trigger::SessionScheduled { start, end } => Decision::AttachSession {
                start: *start,
                end: *end,
                at,
            },
        }
    }
}
