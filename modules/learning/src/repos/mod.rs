pub mod inmemory_store;
pub mod pg_store;
pub mod store;

pub use inmemory_store::InMemoryEnrollmentStore;
pub use pg_store::PgEnrollmentStore;
pub use store::{
    CommitOutcome, EnrollmentStore, LedgerEntry, Mutation, OutboxRecord, PendingOutbox,
    StoreError, StoreResult, UnitOfWork,
};
