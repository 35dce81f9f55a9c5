//! Content-operations workflow core: phase generation and performance
//! snapshots for long-running content strategies.
//!
//! The crate owns the domain model, the SQLite store, the pure metrics
//! algorithms, and the workflow step logic. Vendor clients (search
//! console, keyword intelligence, the reasoning service) and the durable
//! runtime that schedules and retries workflow instances plug in through
//! the traits in [`providers`].

pub mod batcher;
pub mod candidates;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod store;
pub mod workflows;

pub use errors::WorkflowError;
pub use store::{Store, StoreHandle};
