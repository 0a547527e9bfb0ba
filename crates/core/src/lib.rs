//! `docket-core`: job lifecycle domain.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! job identity, the status state machine and the persisted job record.

pub mod error;
pub mod id;
pub mod job;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{DEFAULT_QUERY, ExpectedState, JobRecord, JobStatus, JobStatusView};
