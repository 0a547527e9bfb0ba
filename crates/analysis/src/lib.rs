//! `docket-analysis`
//!
//! **Responsibility:** boundary to the external document-analysis collaborator.
//!
//! This crate is intentionally **not** part of the job lifecycle:
//! - It never reads or writes job records.
//! - It does not retry; retry policy lives with the worker side.
//! - It only turns `(file_ref, query)` into result text or an error.

pub mod analyzer;
pub mod error;
pub mod http;

pub use analyzer::{AnalysisRequest, Analyzer};
pub use error::AnalysisError;
pub use http::HttpAnalyzer;
