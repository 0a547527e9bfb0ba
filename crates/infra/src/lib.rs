//! Infrastructure layer: job storage, queueing, workers and configuration.

pub mod config;
pub mod jobs;
