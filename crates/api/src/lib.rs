//! HTTP API: routing and request/response mapping over the job system.

pub mod app;
