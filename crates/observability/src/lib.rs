//! Process-wide tracing setup shared by the docket binaries.

/// Initialize process-wide tracing, picking the output format from
/// `DOCKET_LOG_FORMAT` (`json` by default, `pretty` for humans).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use crate::tracing::LogFormat;
