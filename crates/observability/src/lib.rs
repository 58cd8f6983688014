//! Tracing/logging setup shared by the relay binaries.

/// Initialize process-wide tracing/logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (format, filters).
pub mod tracing;

pub use self::tracing::{LogFormat, init_with};
