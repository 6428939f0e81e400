//! Tracing/logging setup shared by the worker binary and tests.

/// Initialize process-wide tracing with `default_level` as the fallback filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(default_level: &str) {
    tracing::init(default_level);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
