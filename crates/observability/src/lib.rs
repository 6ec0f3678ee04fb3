//! Process-wide tracing/logging setup for embedders.

/// Tracing configuration (filters, output format).
pub mod tracing;

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize with an explicit fallback filter instead of `info`.
pub fn init_with_default(default_filter: &str) {
    tracing::init_with_default(default_filter);
}
