//! Process-wide tracing setup shared by the worker and tools.

/// Install the global subscriber. Safe to call more than once.
pub fn init() {
    self::tracing::init();
}

/// Subscriber configuration (filter, output format).
pub mod tracing;

pub use self::tracing::LogFormat;
