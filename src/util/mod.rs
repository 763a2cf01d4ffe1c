//! Utilities shared by the metaspace and the collection set chooser.

/// Size constants and poison patterns.
pub mod constants;
/// Alignment and unit conversion helpers.
pub mod conversions;
/// The built-in logger.
pub mod logger;
/// Runtime options.
pub mod options;
/// Fixtures for tests and benchmarks.
#[cfg(any(test, feature = "test_private"))]
pub mod test_util;
