//! The base types shared by the tracer and its sinks.

pub mod types;
pub use types::*;

#[cfg(any(test, feature = "test_support"))]
pub mod proptest_strategies;
