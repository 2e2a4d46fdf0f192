//! Common test utilities for integration tests.

pub mod fakes;
pub mod fixtures;

// Re-export common types
pub use fakes::*;
pub use fixtures::*;
