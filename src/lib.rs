//! Driftsync workspace root
//!
//! This crate serves as the root of the driftsync workspace and contains
//! integration tests that exercise interactions between the member crates.

// Re-export major components for integration testing
pub use drift_blocks as blocks;
pub use drift_model as model;
pub use drift_proto as proto;
