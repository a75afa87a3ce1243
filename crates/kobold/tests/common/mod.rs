//! Shared test utilities for kobold integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated test execution with temp directories
//! - Builders for EPUB fixtures and configurations
//! - Doubles for providers and converters

pub mod builders;
pub mod doubles;
pub mod harness;

pub use builders::*;
pub use doubles::*;
pub use harness::TestHarness;
