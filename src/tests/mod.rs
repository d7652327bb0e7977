//! Test modules for pagewatch
//!
//! Tests that need a mock HTTP server or several modules at once live here.
//! Tests are organized by the module they test.

#[cfg(test)]
pub mod polling_tests;
