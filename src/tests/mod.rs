//! # Cross-Module Test Suite
//!
//! Scenario tests that exercise the store, calculator and scheduler together.
//! Module-local behavior is tested next to the code it covers.
