//! Unit tests module
//!
//! - Custody operations
//! - Backend contract

pub mod backend_test;
