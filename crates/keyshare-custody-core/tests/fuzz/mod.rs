//! Fuzz tests module

pub mod custody_fuzz;
