//! Invariant tests module
//!
//! - At most one record per owner
//! - Replacements are all-or-nothing
//! - Tampering never yields plaintext

pub mod custody_invariant;
