//! # Key-Share Custody Core
//!
//! Encrypted at-rest custody for MPC key shares, one record per owning
//! profile.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Envelope encryption**: ChaCha20-Poly1305 with a versioned header that
//!   names the scheme and the sealing key's fingerprint
//! - **Custody service**: create / get / update / delete with explicit
//!   duplicate and missing-record policies
//! - **Backends**: in-memory, file system and (feature `sled`) embedded KV,
//!   behind one async trait
//! - **Key rotation**: a re-encrypt-all pass that never overwrites a
//!   concurrent writer
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keyshare_custody_core::{CustodyConfig, KeyShareCustody, OwnerId};
//! use keyshare_custody_core::backend::FileSystemBackend;
//!
//! // Key comes from KEYSHARE_CUSTODY_KEY
//! let config = CustodyConfig::from_env()?;
//! let custody = KeyShareCustody::new(FileSystemBackend::new("/var/lib/shares")?, config)?;
//!
//! let owner = OwnerId::new("profile-1")?;
//! custody.create(&owner, &share_after_keygen).await?;
//!
//! // Later, in the signing flow
//! let share: MyShare = custody.require(&owner).await?;
//! ```
//!
//! ## Security Model
//!
//! - Shares are opaque: serialized on write, deserialized on read, never
//!   inspected
//! - The owner id is authenticated data, so envelopes cannot be swapped
//!   between owners
//! - Plaintext buffers and keys are zeroized on drop
//! - Key material, plaintext and ciphertext are never logged

pub mod backend;
pub mod config;
pub mod envelope;
pub mod error;
pub mod store;
pub mod types;

pub use backend::{FileSystemBackend, MemoryBackend, RecordBackend};
pub use config::{CreatePolicy, CustodyConfig, DeletePolicy};
pub use envelope::{EncryptionKey, KeyId, Keyring};
pub use error::{DecryptionFailureKind, Error, Result};
pub use store::{KeyShareCustody, RotationFailure, RotationReport};
pub use types::{
    EnvelopeInfo, KeyShareRecord, OwnerId, RecordMetadata, SharePayload, WriteOutcome,
};

#[cfg(feature = "sled")]
pub use backend::SledBackend;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
