//! Error types for key-share custody operations

use std::fmt;
use thiserror::Error;

/// Result type alias for custody operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a sealed envelope could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionFailureKind {
    /// Envelope is truncated or does not start with the expected magic
    Malformed,
    /// Envelope format version is not one this build understands
    UnsupportedVersion(u8),
    /// Envelope names an encryption scheme this build does not implement
    UnsupportedScheme(u8),
    /// Envelope was sealed under a key that is not in the keyring
    UnknownKey,
    /// Authentication tag did not verify (corruption or tampering)
    Tampered,
}

impl DecryptionFailureKind {
    /// True when the failure points at key provisioning rather than stored data
    pub fn is_key_problem(&self) -> bool {
        matches!(self, DecryptionFailureKind::UnknownKey)
    }
}

impl fmt::Display for DecryptionFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecryptionFailureKind::Malformed => write!(f, "malformed envelope"),
            DecryptionFailureKind::UnsupportedVersion(v) => {
                write!(f, "unsupported envelope version {}", v)
            }
            DecryptionFailureKind::UnsupportedScheme(s) => {
                write!(f, "unsupported encryption scheme {}", s)
            }
            DecryptionFailureKind::UnknownKey => write!(f, "sealed under a key not in the keyring"),
            DecryptionFailureKind::Tampered => write!(f, "authentication failed"),
        }
    }
}

/// Errors that can occur during custody operations
#[derive(Debug, Error)]
pub enum Error {
    // ============ Record Errors ============
    /// No record exists for the owner
    #[error("Key share not found: {0}")]
    NotFound(String),

    /// A record already exists for the owner
    #[error("Key share already exists: {0}")]
    DuplicateRecord(String),

    // ============ Cryptographic Errors ============
    /// Ciphertext is present but cannot be opened with the configured keys
    #[error("Decryption failed for {owner}: {kind}")]
    DecryptionFailure {
        owner: String,
        kind: DecryptionFailureKind,
    },

    /// Decrypted bytes are not a valid share payload
    #[error("Deserialization failed for {owner}: {reason}")]
    DeserializationFailure { owner: String, reason: String },

    /// Sealing a payload failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    // ============ Backend Errors ============
    /// The persistence backend could not be reached or timed out
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // ============ Input Errors ============
    /// Owner identifier failed validation
    #[error("Invalid owner id: {0}")]
    InvalidOwnerId(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A share payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Check whether the caller may retry the operation
    ///
    /// Only backend availability problems qualify. Decryption and
    /// deserialization failures will not change on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }

    /// Check if this is the ordinary missing-record outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(feature = "sled")]
impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}
