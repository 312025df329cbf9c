//! Core types for key-share custody
//!
//! Defines the owner identifier, the stored record, and the metadata view
//! that can be handed out without touching key material.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use std::str::FromStr;

/// Maximum owner identifier length in bytes
pub const MAX_OWNER_ID_LEN: usize = 256;

/// A share value the custody store can hold
///
/// The store never looks inside a share: anything serde can round-trip is
/// accepted and handed back unchanged.
pub trait SharePayload: Serialize + DeserializeOwned + Send + Sync {}

impl<T> SharePayload for T where T: Serialize + DeserializeOwned + Send + Sync {}

/// Identifier of the profile a key share belongs to
///
/// Non-empty, at most [`MAX_OWNER_ID_LEN`] bytes, and free of control
/// characters so it can be logged and used as a storage key safely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

impl OwnerId {
    /// Validate and wrap an owner identifier
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidOwnerId("owner id is empty".into()));
        }
        if id.len() > MAX_OWNER_ID_LEN {
            return Err(Error::InvalidOwnerId(format!(
                "owner id is {} bytes, limit is {}",
                id.len(),
                MAX_OWNER_ID_LEN
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(Error::InvalidOwnerId(
                "owner id contains control characters".into(),
            ));
        }

        Ok(Self(id))
    }

    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes, used as the storage key and as authenticated data
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OwnerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for OwnerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for OwnerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for OwnerId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<OwnerId> for String {
    fn from(id: OwnerId) -> Self {
        id.0
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// One stored key share: the sealed envelope plus audit timestamps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShareRecord {
    /// Owning profile
    pub owner_id: OwnerId,
    /// Sealed envelope (header, nonce, ciphertext and tag)
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    /// When the record was first written
    pub created_at: DateTime<Utc>,
    /// When the ciphertext was last replaced
    pub updated_at: DateTime<Utc>,
}

impl KeyShareRecord {
    /// Build a fresh record stamped with the current time
    pub fn new(owner_id: OwnerId, ciphertext: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            owner_id,
            ciphertext,
            created_at: now,
            updated_at: now,
        }
    }

    /// Produce the replacement for `self`, keeping the creation time
    pub fn replaced_with(&self, ciphertext: Vec<u8>) -> Self {
        Self {
            owner_id: self.owner_id.clone(),
            ciphertext,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

/// Envelope header fields, readable without any key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeInfo {
    /// Envelope format version
    pub version: u8,
    /// Encryption scheme id
    pub scheme: u8,
    /// Hex fingerprint of the sealing key
    pub key_id: String,
}

/// Metadata about a stored share (no sensitive data)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Owning profile
    pub owner_id: OwnerId,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last-replaced timestamp
    pub updated_at: DateTime<Utc>,
    /// Size of the sealed envelope in bytes
    pub ciphertext_len: usize,
    /// Parsed envelope header, `None` if the header is unreadable
    pub envelope: Option<EnvelopeInfo>,
}

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// No record existed; one was inserted
    Created,
    /// An existing record was replaced
    Replaced,
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOutcome::Created => write!(f, "created"),
            WriteOutcome::Replaced => write!(f, "replaced"),
        }
    }
}
