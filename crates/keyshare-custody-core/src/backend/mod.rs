//! Persistence backends for sealed key-share records
//!
//! A backend only ever sees sealed envelopes. It must provide the primitives
//! the custody store relies on for its ordering guarantees:
//!
//! - unique insert (`insert` fails with [`Error::DuplicateRecord`])
//! - atomic single-record replace or insert (`upsert`)
//! - point lookup (`get`)
//! - removal (`remove`)
//! - compare-and-swap on the ciphertext (`replace_if_unchanged`), used by key
//!   rotation so a concurrent writer is never overwritten
//!
//! Available backends:
//!
//! - **MemoryBackend**: DashMap-backed, for tests and single-process use
//! - **FileSystemBackend**: one file per owner, atomic rename/link
//! - **SledBackend**: embedded key-value store (feature `sled`)
//!
//! [`Error::DuplicateRecord`]: crate::Error::DuplicateRecord

use crate::types::{KeyShareRecord, OwnerId, WriteOutcome};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub mod fs;
pub mod memory;
#[cfg(feature = "sled")]
pub mod sled;

pub use fs::FileSystemBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "sled")]
pub use self::sled::SledBackend;

/// Storage contract for sealed key-share records
#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// Insert a new record
    ///
    /// Fails with `DuplicateRecord` if the owner already has one.
    async fn insert(&self, record: KeyShareRecord) -> Result<()>;

    /// Replace the ciphertext for `owner`, or insert a record if none exists
    ///
    /// The creation timestamp of an existing record is preserved.
    async fn upsert(&self, owner: &OwnerId, ciphertext: Vec<u8>) -> Result<WriteOutcome>;

    /// Look up the record for `owner`
    async fn get(&self, owner: &OwnerId) -> Result<Option<KeyShareRecord>>;

    /// Remove the record for `owner`, returning whether one existed
    async fn remove(&self, owner: &OwnerId) -> Result<bool>;

    /// Replace the ciphertext only if it still equals `expected`
    ///
    /// Returns `false` when the record is gone or holds different bytes.
    async fn replace_if_unchanged(
        &self,
        owner: &OwnerId,
        expected: &[u8],
        ciphertext: Vec<u8>,
    ) -> Result<bool>;

    /// All owners with a stored record, sorted
    async fn list_owners(&self) -> Result<Vec<OwnerId>>;

    /// Check whether `owner` has a record
    async fn exists(&self, owner: &OwnerId) -> Result<bool> {
        Ok(self.get(owner).await?.is_some())
    }
}

#[async_trait]
impl<T: RecordBackend + ?Sized> RecordBackend for Arc<T> {
    async fn insert(&self, record: KeyShareRecord) -> Result<()> {
        (**self).insert(record).await
    }

    async fn upsert(&self, owner: &OwnerId, ciphertext: Vec<u8>) -> Result<WriteOutcome> {
        (**self).upsert(owner, ciphertext).await
    }

    async fn get(&self, owner: &OwnerId) -> Result<Option<KeyShareRecord>> {
        (**self).get(owner).await
    }

    async fn remove(&self, owner: &OwnerId) -> Result<bool> {
        (**self).remove(owner).await
    }

    async fn replace_if_unchanged(
        &self,
        owner: &OwnerId,
        expected: &[u8],
        ciphertext: Vec<u8>,
    ) -> Result<bool> {
        (**self).replace_if_unchanged(owner, expected, ciphertext).await
    }

    async fn list_owners(&self) -> Result<Vec<OwnerId>> {
        (**self).list_owners().await
    }

    async fn exists(&self, owner: &OwnerId) -> Result<bool> {
        (**self).exists(owner).await
    }
}
