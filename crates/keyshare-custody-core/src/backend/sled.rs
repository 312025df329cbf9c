//! Embedded sled backend
//!
//! Records live in a dedicated tree keyed by the raw owner id. Every write is
//! a compare-and-swap on the stored value and is flushed before returning.
//! Tree calls block, so they run on tokio's blocking pool.

use super::RecordBackend;
use crate::error::DecryptionFailureKind;
use crate::types::{KeyShareRecord, OwnerId, WriteOutcome};
use crate::{Error, Result};
use async_trait::async_trait;
use sled::IVec;
use std::path::Path;
use tracing::warn;

const TREE_NAME: &str = "key_shares";

/// Sled-backed record store
#[derive(Debug, Clone)]
pub struct SledBackend {
    tree: sled::Tree,
}

impl SledBackend {
    /// Open (or create) a database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            tree: db.open_tree(TREE_NAME)?,
        })
    }

    /// Open a throwaway database that is deleted on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            tree: db.open_tree(TREE_NAME)?,
        })
    }

    fn encode(record: &KeyShareRecord) -> Result<Vec<u8>> {
        serde_json::to_vec(record).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode(owner: &OwnerId, bytes: &IVec) -> Result<KeyShareRecord> {
        serde_json::from_slice(bytes).map_err(|e| {
            warn!(owner = %owner, error = %e, "Unreadable key share record");
            Error::DecryptionFailure {
                owner: owner.to_string(),
                kind: DecryptionFailureKind::Malformed,
            }
        })
    }

    /// Run a tree operation on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&sled::Tree) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tree = self.tree.clone();
        tokio::task::spawn_blocking(move || op(&tree))
            .await
            .map_err(|e| Error::StoreUnavailable(format!("sled task failed: {}", e)))?
    }

    async fn flush(&self) -> Result<()> {
        self.tree.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl RecordBackend for SledBackend {
    async fn insert(&self, record: KeyShareRecord) -> Result<()> {
        let bytes = Self::encode(&record)?;
        let owner = record.owner_id;

        let swapped = self
            .blocking({
                let owner = owner.clone();
                move |tree: &sled::Tree| {
                    Ok(tree
                        .compare_and_swap(owner.as_bytes(), None as Option<&[u8]>, Some(bytes))?
                        .is_ok())
                }
            })
            .await?;

        if !swapped {
            return Err(Error::DuplicateRecord(owner.to_string()));
        }
        self.flush().await
    }

    async fn upsert(&self, owner: &OwnerId, ciphertext: Vec<u8>) -> Result<WriteOutcome> {
        let owner = owner.clone();
        let outcome = self
            .blocking(move |tree| loop {
                let current = tree.get(owner.as_bytes())?;

                let (record, outcome) = match current.as_ref().map(|b| Self::decode(&owner, b)) {
                    Some(Ok(existing)) => (
                        existing.replaced_with(ciphertext.clone()),
                        WriteOutcome::Replaced,
                    ),
                    // An unreadable value is overwritten rather than blocking the replace.
                    Some(Err(_)) => (
                        KeyShareRecord::new(owner.clone(), ciphertext.clone()),
                        WriteOutcome::Replaced,
                    ),
                    None => (
                        KeyShareRecord::new(owner.clone(), ciphertext.clone()),
                        WriteOutcome::Created,
                    ),
                };

                let swapped =
                    tree.compare_and_swap(owner.as_bytes(), current, Some(Self::encode(&record)?))?;
                if swapped.is_ok() {
                    return Ok(outcome);
                }
            })
            .await?;

        self.flush().await?;
        Ok(outcome)
    }

    async fn get(&self, owner: &OwnerId) -> Result<Option<KeyShareRecord>> {
        let owner = owner.clone();
        self.blocking(move |tree| {
            tree.get(owner.as_bytes())?
                .map(|bytes| Self::decode(&owner, &bytes))
                .transpose()
        })
        .await
    }

    async fn remove(&self, owner: &OwnerId) -> Result<bool> {
        let owner = owner.clone();
        let removed = self
            .blocking(move |tree| Ok(tree.remove(owner.as_bytes())?.is_some()))
            .await?;
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn replace_if_unchanged(
        &self,
        owner: &OwnerId,
        expected: &[u8],
        ciphertext: Vec<u8>,
    ) -> Result<bool> {
        let owner = owner.clone();
        let expected = expected.to_vec();

        let swapped = self
            .blocking(move |tree| {
                let Some(current) = tree.get(owner.as_bytes())? else {
                    return Ok(false);
                };

                let record = Self::decode(&owner, &current)?;
                if record.ciphertext != expected {
                    return Ok(false);
                }

                let replacement = Self::encode(&record.replaced_with(ciphertext))?;
                Ok(tree
                    .compare_and_swap(owner.as_bytes(), Some(current), Some(replacement))?
                    .is_ok())
            })
            .await?;

        if swapped {
            self.flush().await?;
        }
        Ok(swapped)
    }

    async fn list_owners(&self) -> Result<Vec<OwnerId>> {
        self.blocking(|tree| {
            let mut owners = Vec::new();
            for key in tree.iter().keys() {
                let key = key?;
                match String::from_utf8(key.to_vec()).ok().and_then(|id| OwnerId::new(id).ok()) {
                    Some(owner) => owners.push(owner),
                    None => warn!(key = %hex::encode(&key), "Skipping unrecognized sled key"),
                }
            }
            // sled iterates in key order, which already matches OwnerId ordering
            Ok(owners)
        })
        .await
    }

    async fn exists(&self, owner: &OwnerId) -> Result<bool> {
        let owner = owner.clone();
        self.blocking(move |tree| Ok(tree.contains_key(owner.as_bytes())?))
            .await
    }
}
