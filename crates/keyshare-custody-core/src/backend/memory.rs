//! In-memory record backend for testing and single-process deployments

use super::RecordBackend;
use crate::types::{KeyShareRecord, OwnerId, WriteOutcome};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::Arc;

/// In-memory record store
///
/// Each owner maps to one shard entry; writes hold the shard lock for the
/// whole replace, so readers see either the old or the new record.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Arc<DashMap<OwnerId, KeyShareRecord>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are stored
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record (useful for test cleanup)
    pub fn clear(&self) {
        self.records.clear();
    }
}

impl Clone for MemoryBackend {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn insert(&self, record: KeyShareRecord) -> Result<()> {
        match self.records.entry(record.owner_id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateRecord(record.owner_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn upsert(&self, owner: &OwnerId, ciphertext: Vec<u8>) -> Result<WriteOutcome> {
        match self.records.entry(owner.clone()) {
            Entry::Occupied(mut slot) => {
                let replaced = slot.get().replaced_with(ciphertext);
                slot.insert(replaced);
                Ok(WriteOutcome::Replaced)
            }
            Entry::Vacant(slot) => {
                slot.insert(KeyShareRecord::new(owner.clone(), ciphertext));
                Ok(WriteOutcome::Created)
            }
        }
    }

    async fn get(&self, owner: &OwnerId) -> Result<Option<KeyShareRecord>> {
        Ok(self.records.get(owner).map(|r| r.value().clone()))
    }

    async fn remove(&self, owner: &OwnerId) -> Result<bool> {
        Ok(self.records.remove(owner).is_some())
    }

    async fn replace_if_unchanged(
        &self,
        owner: &OwnerId,
        expected: &[u8],
        ciphertext: Vec<u8>,
    ) -> Result<bool> {
        match self.records.get_mut(owner) {
            Some(mut record) if record.ciphertext == expected => {
                let replaced = record.replaced_with(ciphertext);
                *record = replaced;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_owners(&self) -> Result<Vec<OwnerId>> {
        let mut owners: Vec<OwnerId> = self.records.iter().map(|r| r.key().clone()).collect();
        owners.sort();
        Ok(owners)
    }

    async fn exists(&self, owner: &OwnerId) -> Result<bool> {
        Ok(self.records.contains_key(owner))
    }
}
