//! Invariant tests for the custody store
//!
//! These tests verify guarantees that must hold under concurrency:
//! - At most one record per owner
//! - Concurrent replacements leave exactly one of the written values
//! - Readers never observe a partial or blended write
//! - Owners are fully independent

use keyshare_custody_core::{
    CustodyConfig, EncryptionKey, Error, FileSystemBackend, KeyShareCustody, MemoryBackend,
    OwnerId, RecordBackend,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Share {
    writer: u32,
    /// Large enough that a torn write would be visible
    body: Vec<u32>,
}

impl Share {
    fn from_writer(writer: u32) -> Self {
        Self {
            writer,
            body: vec![writer; 2048],
        }
    }

    fn is_consistent(&self) -> bool {
        self.body.len() == 2048 && self.body.iter().all(|&v| v == self.writer)
    }
}

fn owner(s: &str) -> OwnerId {
    OwnerId::new(s).unwrap()
}

fn memory_custody() -> Arc<KeyShareCustody<MemoryBackend>> {
    Arc::new(
        KeyShareCustody::new(
            MemoryBackend::new(),
            CustodyConfig::new(EncryptionKey::generate()),
        )
        .unwrap(),
    )
}

fn fs_custody() -> (Arc<KeyShareCustody<FileSystemBackend>>, std::path::PathBuf) {
    let dir = std::env::temp_dir().join(format!("keyshare-invariant-{}", rand::random::<u64>()));
    let custody = KeyShareCustody::new(
        FileSystemBackend::new(&dir).unwrap(),
        CustodyConfig::new(EncryptionKey::generate()),
    )
    .unwrap();
    (Arc::new(custody), dir)
}

// ============================================================================
// Uniqueness
// ============================================================================

async fn racing_creates<B: RecordBackend + 'static>(custody: Arc<KeyShareCustody<B>>) {
    let profile = owner("profile-1");

    let handles: Vec<_> = (0..16)
        .map(|writer| {
            let custody = Arc::clone(&custody);
            let profile = profile.clone();
            tokio::spawn(async move { custody.create(&profile, &Share::from_writer(writer)).await })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(Error::DuplicateRecord(_)) => {}
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }

    assert_eq!(created, 1, "exactly one create must win");
    assert_eq!(custody.list_owners().await.unwrap(), vec![profile.clone()]);
    let stored: Share = custody.require(&profile).await.unwrap();
    assert!(stored.is_consistent());
}

/// INVARIANT: Concurrent creates for one owner produce exactly one record
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invariant_single_record_per_owner_memory() {
    racing_creates(memory_custody()).await;
}

/// INVARIANT: Concurrent creates for one owner produce exactly one record on disk
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invariant_single_record_per_owner_fs() {
    let (custody, dir) = fs_custody();
    racing_creates(custody).await;
    std::fs::remove_dir_all(&dir).ok();
}

// ============================================================================
// Atomic Replacement
// ============================================================================

async fn racing_updates<B: RecordBackend + 'static>(custody: Arc<KeyShareCustody<B>>) {
    let profile = owner("profile-1");
    custody
        .create(&profile, &Share::from_writer(0))
        .await
        .unwrap();

    let writers: Vec<_> = (1..=2)
        .map(|writer| {
            let custody = Arc::clone(&custody);
            let profile = profile.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    custody
                        .update(&profile, &Share::from_writer(writer))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let custody = Arc::clone(&custody);
        let profile = profile.clone();
        tokio::spawn(async move {
            for _ in 0..60 {
                let seen: Share = custody.require(&profile).await.unwrap();
                assert!(seen.is_consistent(), "reader saw a blended share");
                assert!(seen.writer <= 2);
                tokio::task::yield_now().await;
            }
        })
    };

    for handle in writers {
        handle.await.unwrap();
    }
    reader.await.unwrap();

    let last: Share = custody.require(&profile).await.unwrap();
    assert!(last.is_consistent());
    assert!(last.writer == 1 || last.writer == 2);
}

/// INVARIANT: Two concurrent updates leave exactly one of the two values
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invariant_concurrent_updates_memory() {
    racing_updates(memory_custody()).await;
}

/// INVARIANT: Two concurrent updates leave exactly one of the two values on disk
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invariant_concurrent_updates_fs() {
    let (custody, dir) = fs_custody();
    racing_updates(custody).await;
    std::fs::remove_dir_all(&dir).ok();
}

// ============================================================================
// Independence
// ============================================================================

/// INVARIANT: Operations on different owners do not affect each other
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invariant_owners_are_independent() {
    let custody = memory_custody();

    let handles: Vec<_> = (0..32u32)
        .map(|i| {
            let custody = Arc::clone(&custody);
            tokio::spawn(async move {
                let profile = owner(&format!("profile-{}", i));
                custody.create(&profile, &Share::from_writer(i)).await.unwrap();
                custody
                    .update(&profile, &Share::from_writer(i + 100))
                    .await
                    .unwrap();
                if i % 2 == 0 {
                    custody.delete(&profile).await.unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(custody.list_owners().await.unwrap().len(), 16);
    for i in 0..32u32 {
        let share: Option<Share> = custody.get(&owner(&format!("profile-{}", i))).await.unwrap();
        if i % 2 == 0 {
            assert!(share.is_none());
        } else {
            assert_eq!(share.unwrap(), Share::from_writer(i + 100));
        }
    }
}
