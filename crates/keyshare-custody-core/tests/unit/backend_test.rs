//! Backend contract tests
//!
//! Every backend must give the custody store the same primitives, so the
//! same checks run against each implementation.

use keyshare_custody_core::{
    Error, FileSystemBackend, KeyShareRecord, MemoryBackend, OwnerId, RecordBackend, WriteOutcome,
};
use std::path::PathBuf;

fn owner(s: &str) -> OwnerId {
    OwnerId::new(s).unwrap()
}

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("keyshare-contract-{}", rand::random::<u64>()))
}

async fn check_contract<B: RecordBackend>(backend: &B) {
    let alice = owner("alice");
    let bob = owner("bob");

    // Point lookup on an empty store
    assert!(backend.get(&alice).await.unwrap().is_none());
    assert!(!backend.exists(&alice).await.unwrap());

    // Unique insert
    backend
        .insert(KeyShareRecord::new(alice.clone(), vec![1; 40]))
        .await
        .unwrap();
    assert!(matches!(
        backend
            .insert(KeyShareRecord::new(alice.clone(), vec![2; 40]))
            .await,
        Err(Error::DuplicateRecord(_))
    ));
    assert_eq!(backend.get(&alice).await.unwrap().unwrap().ciphertext, vec![1; 40]);

    // Upsert replaces or creates
    let created_at = backend.get(&alice).await.unwrap().unwrap().created_at;
    assert_eq!(
        backend.upsert(&alice, vec![3; 40]).await.unwrap(),
        WriteOutcome::Replaced
    );
    let replaced = backend.get(&alice).await.unwrap().unwrap();
    assert_eq!(replaced.ciphertext, vec![3; 40]);
    assert_eq!(replaced.created_at, created_at);

    assert_eq!(
        backend.upsert(&bob, vec![4; 40]).await.unwrap(),
        WriteOutcome::Created
    );

    // Compare-and-swap
    assert!(
        !backend
            .replace_if_unchanged(&alice, &[1; 40], vec![5; 40])
            .await
            .unwrap()
    );
    assert!(
        backend
            .replace_if_unchanged(&alice, &[3; 40], vec![5; 40])
            .await
            .unwrap()
    );
    assert_eq!(backend.get(&alice).await.unwrap().unwrap().ciphertext, vec![5; 40]);

    // Listing
    assert_eq!(backend.list_owners().await.unwrap(), vec![alice.clone(), bob.clone()]);

    // Removal
    assert!(backend.remove(&alice).await.unwrap());
    assert!(!backend.remove(&alice).await.unwrap());
    assert!(backend.get(&alice).await.unwrap().is_none());
    assert!(
        !backend
            .replace_if_unchanged(&alice, &[5; 40], vec![6; 40])
            .await
            .unwrap()
    );
    assert_eq!(backend.list_owners().await.unwrap(), vec![bob]);
}

#[tokio::test]
async fn test_memory_backend_contract() {
    check_contract(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn test_file_system_backend_contract() {
    let dir = temp_dir();
    let backend = FileSystemBackend::new(&dir).unwrap();
    check_contract(&backend).await;
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_arc_backend_contract() {
    let backend = std::sync::Arc::new(MemoryBackend::new());
    check_contract(&backend).await;
}

#[cfg(feature = "sled")]
#[tokio::test]
async fn test_sled_backend_contract() {
    let backend = keyshare_custody_core::SledBackend::temporary().unwrap();
    check_contract(&backend).await;
}

#[tokio::test]
async fn test_file_system_leaves_no_temp_files() {
    let dir = temp_dir();
    let backend = FileSystemBackend::new(&dir).unwrap();
    let alice = owner("alice");

    backend
        .insert(KeyShareRecord::new(alice.clone(), vec![1]))
        .await
        .unwrap();
    let _ = backend
        .insert(KeyShareRecord::new(alice.clone(), vec![2]))
        .await;
    backend.upsert(&alice, vec![3]).await.unwrap();
    backend.remove(&alice).await.unwrap();

    let leftovers = std::fs::read_dir(&dir).unwrap().count();
    assert_eq!(leftovers, 0);

    std::fs::remove_dir_all(&dir).ok();
}
