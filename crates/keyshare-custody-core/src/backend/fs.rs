//! File system record backend
//!
//! One JSON file per owner under a base directory. File names are the hex
//! encoding of the owner id, so distinct owners never collide and no owner id
//! can escape the directory.
//!
//! Writes go to a temporary file first:
//!
//! - `insert` hard-links the temporary file into place, which fails if the
//!   target exists, giving unique insert without a lock
//! - `upsert` renames over the target, which replaces it atomically
//! - `remove` renames the target away before wiping and unlinking it
//!
//! Readers therefore only ever see a complete old file, a complete new file,
//! or no file. Compare-and-swap is serialized within the process by a write
//! lock; it is not safe against a second process writing the same directory.
//!
//! Once the link or rename has committed, cleanup of the temporary file is
//! best-effort. Leftovers are swept the next time the directory is opened.

use super::RecordBackend;
use crate::error::DecryptionFailureKind;
use crate::types::{KeyShareRecord, OwnerId, WriteOutcome};
use crate::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const SHARE_EXTENSION: &str = "share";
const TEMP_EXTENSION: &str = "tmp";

/// File system store for local deployments
#[derive(Debug)]
pub struct FileSystemBackend {
    /// Base directory for storing records
    base_path: PathBuf,
    /// Serializes compare-and-swap against other writers in this process
    write_lock: Mutex<()>,
}

impl FileSystemBackend {
    /// Open a backend rooted at `base_path`, creating the directory if needed
    ///
    /// Temporary files left behind by an interrupted write or delete are
    /// wiped and removed.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();

        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        sweep_temp_files(&base_path)?;

        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the record files
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the file path for an owner
    fn record_path(&self, owner: &OwnerId) -> PathBuf {
        self.base_path
            .join(format!("{}.{}", hex::encode(owner.as_bytes()), SHARE_EXTENSION))
    }

    fn temp_path(&self) -> PathBuf {
        let suffix: [u8; 16] = rand::random();
        self.base_path
            .join(format!(".{}.{}", hex::encode(suffix), TEMP_EXTENSION))
    }

    /// Write `record` to a fresh temporary file with owner-only permissions
    ///
    /// The file is synced before returning so the commit that follows never
    /// exposes an unflushed record.
    async fn write_temp(&self, record: &KeyShareRecord) -> Result<PathBuf> {
        let path = self.temp_path();
        let data = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let written = async {
            let mut file = options.open(&path).await?;
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            discard(&path).await;
            return Err(e.into());
        }
        Ok(path)
    }

    async fn read_record(&self, owner: &OwnerId) -> Result<Option<KeyShareRecord>> {
        let data = match tokio::fs::read(self.record_path(owner)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: KeyShareRecord = serde_json::from_slice(&data).map_err(|e| {
            warn!(owner = %owner, error = %e, "Unreadable key share record file");
            Error::DecryptionFailure {
                owner: owner.to_string(),
                kind: DecryptionFailureKind::Malformed,
            }
        })?;

        if &record.owner_id != owner {
            warn!(owner = %owner, stored = %record.owner_id, "Record file owner mismatch");
            return Err(Error::DecryptionFailure {
                owner: owner.to_string(),
                kind: DecryptionFailureKind::Malformed,
            });
        }

        Ok(Some(record))
    }

    /// Atomically move a temporary file over the record path
    async fn commit_replace(&self, temp: &Path, owner: &OwnerId) -> Result<()> {
        if let Err(e) = tokio::fs::rename(temp, self.record_path(owner)).await {
            discard(temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Overwrite a file with zeros, then unlink it
///
/// A file that is still hard-linked as a record is only unlinked.
async fn wipe_and_remove(path: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(path).await?;
    if !is_linked_elsewhere(&meta) {
        tokio::fs::write(path, vec![0u8; meta.len() as usize]).await?;
    }
    tokio::fs::remove_file(path).await?;
    Ok(())
}

#[cfg(unix)]
fn is_linked_elsewhere(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    meta.nlink() > 1
}

#[cfg(not(unix))]
fn is_linked_elsewhere(_meta: &std::fs::Metadata) -> bool {
    true
}

/// Best-effort removal of a temporary file after its write has committed
async fn discard(path: &Path) {
    if let Err(e) = wipe_and_remove(path).await {
        warn!(path = %path.display(), error = %e, "Temporary file left behind");
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some(TEMP_EXTENSION)
        && path
            .file_name()
            .and_then(|s| s.to_str())
            .is_some_and(|name| name.starts_with('.'))
}

/// Wipe and remove temporary files from an earlier run
fn sweep_temp_files(base_path: &Path) -> Result<()> {
    for entry in std::fs::read_dir(base_path)? {
        let path = entry?.path();
        if !path.is_file() || !is_temp_file(&path) {
            continue;
        }

        let swept = std::fs::metadata(&path)
            .and_then(|meta| {
                if is_linked_elsewhere(&meta) {
                    Ok(())
                } else {
                    std::fs::write(&path, vec![0u8; meta.len() as usize])
                }
            })
            .and_then(|()| std::fs::remove_file(&path));
        match swept {
            Ok(()) => debug!(path = %path.display(), "Swept stale temporary file"),
            Err(e) => warn!(path = %path.display(), error = %e, "Could not sweep temporary file"),
        }
    }
    Ok(())
}

#[async_trait]
impl RecordBackend for FileSystemBackend {
    async fn insert(&self, record: KeyShareRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let temp = self.write_temp(&record).await?;

        let linked = tokio::fs::hard_link(&temp, self.record_path(&record.owner_id)).await;
        if let Err(e) = tokio::fs::remove_file(&temp).await {
            warn!(path = %temp.display(), error = %e, "Temporary file left behind");
        }

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(Error::DuplicateRecord(record.owner_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert(&self, owner: &OwnerId, ciphertext: Vec<u8>) -> Result<WriteOutcome> {
        let _guard = self.write_lock.lock().await;

        // An unreadable existing file is overwritten rather than blocking the replace.
        let existing = match self.read_record(owner).await {
            Ok(existing) => existing,
            Err(Error::DecryptionFailure { .. }) => None,
            Err(e) => return Err(e),
        };

        let (record, outcome) = match existing {
            Some(current) => (current.replaced_with(ciphertext), WriteOutcome::Replaced),
            None => (
                KeyShareRecord::new(owner.clone(), ciphertext),
                WriteOutcome::Created,
            ),
        };

        let temp = self.write_temp(&record).await?;
        self.commit_replace(&temp, owner).await?;
        Ok(outcome)
    }

    async fn get(&self, owner: &OwnerId) -> Result<Option<KeyShareRecord>> {
        self.read_record(owner).await
    }

    async fn remove(&self, owner: &OwnerId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let tombstone = self.temp_path();

        match tokio::fs::rename(self.record_path(owner), &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        // The record is gone once the rename lands
        discard(&tombstone).await;
        Ok(true)
    }

    async fn replace_if_unchanged(
        &self,
        owner: &OwnerId,
        expected: &[u8],
        ciphertext: Vec<u8>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let current = match self.read_record(owner).await? {
            Some(current) if current.ciphertext == expected => current,
            _ => return Ok(false),
        };

        let temp = self.write_temp(&current.replaced_with(ciphertext)).await?;
        self.commit_replace(&temp, owner).await?;
        Ok(true)
    }

    async fn list_owners(&self) -> Result<Vec<OwnerId>> {
        let mut owners = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(SHARE_EXTENSION) {
                continue;
            }

            let owner = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|stem| hex::decode(stem).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .and_then(|id| OwnerId::new(id).ok());

            match owner {
                Some(owner) => owners.push(owner),
                None => warn!(path = %path.display(), "Skipping unrecognized share file"),
            }
        }

        owners.sort();
        Ok(owners)
    }

    async fn exists(&self, owner: &OwnerId) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.record_path(owner)).await?)
    }
}
