//! Key-share custody service
//!
//! [`KeyShareCustody`] is the in-process entry point used by wallet and
//! session services. It turns a share value into a sealed envelope, hands the
//! envelope to a [`RecordBackend`], and reverses the process on read.
//!
//! ## Guarantees
//!
//! - At most one record per owner (`create` is a unique insert unless
//!   [`CreatePolicy::Upsert`] is configured)
//! - `update` is a single atomic upsert in the backend; readers never observe
//!   a partial write
//! - Decryption and deserialization failures are reported as distinct errors
//! - No retries are performed here; `StoreUnavailable` is left to the caller
//!
//! ## Example
//!
//! ```rust,ignore
//! use keyshare_custody_core::{CustodyConfig, EncryptionKey, KeyShareCustody, OwnerId};
//! use keyshare_custody_core::backend::MemoryBackend;
//!
//! let config = CustodyConfig::new(EncryptionKey::from_hex(&key_hex)?);
//! let custody = KeyShareCustody::new(MemoryBackend::new(), config)?;
//!
//! let owner = OwnerId::new("profile-1")?;
//! custody.create(&owner, &share).await?;
//! let share: Option<MyShare> = custody.get(&owner).await?;
//! ```

use crate::backend::RecordBackend;
use crate::config::{CreatePolicy, CustodyConfig, DeletePolicy};
use crate::envelope::{EncryptionKey, EnvelopeHeader, KeyId, Keyring};
use crate::error::DecryptionFailureKind;
use crate::types::{KeyShareRecord, OwnerId, RecordMetadata, SharePayload, WriteOutcome};
use crate::{Error, Result};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

/// A record that could not be re-sealed during rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationFailure {
    /// Owner of the record
    pub owner_id: OwnerId,
    /// Why the record could not be opened
    pub reason: String,
}

/// Outcome of a re-encrypt-all pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    /// Fingerprint of the key records were sealed to
    pub active_key_id: String,
    /// Records re-sealed under the active key
    pub resealed: usize,
    /// Records already under the active key
    pub already_current: usize,
    /// Records deleted between listing and re-sealing
    pub vanished: usize,
    /// Records changed by another writer while being re-sealed
    pub changed_concurrently: Vec<OwnerId>,
    /// Records that could not be opened with any key in the keyring
    pub failed: Vec<RotationFailure>,
}

impl RotationReport {
    /// True when every record is now sealed under the active key
    ///
    /// Concurrently changed records were written by another handle and may
    /// still carry an older key; run [`KeyShareCustody::reseal_all`] again.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.changed_concurrently.is_empty()
    }

    fn record_failure(&mut self, owner_id: OwnerId, kind: DecryptionFailureKind) {
        warn!(owner = %owner_id, kind = %kind, "Record could not be re-sealed");
        self.failed.push(RotationFailure {
            owner_id,
            reason: kind.to_string(),
        });
    }
}

/// Encrypted key-share custody store
#[derive(Debug)]
pub struct KeyShareCustody<B: RecordBackend> {
    backend: B,
    config: CustodyConfig,
}

impl<B: RecordBackend> KeyShareCustody<B> {
    /// Create a custody store over `backend`
    pub fn new(backend: B, config: CustodyConfig) -> Result<Self> {
        config.validate()?;

        info!(
            active_key = %config.keyring.active_key_id(),
            retired_keys = config.keyring.retired_key_ids().len(),
            create_policy = %config.create_policy,
            delete_policy = %config.delete_policy,
            "Key share custody initialized"
        );

        Ok(Self { backend, config })
    }

    /// The underlying backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Active configuration
    pub fn config(&self) -> &CustodyConfig {
        &self.config
    }

    /// Fingerprint of the key new envelopes are sealed with
    pub fn active_key_id(&self) -> KeyId {
        self.config.keyring.active_key_id()
    }

    fn keyring(&self) -> &Keyring {
        &self.config.keyring
    }

    /// Run a backend call under the configured operation timeout
    ///
    /// The inner future is polled before the deadline is checked, so a write
    /// the backend has already acknowledged is always reported as success.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.config.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| timed_out(operation, limit))?,
            None => fut.await,
        }
    }

    fn seal<S: SharePayload>(&self, owner_id: &OwnerId, share: &S) -> Result<Vec<u8>> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(share).map_err(|e| Error::Serialization(e.to_string()))?,
        );
        self.keyring().seal(owner_id, &plaintext)
    }

    fn open_record(&self, record: &KeyShareRecord) -> Result<Zeroizing<Vec<u8>>> {
        self.keyring()
            .open(&record.owner_id, &record.ciphertext)
            .map_err(|kind| {
                warn!(
                    kind = %kind,
                    key_problem = kind.is_key_problem(),
                    "Key share could not be decrypted"
                );
                Error::DecryptionFailure {
                    owner: record.owner_id.to_string(),
                    kind,
                }
            })
    }

    fn decode<S: SharePayload>(&self, record: &KeyShareRecord) -> Result<S> {
        let plaintext = self.open_record(record)?;
        serde_json::from_slice(&plaintext).map_err(|e| {
            warn!(error = %e, "Decrypted key share is not a valid payload");
            Error::DeserializationFailure {
                owner: record.owner_id.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Store the first key share for `owner_id`
    ///
    /// Fails with `DuplicateRecord` if one already exists, unless the store is
    /// configured with [`CreatePolicy::Upsert`].
    ///
    /// A `StoreUnavailable` timeout does not mean nothing was written: the
    /// backend may still commit the record after the deadline. A retried
    /// create can then fail with `DuplicateRecord`; check with
    /// [`exists`](Self::exists) or use [`update`](Self::update) instead.
    #[instrument(skip(self, owner_id, share), fields(owner = %owner_id))]
    pub async fn create<S: SharePayload>(
        &self,
        owner_id: &OwnerId,
        share: &S,
    ) -> Result<WriteOutcome> {
        let envelope = self.seal(owner_id, share)?;

        let outcome = match self.config.create_policy {
            CreatePolicy::Strict => {
                let record = KeyShareRecord::new(owner_id.clone(), envelope);
                self.bounded("create", self.backend.insert(record))
                    .await
                    .map(|()| WriteOutcome::Created)
            }
            CreatePolicy::Upsert => {
                self.bounded("create", self.backend.upsert(owner_id, envelope))
                    .await
            }
        }
        .inspect_err(|e| warn!(error = %e, "Key share create failed"))?;

        info!(outcome = %outcome, "Key share stored");
        Ok(outcome)
    }

    /// Load and decrypt the key share for `owner_id`
    ///
    /// A missing record is `Ok(None)`, not an error.
    #[instrument(skip(self, owner_id), fields(owner = %owner_id))]
    pub async fn get<S: SharePayload>(&self, owner_id: &OwnerId) -> Result<Option<S>> {
        let record = self
            .bounded("get", self.backend.get(owner_id))
            .await
            .inspect_err(|e| warn!(error = %e, "Key share lookup failed"))?;

        match record {
            Some(record) => {
                debug!("Key share loaded");
                self.decode(&record).map(Some)
            }
            None => {
                debug!("Key share not found");
                Ok(None)
            }
        }
    }

    /// Like [`get`](Self::get), but a missing record is `NotFound`
    pub async fn require<S: SharePayload>(&self, owner_id: &OwnerId) -> Result<S> {
        self.get(owner_id)
            .await?
            .ok_or_else(|| Error::NotFound(owner_id.to_string()))
    }

    /// Replace the key share for `owner_id`, creating it if absent
    ///
    /// If this times out the write may still land after the deadline.
    /// Retrying with the same share is safe.
    #[instrument(skip(self, owner_id, share), fields(owner = %owner_id))]
    pub async fn update<S: SharePayload>(
        &self,
        owner_id: &OwnerId,
        share: &S,
    ) -> Result<WriteOutcome> {
        let envelope = self.seal(owner_id, share)?;

        let outcome = self
            .bounded("update", self.backend.upsert(owner_id, envelope))
            .await
            .inspect_err(|e| warn!(error = %e, "Key share update failed"))?;

        info!(outcome = %outcome, "Key share replaced");
        Ok(outcome)
    }

    /// Remove the key share for `owner_id`
    ///
    /// Returns whether a record was removed. Under [`DeletePolicy::Strict`] a
    /// missing record is `NotFound`; under [`DeletePolicy::Idempotent`] it is
    /// `Ok(false)`.
    #[instrument(skip(self, owner_id), fields(owner = %owner_id))]
    pub async fn delete(&self, owner_id: &OwnerId) -> Result<bool> {
        let removed = self
            .bounded("delete", self.backend.remove(owner_id))
            .await
            .inspect_err(|e| warn!(error = %e, "Key share delete failed"))?;

        if removed {
            info!("Key share deleted");
            return Ok(true);
        }

        match self.config.delete_policy {
            DeletePolicy::Strict => {
                debug!("Delete of missing key share rejected");
                Err(Error::NotFound(owner_id.to_string()))
            }
            DeletePolicy::Idempotent => {
                debug!("Delete of missing key share ignored");
                Ok(false)
            }
        }
    }

    /// Check whether `owner_id` has a stored share
    pub async fn exists(&self, owner_id: &OwnerId) -> Result<bool> {
        self.bounded("exists", self.backend.exists(owner_id)).await
    }

    /// Describe the stored record without decrypting it
    pub async fn metadata(&self, owner_id: &OwnerId) -> Result<Option<RecordMetadata>> {
        let record = self.bounded("metadata", self.backend.get(owner_id)).await?;

        Ok(record.map(|record| RecordMetadata {
            envelope: EnvelopeHeader::parse(&record.ciphertext)
                .ok()
                .map(|h| h.info()),
            ciphertext_len: record.ciphertext.len(),
            owner_id: record.owner_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }))
    }

    /// Owners with a stored share, sorted
    pub async fn list_owners(&self) -> Result<Vec<OwnerId>> {
        self.bounded("list_owners", self.backend.list_owners()).await
    }

    /// Make `new_key` active and re-seal every record under it
    ///
    /// The previous active key is kept as a retired key so records not yet
    /// re-sealed stay readable. Drop it with
    /// [`prune_retired_keys`](Self::prune_retired_keys) once the report is
    /// complete.
    #[instrument(skip(self, new_key), fields(new_key = %new_key.key_id()))]
    pub async fn rotate_key(&mut self, new_key: EncryptionKey) -> Result<RotationReport> {
        self.config.keyring.rotate(new_key)?;
        info!(
            retired_keys = self.config.keyring.retired_key_ids().len(),
            "Encryption key rotated, re-sealing records"
        );
        self.reseal_all().await
    }

    /// Re-seal every record not already under the active key
    ///
    /// Safe to run repeatedly: records under the active key are skipped, and
    /// a record changed by another writer mid-pass is left alone and reported.
    #[instrument(skip(self))]
    pub async fn reseal_all(&mut self) -> Result<RotationReport> {
        let active = self.active_key_id();
        let mut report = RotationReport {
            active_key_id: active.to_string(),
            ..Default::default()
        };

        for owner_id in self.list_owners().await? {
            let record = match self.bounded("reseal", self.backend.get(&owner_id)).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    report.vanished += 1;
                    continue;
                }
                Err(Error::DecryptionFailure { kind, .. }) => {
                    report.record_failure(owner_id, kind);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if EnvelopeHeader::parse(&record.ciphertext).is_ok_and(|h| h.key_id == active) {
                report.already_current += 1;
                continue;
            }

            let plaintext = match self.keyring().open(&owner_id, &record.ciphertext) {
                Ok(plaintext) => plaintext,
                Err(kind) => {
                    report.record_failure(owner_id, kind);
                    continue;
                }
            };

            let envelope = self.keyring().seal(&owner_id, &plaintext)?;
            let swapped = self
                .bounded(
                    "reseal",
                    self.backend
                        .replace_if_unchanged(&owner_id, &record.ciphertext, envelope),
                )
                .await;

            match swapped {
                Ok(true) => report.resealed += 1,
                Ok(false) => {
                    debug!(owner = %owner_id, "Record changed during re-seal");
                    report.changed_concurrently.push(owner_id);
                }
                Err(Error::DecryptionFailure { kind, .. }) => {
                    report.record_failure(owner_id, kind);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            resealed = report.resealed,
            already_current = report.already_current,
            vanished = report.vanished,
            changed = report.changed_concurrently.len(),
            failed = report.failed.len(),
            "Re-seal pass finished"
        );
        Ok(report)
    }

    /// Forget retired keys, returning how many were dropped
    ///
    /// Any record still sealed under a dropped key becomes a
    /// `DecryptionFailure` with
    /// [`DecryptionFailureKind::UnknownKey`].
    pub fn prune_retired_keys(&mut self) -> usize {
        let dropped = self.config.keyring.prune_retired();
        if dropped > 0 {
            warn!(dropped, "Retired encryption keys dropped");
        }
        dropped
    }
}

fn timed_out(operation: &str, limit: Duration) -> Error {
    warn!(operation, limit_ms = limit.as_millis() as u64, "Custody operation timed out");
    Error::StoreUnavailable(format!("{} timed out after {:?}", operation, limit))
}
