//! Sealed envelope format for stored key shares
//!
//! Every ciphertext written by the custody store is a self-describing
//! envelope:
//!
//! ```text
//! +-------+---------+--------+---------+----------+----------------------+
//! | magic | version | scheme | key id  |  nonce   | ciphertext || tag    |
//! | "KS"  |   u8    |   u8   | 8 bytes | 12 bytes | len(plaintext) + 16  |
//! +-------+---------+--------+---------+----------+----------------------+
//! ```
//!
//! The whole header and the owner id are fed to ChaCha20-Poly1305 as
//! associated data, so a flipped header byte, a flipped ciphertext byte, or an
//! envelope moved under a different owner all fail authentication.
//!
//! The key id is a truncated SHA-256 fingerprint of the sealing key. It lets
//! [`Keyring::open`] report "sealed under a key we do not hold" separately
//! from "tag check failed", which point to different operator actions.

use crate::error::DecryptionFailureKind;
use crate::types::{EnvelopeInfo, OwnerId};
use crate::{Error, Result};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Envelope magic bytes
pub const MAGIC: [u8; 2] = *b"KS";

/// Current envelope format version
pub const FORMAT_VERSION: u8 = 1;

/// Scheme id for ChaCha20-Poly1305 with a random 96-bit nonce
pub const SCHEME_CHACHA20_POLY1305: u8 = 1;

/// Length of a key fingerprint
pub const KEY_ID_LEN: usize = 8;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Total header length: magic, version, scheme, key id, nonce
pub const HEADER_LEN: usize = 2 + 1 + 1 + KEY_ID_LEN + NONCE_LEN;

const KEY_ID_DOMAIN: &[u8] = b"keyshare-custody:key-id:v1";

/// Fingerprint of an encryption key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId([u8; KEY_ID_LEN]);

impl KeyId {
    /// Raw fingerprint bytes
    pub fn as_bytes(&self) -> &[u8; KEY_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A 256-bit symmetric key for sealing key shares
///
/// Wiped from memory on drop. `Debug` prints only the fingerprint.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a key from 64 hex characters
    pub fn from_hex(s: &str) -> Result<Self> {
        let decoded = Zeroizing::new(hex::decode(s.trim())?);
        let bytes: [u8; 32] = decoded.as_slice().try_into().map_err(|_| {
            Error::InvalidConfig(format!(
                "encryption key must be 32 bytes, got {}",
                decoded.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Generate a random key
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Hex encoding of the key, for handing to an operator once
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }

    /// Fingerprint stored in envelope headers
    pub fn key_id(&self) -> KeyId {
        let mut hasher = Sha256::new();
        hasher.update(KEY_ID_DOMAIN);
        hasher.update(self.0);
        let digest = hasher.finalize();

        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&digest[..KEY_ID_LEN]);
        KeyId(id)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.0).into())
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key_id", &self.key_id().to_string())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Parsed envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub version: u8,
    pub scheme: u8,
    pub key_id: KeyId,
    pub nonce: [u8; NONCE_LEN],
}

impl EnvelopeHeader {
    /// Parse the header without checking version or scheme
    pub fn parse(envelope: &[u8]) -> std::result::Result<Self, DecryptionFailureKind> {
        if envelope.len() < HEADER_LEN + TAG_LEN || envelope[..2] != MAGIC {
            return Err(DecryptionFailureKind::Malformed);
        }

        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&envelope[4..4 + KEY_ID_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&envelope[4 + KEY_ID_LEN..HEADER_LEN]);

        Ok(Self {
            version: envelope[2],
            scheme: envelope[3],
            key_id: KeyId(key_id),
            nonce,
        })
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..2].copy_from_slice(&MAGIC);
        out[2] = self.version;
        out[3] = self.scheme;
        out[4..4 + KEY_ID_LEN].copy_from_slice(&self.key_id.0);
        out[4 + KEY_ID_LEN..].copy_from_slice(&self.nonce);
        out
    }

    /// Header fields for metadata views
    pub fn info(&self) -> EnvelopeInfo {
        EnvelopeInfo {
            version: self.version,
            scheme: self.scheme,
            key_id: self.key_id.to_string(),
        }
    }
}

fn associated_data(header: &[u8], owner: &OwnerId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + owner.as_bytes().len());
    aad.extend_from_slice(header);
    aad.extend_from_slice(owner.as_bytes());
    aad
}

/// The set of keys the store may use
///
/// New envelopes are always sealed with the active key. Retired keys only
/// open envelopes written before a rotation finished.
#[derive(Debug, Clone)]
pub struct Keyring {
    active: EncryptionKey,
    retired: Vec<EncryptionKey>,
}

impl Keyring {
    /// Create a keyring with a single active key
    pub fn new(active: EncryptionKey) -> Self {
        Self {
            active,
            retired: Vec::new(),
        }
    }

    /// Add a retired key that may still open older envelopes
    pub fn with_retired(mut self, key: EncryptionKey) -> Self {
        let id = key.key_id();
        if id != self.active.key_id() && !self.retired.iter().any(|k| k.key_id() == id) {
            self.retired.push(key);
        }
        self
    }

    /// Fingerprint of the active key
    pub fn active_key_id(&self) -> KeyId {
        self.active.key_id()
    }

    /// Fingerprints of the retired keys
    pub fn retired_key_ids(&self) -> Vec<KeyId> {
        self.retired.iter().map(EncryptionKey::key_id).collect()
    }

    /// Make `new_key` active and retire the current one
    pub fn rotate(&mut self, new_key: EncryptionKey) -> Result<()> {
        let new_id = new_key.key_id();
        if new_id == self.active.key_id() {
            return Err(Error::InvalidConfig(
                "new key is already the active key".into(),
            ));
        }

        self.retired.retain(|k| k.key_id() != new_id);
        let old = std::mem::replace(&mut self.active, new_key);
        self.retired.push(old);
        Ok(())
    }

    /// Drop every retired key
    pub fn prune_retired(&mut self) -> usize {
        let n = self.retired.len();
        self.retired.clear();
        n
    }

    fn find(&self, id: &KeyId) -> Option<&EncryptionKey> {
        std::iter::once(&self.active)
            .chain(self.retired.iter())
            .find(|k| &k.key_id() == id)
    }

    /// Seal a plaintext for `owner` under the active key
    pub fn seal(&self, owner: &OwnerId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let header = EnvelopeHeader {
            version: FORMAT_VERSION,
            scheme: SCHEME_CHACHA20_POLY1305,
            key_id: self.active.key_id(),
            nonce: rand::random(),
        };
        let header_bytes = header.encode();
        let aad = associated_data(&header_bytes, owner);

        let ciphertext = self
            .active
            .cipher()
            .encrypt(
                Nonce::from_slice(&header.nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut envelope = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        envelope.extend_from_slice(&header_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Open an envelope written for `owner`
    pub fn open(
        &self,
        owner: &OwnerId,
        envelope: &[u8],
    ) -> std::result::Result<Zeroizing<Vec<u8>>, DecryptionFailureKind> {
        let header = EnvelopeHeader::parse(envelope)?;

        if header.version != FORMAT_VERSION {
            return Err(DecryptionFailureKind::UnsupportedVersion(header.version));
        }
        if header.scheme != SCHEME_CHACHA20_POLY1305 {
            return Err(DecryptionFailureKind::UnsupportedScheme(header.scheme));
        }

        let key = self
            .find(&header.key_id)
            .ok_or(DecryptionFailureKind::UnknownKey)?;

        let aad = associated_data(&envelope[..HEADER_LEN], owner);
        key.cipher()
            .decrypt(
                Nonce::from_slice(&header.nonce),
                Payload {
                    msg: &envelope[HEADER_LEN..],
                    aad: &aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| DecryptionFailureKind::Tampered)
    }
}
