//! Custody store configuration
//!
//! The keyring is provisioned once, at construction, and handed to
//! [`KeyShareCustody::new`](crate::KeyShareCustody::new). Operations never
//! read keys from the environment themselves.

use crate::envelope::{EncryptionKey, Keyring};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable holding the active key (64 hex chars)
pub const ENV_KEY: &str = "KEYSHARE_CUSTODY_KEY";
/// Environment variable holding comma-separated retired keys
pub const ENV_RETIRED_KEYS: &str = "KEYSHARE_CUSTODY_RETIRED_KEYS";
/// Environment variable selecting the create policy (`strict` or `upsert`)
pub const ENV_CREATE_POLICY: &str = "KEYSHARE_CUSTODY_CREATE_POLICY";
/// Environment variable selecting the delete policy (`strict` or `idempotent`)
pub const ENV_DELETE_POLICY: &str = "KEYSHARE_CUSTODY_DELETE_POLICY";
/// Environment variable holding the per-operation timeout in milliseconds (`0` disables)
pub const ENV_TIMEOUT_MS: &str = "KEYSHARE_CUSTODY_TIMEOUT_MS";

/// Default per-operation timeout
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// What `create` does when the owner already has a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatePolicy {
    /// Reject with `DuplicateRecord`
    #[default]
    Strict,
    /// Replace the existing record, same as `update`
    Upsert,
}

impl FromStr for CreatePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(CreatePolicy::Strict),
            "upsert" => Ok(CreatePolicy::Upsert),
            other => Err(Error::InvalidConfig(format!("unknown create policy: {}", other))),
        }
    }
}

impl fmt::Display for CreatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreatePolicy::Strict => write!(f, "strict"),
            CreatePolicy::Upsert => write!(f, "upsert"),
        }
    }
}

/// What `delete` does when the owner has no record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Fail with `NotFound`
    #[default]
    Strict,
    /// Succeed without doing anything
    Idempotent,
}

impl FromStr for DeletePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(DeletePolicy::Strict),
            "idempotent" => Ok(DeletePolicy::Idempotent),
            other => Err(Error::InvalidConfig(format!("unknown delete policy: {}", other))),
        }
    }
}

impl fmt::Display for DeletePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletePolicy::Strict => write!(f, "strict"),
            DeletePolicy::Idempotent => write!(f, "idempotent"),
        }
    }
}

/// Custody store configuration
#[derive(Debug, Clone)]
pub struct CustodyConfig {
    /// Keys used to seal and open envelopes
    pub keyring: Keyring,
    /// Duplicate handling for `create`
    pub create_policy: CreatePolicy,
    /// Missing-record handling for `delete`
    pub delete_policy: DeletePolicy,
    /// Upper bound on each operation, `None` for no bound
    pub operation_timeout: Option<Duration>,
}

impl CustodyConfig {
    /// Create a configuration with `key` active and default policies
    pub fn new(key: EncryptionKey) -> Self {
        Self {
            keyring: Keyring::new(key),
            create_policy: CreatePolicy::default(),
            delete_policy: DeletePolicy::default(),
            operation_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
        }
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = lookup(ENV_KEY)
            .ok_or_else(|| Error::InvalidConfig(format!("{} is not set", ENV_KEY)))?;
        let mut config = Self::new(EncryptionKey::from_hex(&key)?);

        if let Some(retired) = lookup(ENV_RETIRED_KEYS) {
            for key in retired.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                config = config.with_retired_key(EncryptionKey::from_hex(key)?);
            }
        }
        if let Some(policy) = lookup(ENV_CREATE_POLICY) {
            config.create_policy = policy.parse()?;
        }
        if let Some(policy) = lookup(ENV_DELETE_POLICY) {
            config.delete_policy = policy.parse()?;
        }
        if let Some(ms) = lookup(ENV_TIMEOUT_MS) {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("{} must be an integer", ENV_TIMEOUT_MS)))?;
            config.operation_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    /// Keep a retired key so envelopes sealed under it stay readable
    pub fn with_retired_key(mut self, key: EncryptionKey) -> Self {
        self.keyring = self.keyring.with_retired(key);
        self
    }

    /// Set the create policy
    pub fn with_create_policy(mut self, policy: CreatePolicy) -> Self {
        self.create_policy = policy;
        self
    }

    /// Set the delete policy
    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// Set the per-operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Disable the per-operation timeout
    pub fn without_timeout(mut self) -> Self {
        self.operation_timeout = None;
        self
    }

    /// Check the configuration for values that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig(
                "operation timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
