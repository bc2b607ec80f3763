//! Runtime configuration for the sync engine.
//!
//! `SyncSettings` holds every tunable of the cache, queue, lock and
//! orchestrator. Values come from defaults, an optional JSON file, and
//! `KICKOFF_*` environment overrides, in that order.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::normalize_text_option;

const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 4_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_STALE_LOCK_MS: u64 = 30_000;
const DEFAULT_RETENTION_HOURS: u64 = 7 * 24;
const DEFAULT_KEEP_FINISHED: usize = 20;
const DEFAULT_CLAIM_LEASE_MS: u64 = 120_000;

/// Tunables for cache, queue, lock and orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Upper bound for remote reads on the read path
    pub remote_timeout_ms: u64,
    /// Attempts before a mutation moves to the dead-letter set
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Background sync period; `None` disables the timer (wake-ups still work)
    pub sync_interval_secs: Option<u64>,
    pub lock_timeout_ms: u64,
    /// Lock files older than this are treated as abandoned
    pub stale_lock_ms: u64,
    /// Finished live matches younger than this survive quota cleanup
    pub retention_hours: u64,
    /// Newest finished live matches always kept by quota cleanup
    pub keep_finished: usize,
    /// Local storage budget in bytes; `None` means unbounded
    pub quota_bytes: Option<u64>,
    /// A claimed mutation not acknowledged within this window returns to the pending set
    pub claim_lease_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote_timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            sync_interval_secs: Some(DEFAULT_SYNC_INTERVAL_SECS),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            stale_lock_ms: DEFAULT_STALE_LOCK_MS,
            retention_hours: DEFAULT_RETENTION_HOURS,
            keep_finished: DEFAULT_KEEP_FINISHED,
            quota_bytes: None,
            claim_lease_ms: DEFAULT_CLAIM_LEASE_MS,
        }
    }
}

impl SyncSettings {
    /// Parse settings from a JSON document
    pub fn from_json(payload: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(payload)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Apply `KICKOFF_*` environment overrides
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| {
            normalize_text_option(lookup(key)).and_then(|value| value.parse::<u64>().ok())
        };

        if let Some(value) = number("KICKOFF_REMOTE_TIMEOUT_MS") {
            self.remote_timeout_ms = value;
        }
        if let Some(value) = number("KICKOFF_MAX_ATTEMPTS") {
            self.max_attempts = u32::try_from(value).unwrap_or(u32::MAX);
        }
        if let Some(value) = number("KICKOFF_SYNC_INTERVAL_SECS") {
            self.sync_interval_secs = (value > 0).then_some(value);
        }
        if let Some(value) = number("KICKOFF_QUOTA_BYTES") {
            self.quota_bytes = (value > 0).then_some(value);
        }
        if let Some(value) = number("KICKOFF_CLAIM_LEASE_MS") {
            self.claim_lease_ms = value;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(Error::InvalidInput(
                "backoff_max_ms must not be smaller than backoff_base_ms".to_string(),
            ));
        }
        if self.claim_lease_ms <= self.remote_timeout_ms {
            return Err(Error::InvalidInput(
                "claim_lease_ms must be longer than remote_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub const fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_secs.map(Duration::from_secs)
    }

    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub const fn stale_lock_after(&self) -> Duration {
        Duration::from_millis(self.stale_lock_ms)
    }

    pub const fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }

    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    /// Delay before retry number `attempts` (1-based), doubling up to the cap
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Connection settings for the remote store
#[derive(Debug, Clone, Default)]
pub struct RemoteConfig {
    /// Remote database URL (e.g., `libsql://your-db.turso.io`)
    pub url: Option<String>,
    /// Authentication token for remote database
    pub auth_token: Option<String>,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            auth_token: Some(auth_token.into()),
        }
    }

    /// Read `KICKOFF_REMOTE_URL` / `KICKOFF_REMOTE_TOKEN`
    pub fn from_env() -> Self {
        Self {
            url: normalize_text_option(std::env::var("KICKOFF_REMOTE_URL").ok()),
            auth_token: normalize_text_option(std::env::var("KICKOFF_REMOTE_TOKEN").ok()),
        }
    }

    /// Local file URL (`file:/path/to/remote.db`), used for shared-disk setups and tests
    pub fn file_path(&self) -> Option<&str> {
        self.url.as_deref()?.strip_prefix("file:")
    }

    /// A file URL needs no token; network URLs do
    pub fn is_configured(&self) -> bool {
        self.file_path().is_some() || (self.url.is_some() && self.auth_token.is_some())
    }
}
