//! Open options for OrdStore
//!
//! Provides tuning presets for different deployment classes and
//! builder-style setters for the open-time flags.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::comparator::{BytewiseComparator, KeyComparator};
use crate::error::{StoreError, StoreResult};

/// Durability requested for a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Acknowledged once the OS holds the bytes. May be lost on power failure.
    #[default]
    Buffered,
    /// Acknowledged only after the log reaches persistent storage.
    Sync,
}

/// Options accepted by `Engine::open`.
#[derive(Clone)]
pub struct Options {
    /// Create the store if the directory holds none
    pub create_if_missing: bool,
    /// Fail if a store already exists at the path
    pub error_if_exists: bool,
    /// Fail open on a corrupt log record instead of skipping it
    pub paranoid_checks: bool,
    /// Key order; must match the order the store was created with
    pub comparator: Arc<dyn KeyComparator>,
    /// Log segment rotation threshold (bytes)
    pub wal_rotation_size_bytes: u64,
    /// Maximum read views open at once
    pub max_open_snapshots: usize,
    /// Log volume that makes the background compactor write a checkpoint
    pub checkpoint_trigger_bytes: u64,
    /// How often the background compactor checks the log volume
    pub compaction_cadence: Duration,
    /// Run the background compactor
    pub background_compaction: bool,
}

impl Options {
    /// Server-class: large log segments, generous snapshot budget
    pub fn server() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: true,
            comparator: Arc::new(BytewiseComparator),
            wal_rotation_size_bytes: 64 * 1024 * 1024,
            max_open_snapshots: 4096,
            checkpoint_trigger_bytes: 256 * 1024 * 1024,
            compaction_cadence: Duration::from_secs(30),
            background_compaction: false,
        }
    }

    /// Embedded-class: small segments, tight snapshot budget, frequent checkpoints
    pub fn embedded() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: true,
            comparator: Arc::new(BytewiseComparator),
            wal_rotation_size_bytes: 8 * 1024 * 1024,
            max_open_snapshots: 256,
            checkpoint_trigger_bytes: 32 * 1024 * 1024,
            compaction_cadence: Duration::from_secs(10),
            background_compaction: false,
        }
    }

    /// Set `create_if_missing`.
    pub fn create_if_missing(mut self, yes: bool) -> Self {
        self.create_if_missing = yes;
        self
    }

    /// Set `error_if_exists`.
    pub fn error_if_exists(mut self, yes: bool) -> Self {
        self.error_if_exists = yes;
        self
    }

    /// Set `paranoid_checks`.
    pub fn paranoid_checks(mut self, yes: bool) -> Self {
        self.paranoid_checks = yes;
        self
    }

    /// Install a custom key order.
    pub fn with_comparator(mut self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Enable or disable the background compactor.
    pub fn background_compaction(mut self, yes: bool) -> Self {
        self.background_compaction = yes;
        self
    }

    /// Validate all tuning parameters
    pub fn validate(&self) -> StoreResult<()> {
        if self.wal_rotation_size_bytes < 64 * 1024 {
            return Err(StoreError::InvalidOptions(
                "wal_rotation_size_bytes must be >= 64KB".into(),
            ));
        }
        if self.max_open_snapshots == 0 {
            return Err(StoreError::InvalidOptions("max_open_snapshots must be > 0".into()));
        }
        if self.checkpoint_trigger_bytes < self.wal_rotation_size_bytes {
            return Err(StoreError::InvalidOptions(
                "checkpoint_trigger_bytes must be >= wal_rotation_size_bytes".into(),
            ));
        }
        if self.compaction_cadence.as_millis() == 0 {
            return Err(StoreError::InvalidOptions("compaction_cadence must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::server()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("comparator", &self.comparator.name())
            .field("wal_rotation_size_bytes", &self.wal_rotation_size_bytes)
            .field("max_open_snapshots", &self.max_open_snapshots)
            .field("checkpoint_trigger_bytes", &self.checkpoint_trigger_bytes)
            .field("compaction_cadence", &self.compaction_cadence)
            .field("background_compaction", &self.background_compaction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Options::server().validate().is_ok());
        assert!(Options::embedded().validate().is_ok());
    }

    #[test]
    fn test_tier_ordering() {
        let s = Options::server();
        let e = Options::embedded();
        assert!(s.max_open_snapshots > e.max_open_snapshots);
        assert!(s.wal_rotation_size_bytes > e.wal_rotation_size_bytes);
    }

    #[test]
    fn test_builder_setters() {
        let opts = Options::default()
            .create_if_missing(false)
            .error_if_exists(true)
            .paranoid_checks(false)
            .background_compaction(true);
        assert!(!opts.create_if_missing);
        assert!(opts.error_if_exists);
        assert!(!opts.paranoid_checks);
        assert!(opts.background_compaction);
        assert!(format!("{:?}", opts).contains("ordstore.BytewiseComparator"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut opts = Options::default();
        opts.max_open_snapshots = 0;
        assert!(matches!(opts.validate(), Err(StoreError::InvalidOptions(_))));

        let mut opts = Options::default();
        opts.checkpoint_trigger_bytes = opts.wal_rotation_size_bytes - 1;
        assert!(opts.validate().is_err());

        let mut opts = Options::default();
        opts.compaction_cadence = Duration::ZERO;
        assert!(opts.validate().is_err());
    }
}
