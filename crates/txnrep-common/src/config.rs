//! Configuration types for txnrep
//!
//! This module defines the configuration consumed by the state manager.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// State manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StateManagerConfig {
    /// Runtime work directory; each replica gets its own folder beneath it
    pub work_dir: PathBuf,
    /// Whether the replica persists state to disk
    pub has_persisted_state: bool,
    /// Structural operation replication retry policy
    pub replication: ReplicationRetryConfig,
    /// Checkpoint file behavior
    pub checkpoint: CheckpointConfig,
    /// Warn when removing unreferenced provider folders takes longer than this
    pub slow_cleanup_warn_ms: u64,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/txnrep"),
            has_persisted_state: true,
            replication: ReplicationRetryConfig::default(),
            checkpoint: CheckpointConfig::default(),
            slow_cleanup_warn_ms: 30_000,
        }
    }
}

impl StateManagerConfig {
    /// Config rooted at `work_dir` with all other values at their defaults
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    /// Threshold after which unreferenced folder cleanup is reported as slow
    #[must_use]
    pub const fn slow_cleanup_warn(&self) -> Duration {
        Duration::from_millis(self.slow_cleanup_warn_ms)
    }
}

/// Exponential backoff applied while the replicator reports contention
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationRetryConfig {
    /// First backoff interval in milliseconds
    pub starting_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,
    /// Number of retries between two diagnostic events
    pub max_retry_count: u32,
}

impl Default for ReplicationRetryConfig {
    fn default() -> Self {
        Self {
            starting_backoff_ms: 16,
            max_backoff_ms: 4096,
            max_retry_count: 16,
        }
    }
}

impl ReplicationRetryConfig {
    #[must_use]
    pub const fn starting_backoff(&self) -> Duration {
        Duration::from_millis(self.starting_backoff_ms)
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Next backoff interval after `current`, doubled and capped
    #[must_use]
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff())
    }
}

/// Checkpoint file configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Verify the body checksum when reading a checkpoint
    pub verify_checksum: bool,
    /// fsync the temporary file before it is swapped in
    pub sync_on_write: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            sync_on_write: true,
        }
    }
}
