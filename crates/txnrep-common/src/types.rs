//! Core type definitions for txnrep
//!
//! Identifiers, sequence numbers and replica roles shared by the state
//! manager and the replication seams it talks to.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Log sequence number
pub type Lsn = i64;

/// Sentinel for an LSN that has not been assigned yet
pub const INVALID_LSN: Lsn = -1;

/// LSN of the very first record in a replica's log
pub const ZERO_LSN: Lsn = 0;

/// Identifier of a state provider within a replica
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct StateProviderId(i64);

impl StateProviderId {
    /// Create from a raw value
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for StateProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateProviderId({})", self.0)
    }
}

/// Identifier of a replicated transaction
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct TransactionId(i64);

impl TransactionId {
    /// Transaction id used by internal lock acquisitions that are not tied to a user transaction
    pub const INVALID: Self = Self(0);

    /// Create from a raw value
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Whether this id belongs to a real transaction
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

/// Role of the hosting replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Default)]
pub enum ReplicaRole {
    #[default]
    Unknown,
    None,
    Primary,
    IdleSecondary,
    ActiveSecondary,
}

/// Partition read or write access status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum AccessStatus {
    Granted,
    ReconfigurationPending,
    NotPrimary,
    NoWriteQuorum,
}

/// Identity of a replica within a partition, used as the trace prefix
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionedReplicaId {
    pub partition_id: Uuid,
    pub replica_id: i64,
}

impl PartitionedReplicaId {
    #[must_use]
    pub const fn new(partition_id: Uuid, replica_id: i64) -> Self {
        Self {
            partition_id,
            replica_id,
        }
    }

    /// Generate an identity with a random partition id
    #[must_use]
    pub fn random(replica_id: i64) -> Self {
        Self::new(Uuid::new_v4(), replica_id)
    }

    /// Partition id rendered without hyphens, as used in legacy folder names
    #[must_use]
    pub fn partition_simple(&self) -> String {
        self.partition_id.simple().to_string()
    }
}

impl fmt::Debug for PartitionedReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionedReplicaId({self})")
    }
}

impl fmt::Display for PartitionedReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition_id, self.replica_id)
    }
}
