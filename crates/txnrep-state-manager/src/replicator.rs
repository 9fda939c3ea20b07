//! Seams to the replication layer
//!
//! The state manager does not own a log. Structural operations are appended
//! to a [`Transaction`] supplied by the caller, provider operations are routed
//! to the [`LoggingReplicator`], and access status comes from the hosting
//! [`Partition`].

use crate::operation_data::OperationData;
use crate::transaction_context::StateManagerTransactionContext;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use txnrep_common::{AccessStatus, Lsn, Result, StateProviderId, TransactionId};

/// Opaque per-operation state owned by a state provider
pub type UserContext = Arc<dyn Any + Send + Sync>;

/// Which replica role is applying an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApplyRole {
    Primary,
    Secondary,
    Recovery,
}

/// Direction of an apply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApplyOperation {
    Redo,
    Undo,
    /// Undo of an operation the replica applied beyond the new primary's log
    FalseProgress,
}

/// Role and direction of an apply call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ApplyContext {
    pub role: ApplyRole,
    pub operation: ApplyOperation,
}

impl ApplyContext {
    pub const PRIMARY_REDO: Self = Self::new(ApplyRole::Primary, ApplyOperation::Redo);
    pub const SECONDARY_REDO: Self = Self::new(ApplyRole::Secondary, ApplyOperation::Redo);
    pub const RECOVERY_REDO: Self = Self::new(ApplyRole::Recovery, ApplyOperation::Redo);
    pub const SECONDARY_FALSE_PROGRESS: Self =
        Self::new(ApplyRole::Secondary, ApplyOperation::FalseProgress);

    #[must_use]
    pub const fn new(role: ApplyRole, operation: ApplyOperation) -> Self {
        Self { role, operation }
    }
}

/// Fault severity reported to the partition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultType {
    Transient,
    Permanent,
}

/// Context handed back by apply and released by unlock
#[derive(Clone)]
pub enum OperationContext {
    /// Lock held by the state manager for a structural operation
    StateManager(Arc<StateManagerTransactionContext>),
    /// Context produced by a state provider, tagged with its owner
    Named {
        state_provider_id: StateProviderId,
        context: UserContext,
    },
}

impl OperationContext {
    #[must_use]
    pub fn named(state_provider_id: StateProviderId, context: UserContext) -> Self {
        Self::Named {
            state_provider_id,
            context,
        }
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateManager(ctx) => f.debug_tuple("StateManager").field(ctx).finish(),
            Self::Named {
                state_provider_id, ..
            } => f
                .debug_struct("Named")
                .field("state_provider_id", state_provider_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Releases a lock when its transaction commits or aborts
pub trait LockContext: Send + Sync {
    fn unlock(&self) -> Result<()>;
}

/// Identity of a transaction or atomic operation
pub trait TransactionBase: Send + Sync {
    fn transaction_id(&self) -> TransactionId;

    /// Commit LSN, or [`txnrep_common::INVALID_LSN`] while the transaction is open
    fn commit_sequence_number(&self) -> Lsn;
}

/// An open write transaction
pub trait Transaction: TransactionBase {
    /// Register a lock to be released once the transaction completes
    fn add_lock_context(&self, lock_context: Arc<dyn LockContext>) -> Result<()>;

    /// Append an operation to the transaction
    fn add_operation(
        &self,
        metadata: Option<OperationData>,
        undo: Option<OperationData>,
        redo: Option<OperationData>,
        state_provider_id: StateProviderId,
        context: Option<OperationContext>,
    ) -> Result<()>;
}

/// Log operations exposed by the logging replicator
#[async_trait]
pub trait LoggingReplicator: Send + Sync {
    fn begin_transaction(
        &self,
        transaction: &dyn Transaction,
        metadata: Option<OperationData>,
        undo: Option<OperationData>,
        redo: Option<OperationData>,
        context: Option<OperationContext>,
    ) -> Result<()>;

    async fn begin_transaction_async(
        &self,
        transaction: &dyn Transaction,
        metadata: Option<OperationData>,
        undo: Option<OperationData>,
        redo: Option<OperationData>,
        context: Option<OperationContext>,
    ) -> Result<Lsn>;

    fn add_operation(
        &self,
        transaction: &dyn Transaction,
        metadata: Option<OperationData>,
        undo: Option<OperationData>,
        redo: Option<OperationData>,
        context: Option<OperationContext>,
    ) -> Result<()>;

    /// Append a self-committing atomic operation
    async fn add_operation_async(
        &self,
        operation: &dyn TransactionBase,
        metadata: Option<OperationData>,
        undo: Option<OperationData>,
        redo: Option<OperationData>,
        context: Option<OperationContext>,
    ) -> Result<Lsn>;

    /// Append an atomic operation that is never undone
    async fn add_redo_only_operation_async(
        &self,
        operation: &dyn TransactionBase,
        metadata: Option<OperationData>,
        redo: Option<OperationData>,
        context: Option<OperationContext>,
    ) -> Result<Lsn>;

    /// LSN below which no replica can still need a removed provider's state
    fn safe_lsn_to_remove_state_provider(&self) -> Lsn;

    fn is_readable(&self) -> bool;
}

/// Status and fault reporting of the hosting partition
pub trait Partition: Send + Sync {
    fn read_status(&self) -> Result<AccessStatus>;

    fn write_status(&self) -> Result<AccessStatus>;

    fn report_fault(&self, fault: FaultType);
}
