//! Lock registration handed to a transaction by a structural operation.

use crate::lock_context::StateManagerLockContext;
use crate::replicator::LockContext;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use txnrep_common::{Result, TransactionId};

/// Kind of structural operation that took the lock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationType {
    Add,
    Remove,
    Read,
}

/// A name lock held on behalf of a transaction
pub struct StateManagerTransactionContext {
    transaction_id: TransactionId,
    lock_context: Arc<StateManagerLockContext>,
    operation_type: OperationType,
}

impl StateManagerTransactionContext {
    #[must_use]
    pub const fn new(
        transaction_id: TransactionId,
        lock_context: Arc<StateManagerLockContext>,
        operation_type: OperationType,
    ) -> Self {
        Self {
            transaction_id,
            lock_context,
            operation_type,
        }
    }

    #[must_use]
    pub const fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    #[must_use]
    pub const fn lock_context(&self) -> &Arc<StateManagerLockContext> {
        &self.lock_context
    }

    #[must_use]
    pub const fn operation_type(&self) -> OperationType {
        self.operation_type
    }
}

impl LockContext for StateManagerTransactionContext {
    fn unlock(&self) -> Result<()> {
        match self.lock_context.metadata_manager() {
            Some(manager) => manager.unlock(self),
            None => {
                debug!(
                    key = %self.lock_context.key(),
                    txn_id = %self.transaction_id,
                    "metadata manager already dropped, nothing to unlock"
                );
                Ok(())
            }
        }
    }
}

impl fmt::Debug for StateManagerTransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManagerTransactionContext")
            .field("transaction_id", &self.transaction_id)
            .field("key", &self.lock_context.key())
            .field("operation_type", &self.operation_type)
            .finish()
    }
}
