//! Routing of provider operations to the logging replicator
//!
//! Metadata is wrapped with the provider id so applies find their way back.

use super::StateManager;
use crate::operation_data::{NamedOperationData, OperationData};
use crate::replicator::{OperationContext, Transaction, TransactionBase, UserContext};
use txnrep_common::{Lsn, Result, StateProviderId};

fn wrap(
    state_provider_id: StateProviderId,
    metadata: Option<OperationData>,
    context: Option<UserContext>,
) -> Result<(Option<OperationData>, Option<OperationContext>)> {
    let metadata = NamedOperationData::new(state_provider_id, metadata).to_operation_data()?;
    let context = context.map(|c| OperationContext::named(state_provider_id, c));
    Ok((Some(metadata), context))
}

impl StateManager {
    pub fn begin_transaction(
        &self,
        transaction: &dyn Transaction,
        state_provider_id: StateProviderId,
        metadata: Option<OperationData>,
        undo: Option<OperationData>,
        redo: Option<OperationData>,
        context: Option<UserContext>,
    ) -> Result<()> {
        self.api_entry()?;
        self.is_registered(state_provider_id, false, transaction.transaction_id())?;
        let (metadata, context) = wrap(state_provider_id, metadata, context)?;
        self.logging_replicator()?
            .begin_transaction(transaction, metadata, undo, redo, context)
    }

    pub async fn begin_transaction_async(
        &self,
        transaction: &dyn Transaction,
        state_provider_id: StateProviderId,
        metadata: Option<OperationData>,
        undo: Option<OperationData>,
        redo: Option<OperationData>,
        context: Option<UserContext>,
    ) -> Result<Lsn> {
        self.api_entry()?;
        self.is_registered(state_provider_id, false, transaction.transaction_id())?;
        let (metadata, context) = wrap(state_provider_id, metadata, context)?;
        self.logging_replicator()?
            .begin_transaction_async(transaction, metadata, undo, redo, context)
            .await
    }

    pub fn add_operation(
        &self,
        transaction: &dyn Transaction,
        state_provider_id: StateProviderId,
        metadata: Option<OperationData>,
        undo: Option<OperationData>,
        redo: Option<OperationData>,
        context: Option<UserContext>,
    ) -> Result<()> {
        self.api_entry()?;
        self.is_registered(state_provider_id, false, transaction.transaction_id())?;
        let (metadata, context) = wrap(state_provider_id, metadata, context)?;
        self.logging_replicator()?
            .add_operation(transaction, metadata, undo, redo, context)
    }

    /// Replicate a self-committing operation
    pub async fn add_operation_async(
        &self,
        operation: &dyn TransactionBase,
        state_provider_id: StateProviderId,
        metadata: Option<OperationData>,
        undo: Option<OperationData>,
        redo: Option<OperationData>,
        context: Option<UserContext>,
    ) -> Result<Lsn> {
        self.api_entry()?;
        self.is_registered(state_provider_id, false, operation.transaction_id())?;
        let (metadata, context) = wrap(state_provider_id, metadata, context)?;
        self.logging_replicator()?
            .add_operation_async(operation, metadata, undo, redo, context)
            .await
    }

    /// Replicate a self-committing operation that is never undone
    pub async fn add_redo_only_operation_async(
        &self,
        operation: &dyn TransactionBase,
        state_provider_id: StateProviderId,
        metadata: Option<OperationData>,
        redo: Option<OperationData>,
        context: Option<UserContext>,
    ) -> Result<Lsn> {
        self.api_entry()?;
        self.is_registered(state_provider_id, false, operation.transaction_id())?;
        let (metadata, context) = wrap(state_provider_id, metadata, context)?;
        self.logging_replicator()?
            .add_redo_only_operation_async(operation, metadata, redo, context)
            .await
    }
}
