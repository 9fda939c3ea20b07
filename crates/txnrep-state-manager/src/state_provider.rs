//! State provider abstraction
//!
//! A state provider is an independently checkpointed data structure hosted
//! by the replica (a dictionary, a queue, ...). Providers are constructed by
//! a [`StateProviderFactory`] keyed by type name, so the set of provider
//! kinds is open and dispatch goes through trait objects.

use crate::operation_data::OperationData;
use crate::replicator::{ApplyContext, Transaction, TransactionBase, UserContext};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use txnrep_common::{Lsn, PartitionedReplicaId, ReplicaRole, Result, StateProviderId};

/// A child declared by a state provider when it is added
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateProviderInfo {
    pub type_name: String,
    pub name: String,
    pub init_parameters: Option<Bytes>,
}

impl StateProviderInfo {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
            init_parameters: None,
        }
    }

    #[must_use]
    pub fn with_init_parameters(mut self, params: Bytes) -> Self {
        self.init_parameters = Some(params);
        self
    }
}

/// Arguments handed to the factory when a provider instance is created
#[derive(Clone, Debug)]
pub struct FactoryArguments {
    pub name: String,
    pub state_provider_id: StateProviderId,
    pub type_name: String,
    pub partitioned_replica_id: PartitionedReplicaId,
    pub init_parameters: Option<Bytes>,
}

/// Everything a provider learns before it is opened
pub struct InitializationContext {
    pub partitioned_replica_id: PartitionedReplicaId,
    pub work_dir: PathBuf,
    pub children: Vec<Arc<dyn StateProvider>>,
}

/// Creates state providers from their type name
pub trait StateProviderFactory: Send + Sync {
    fn create(&self, args: FactoryArguments) -> Result<Arc<dyn StateProvider>>;
}

/// Pull-based stream of copy units
pub trait OperationDataStream: Send {
    /// Next unit, or `None` once the stream is drained
    fn next(&mut self) -> Result<Option<OperationData>>;
}

/// Stream over an in-memory list of units
pub struct VecOperationDataStream {
    items: std::vec::IntoIter<OperationData>,
}

impl VecOperationDataStream {
    #[must_use]
    pub fn new(items: Vec<OperationData>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl OperationDataStream for VecOperationDataStream {
    fn next(&mut self) -> Result<Option<OperationData>> {
        Ok(self.items.next())
    }
}

/// Lifecycle and replication surface of a state provider
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Called once before open with the provider's working directory and children
    fn initialize(&self, context: InitializationContext) -> Result<()>;

    async fn open(&self, cancel: &CancellationToken) -> Result<()>;

    async fn change_role(&self, role: ReplicaRole, cancel: &CancellationToken) -> Result<()>;

    async fn close(&self, cancel: &CancellationToken) -> Result<()>;

    /// Must not fail
    fn abort(&self);

    async fn recover_checkpoint(&self, cancel: &CancellationToken) -> Result<()>;

    fn prepare_checkpoint(&self, checkpoint_lsn: Lsn) -> Result<()>;

    async fn perform_checkpoint(&self, cancel: &CancellationToken) -> Result<()>;

    async fn complete_checkpoint(&self, cancel: &CancellationToken) -> Result<()>;

    /// Delete everything this provider persisted
    async fn remove_state(&self, state_provider_id: StateProviderId) -> Result<()>;

    async fn backup_checkpoint(&self, backup_dir: &Path, cancel: &CancellationToken) -> Result<()>;

    async fn restore_checkpoint(&self, backup_dir: &Path, cancel: &CancellationToken) -> Result<()>;

    fn get_current_state(&self) -> Result<Box<dyn OperationDataStream>>;

    async fn begin_setting_current_state(&self) -> Result<()> {
        Ok(())
    }

    async fn set_current_state(&self, state_record_number: i64, data: OperationData) -> Result<()>;

    async fn end_setting_current_state(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Apply a replicated operation this provider issued
    async fn apply(
        &self,
        _lsn: Lsn,
        _transaction: &dyn TransactionBase,
        _apply_context: ApplyContext,
        _metadata: Option<OperationData>,
        _data: Option<OperationData>,
    ) -> Result<Option<UserContext>> {
        Ok(None)
    }

    /// Release whatever an applied operation still holds
    fn unlock(&self, _context: UserContext) -> Result<()> {
        Ok(())
    }

    /// Children this provider wants created alongside it
    fn get_children(&self, _name: &str) -> Result<Vec<StateProviderInfo>> {
        Ok(Vec::new())
    }

    /// Called under the remove lock before the delete is replicated
    async fn prepare_for_remove(
        &self,
        _transaction: &dyn Transaction,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }
}
