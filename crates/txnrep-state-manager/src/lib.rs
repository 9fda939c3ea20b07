//! txnrep State Manager - Replicated state provider directory
//!
//! This crate provides:
//! - The [`StateManager`], which hosts named state providers for one replica
//!   and replicates their creation and removal through the logging replicator
//! - Checkpoint files for the provider directory, with backup and restore
//! - Copy of the directory to a building secondary
//! - Seams for the replicator, partition and provider factory
//!
//! # Example
//!
//! ```rust,ignore
//! use txnrep_state_manager::StateManager;
//!
//! let sm = StateManager::new(config, replica_id, partition, Arc::downgrade(&replicator), factory);
//! sm.open_async(false, false, &cancel).await?;
//! sm.change_role_async(ReplicaRole::Primary, &cancel).await?;
//! sm.add_async(&*txn, "fabric:/orders", "Store", None, timeout, &cancel).await?;
//! ```

pub mod api_dispatcher;
pub mod checkpoint_file;
pub mod checkpoint_manager;
pub mod constants;
pub mod id_allocator;
pub mod lock_context;
pub mod metadata;
pub mod metadata_manager;
pub mod notification;
pub mod operation_data;
pub mod replicator;
pub mod state_manager;
pub mod state_provider;
pub mod transaction_context;
pub mod work_dir;

#[cfg(test)]
pub(crate) mod testing;

pub use checkpoint_file::{CheckpointFile, CheckpointHeader};
pub use metadata::{Metadata, MetadataMode, SerializableMetadata};
pub use notification::StateManagerChangeHandler;
pub use operation_data::{NamedOperationData, OperationData};
pub use replicator::{
    ApplyContext, FaultType, LockContext, LoggingReplicator, OperationContext, Partition, Transaction,
    TransactionBase, UserContext,
};
pub use state_manager::{CopyStream, StateManager, validate_name};
pub use state_provider::{
    FactoryArguments, InitializationContext, OperationDataStream, StateProvider, StateProviderFactory,
    StateProviderInfo,
};
