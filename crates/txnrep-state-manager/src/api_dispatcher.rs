//! Calls into state providers, one at a time or fanned out
//!
//! Bulk calls run concurrently and report the first failure after all of
//! them finish. Close and abort paths never fail: a provider that cannot
//! close is aborted.

use crate::metadata::Metadata;
use crate::operation_data::OperationData;
use crate::state_provider::{FactoryArguments, InitializationContext, StateProvider, StateProviderFactory};
use bytes::Bytes;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use txnrep_common::{Lsn, PartitionedReplicaId, ReplicaRole, Result, StateProviderId};

/// What to do when a provider fails to close
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureAction {
    Throw,
    AbortStateProvider,
}

pub struct ApiDispatcher {
    partitioned_replica_id: PartitionedReplicaId,
    factory: Arc<dyn StateProviderFactory>,
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().collect()
}

impl ApiDispatcher {
    pub fn new(
        partitioned_replica_id: PartitionedReplicaId,
        factory: Arc<dyn StateProviderFactory>,
    ) -> Self {
        Self {
            partitioned_replica_id,
            factory,
        }
    }

    pub fn create_state_provider(
        &self,
        name: &str,
        state_provider_id: StateProviderId,
        type_name: &str,
        init_parameters: Option<Bytes>,
    ) -> Result<Arc<dyn StateProvider>> {
        self.factory
            .create(FactoryArguments {
                name: name.to_owned(),
                state_provider_id,
                type_name: type_name.to_owned(),
                partitioned_replica_id: self.partitioned_replica_id,
                init_parameters,
            })
            .inspect_err(|e| {
                warn!(%name, %type_name, error = %e, "state provider factory failed");
            })
    }

    pub fn initialize(
        &self,
        metadata: &Metadata,
        work_dir: PathBuf,
        children: &[Arc<Metadata>],
    ) -> Result<()> {
        metadata.state_provider().initialize(InitializationContext {
            partitioned_replica_id: self.partitioned_replica_id,
            work_dir,
            children: children
                .iter()
                .map(|c| Arc::clone(c.state_provider()))
                .collect(),
        })
    }

    pub async fn open(&self, metadata: &Metadata, cancel: &CancellationToken) -> Result<()> {
        metadata.state_provider().open(cancel).await.inspect_err(|e| {
            warn!(
                state_provider_id = %metadata.state_provider_id(),
                error = %e,
                "state provider failed to open"
            );
        })
    }

    pub async fn open_all(&self, list: &[Arc<Metadata>], cancel: &CancellationToken) -> Result<()> {
        first_error(join_all(list.iter().map(|m| self.open(m, cancel))).await)
    }

    pub async fn close(
        &self,
        metadata: &Metadata,
        action: FailureAction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match metadata.state_provider().close(cancel).await {
            Ok(()) => Ok(()),
            Err(e) if action == FailureAction::AbortStateProvider => {
                warn!(
                    state_provider_id = %metadata.state_provider_id(),
                    error = %e,
                    "state provider failed to close, aborting it"
                );
                metadata.state_provider().abort();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn close_all(
        &self,
        list: &[Arc<Metadata>],
        action: FailureAction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        first_error(join_all(list.iter().map(|m| self.close(m, action, cancel))).await)
    }

    pub fn abort(&self, metadata: &Metadata) {
        debug!(state_provider_id = %metadata.state_provider_id(), "aborting state provider");
        metadata.state_provider().abort();
    }

    pub fn abort_all(&self, list: &[Arc<Metadata>]) {
        for m in list {
            self.abort(m);
        }
    }

    pub async fn change_role(
        &self,
        metadata: &Metadata,
        role: ReplicaRole,
        cancel: &CancellationToken,
    ) -> Result<()> {
        metadata
            .state_provider()
            .change_role(role, cancel)
            .await
            .inspect_err(|e| {
                warn!(
                    state_provider_id = %metadata.state_provider_id(),
                    %role,
                    error = %e,
                    "state provider failed to change role"
                );
            })
    }

    pub async fn change_role_all(
        &self,
        list: &[Arc<Metadata>],
        role: ReplicaRole,
        cancel: &CancellationToken,
    ) -> Result<()> {
        first_error(join_all(list.iter().map(|m| self.change_role(m, role, cancel))).await)
    }

    pub async fn recover_checkpoint(&self, metadata: &Metadata, cancel: &CancellationToken) -> Result<()> {
        metadata
            .state_provider()
            .recover_checkpoint(cancel)
            .await
            .inspect_err(|e| {
                error!(
                    state_provider_id = %metadata.state_provider_id(),
                    error = %e,
                    "state provider failed to recover its checkpoint"
                );
            })
    }

    pub async fn recover_checkpoint_all(
        &self,
        list: &[Arc<Metadata>],
        cancel: &CancellationToken,
    ) -> Result<()> {
        first_error(join_all(list.iter().map(|m| self.recover_checkpoint(m, cancel))).await)
    }

    pub fn prepare_checkpoint_all(&self, list: &[Arc<Metadata>], checkpoint_lsn: Lsn) -> Result<()> {
        list.iter()
            .try_for_each(|m| m.state_provider().prepare_checkpoint(checkpoint_lsn))
    }

    pub async fn perform_checkpoint_all(
        &self,
        list: &[Arc<Metadata>],
        cancel: &CancellationToken,
    ) -> Result<()> {
        first_error(
            join_all(list.iter().map(|m| m.state_provider().perform_checkpoint(cancel))).await,
        )
    }

    pub async fn complete_checkpoint_all(
        &self,
        list: &[Arc<Metadata>],
        cancel: &CancellationToken,
    ) -> Result<()> {
        first_error(
            join_all(list.iter().map(|m| m.state_provider().complete_checkpoint(cancel))).await,
        )
    }

    pub async fn remove_state(&self, metadata: &Metadata) -> Result<()> {
        metadata
            .state_provider()
            .remove_state(metadata.state_provider_id())
            .await
    }

    pub async fn remove_state_all(&self, list: &[Arc<Metadata>]) -> Result<()> {
        first_error(join_all(list.iter().map(|m| self.remove_state(m))).await)
    }

    pub async fn backup_checkpoint(
        &self,
        metadata: &Metadata,
        backup_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        metadata
            .state_provider()
            .backup_checkpoint(backup_dir, cancel)
            .await
    }

    pub async fn restore_checkpoint(
        &self,
        metadata: &Metadata,
        backup_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        metadata
            .state_provider()
            .restore_checkpoint(backup_dir, cancel)
            .await
    }

    pub async fn begin_setting_current_state(&self, metadata: &Metadata) -> Result<()> {
        metadata.state_provider().begin_setting_current_state().await
    }

    pub async fn set_current_state(
        &self,
        metadata: &Metadata,
        state_record_number: i64,
        data: OperationData,
    ) -> Result<()> {
        metadata
            .state_provider()
            .set_current_state(state_record_number, data)
            .await
    }

    pub async fn end_setting_current_state_all(
        &self,
        list: &[Arc<Metadata>],
        cancel: &CancellationToken,
    ) -> Result<()> {
        first_error(
            join_all(
                list.iter()
                    .map(|m| m.state_provider().end_setting_current_state(cancel)),
            )
            .await,
        )
    }
}
