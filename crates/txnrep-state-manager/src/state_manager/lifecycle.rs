//! Open, role changes, close and recovery of the provider set

use super::{RoleState, StateManager};
use crate::metadata::{Metadata, MetadataMode};
use crate::metadata_manager::{MetadataFilter, MetadataManager};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use txnrep_common::{Error, ReplicaRole, Result};

impl StateManager {
    /// Load the persisted directory and open every provider
    ///
    /// `complete_checkpoint` finishes a checkpoint interrupted by a crash;
    /// `cleanup_restore` wipes state left behind by an interrupted restore.
    pub async fn open_async(
        &self,
        complete_checkpoint: bool,
        cleanup_restore: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.api_entry()?;
        if !self.config.has_persisted_state {
            info!(replica = %self.partitioned_replica_id, "volatile replica, nothing to recover");
            return Ok(());
        }

        if complete_checkpoint {
            self.checkpoint_manager.complete_checkpoint().await?;
        }
        if cleanup_restore {
            self.clean_up_incomplete_restore(cancel).await?;
        }

        self.recover_state_manager_checkpoint(cancel).await?;
        self.open_state_providers(cancel).await?;

        let recovered = async {
            if complete_checkpoint {
                let active = self
                    .metadata_manager()
                    .get_in_memory_metadata_array(MetadataFilter::Active);
                self.dispatcher.complete_checkpoint_all(&active, cancel).await?;
            }
            self.recover_state_providers(cancel).await
        }
        .await;
        if let Err(e) = recovered {
            warn!(error = %e, "state provider recovery failed, aborting providers");
            self.abort_state_providers();
            return Err(e);
        }

        let mm = self.metadata_manager();
        info!(
            replica = %self.partitioned_replica_id,
            active = mm.active_count(),
            deleted = mm.deleted_count(),
            "state manager opened"
        );
        Ok(())
    }

    /// Move the replica and every provider to `new_role`
    pub async fn change_role_async(&self, new_role: ReplicaRole, cancel: &CancellationToken) -> Result<()> {
        self.api_entry()?;
        {
            let mut state = self.role.lock();
            assert!(
                state.change_role_completed,
                "change role to {new_role} after a failed change from {}",
                state.role
            );
            if state.role == new_role {
                return Ok(());
            }
            state.change_role_completed = false;
        }
        let old_role = self.role();

        {
            let _guard = self.change_role_lock.write().await;
            let active = self
                .metadata_manager()
                .get_in_memory_metadata_array(MetadataFilter::Active);
            self.dispatcher.change_role_all(&active, new_role, cancel).await?;
            self.role.lock().role = new_role;
        }

        if new_role == ReplicaRole::None {
            self.remove_state_on_state_providers(cancel).await?;
            self.checkpoint_manager.clean().await?;
            self.work_dir.remove_all().await?;
        }

        self.role.lock().change_role_completed = true;
        info!(replica = %self.partitioned_replica_id, from = %old_role, to = %new_role, "role changed");
        Ok(())
    }

    /// Close every provider and release all locks
    pub async fn close_async(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        self.close_state_providers(&cancel).await;
        self.shutdown.cancel();
        self.metadata_manager().dispose();
        info!(replica = %self.partitioned_replica_id, "state manager closed");
        Ok(())
    }

    /// Abort every provider without waiting for anything
    pub fn abort(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
        self.abort_state_providers();
        self.metadata_manager().dispose();
        warn!(replica = %self.partitioned_replica_id, "state manager aborted");
    }

    /// Rebuild the directory from the state manager checkpoint
    pub(super) async fn recover_state_manager_checkpoint(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(mut records) = self.checkpoint_manager.recover().await? else {
            return Ok(());
        };
        // Children sort after their parent, so they are initialized first
        records.sort_by(|a, b| b.name.cmp(&a.name));

        let mm = self.metadata_manager();
        for record in &records {
            let state_provider = self.dispatcher.create_state_provider(
                &record.name,
                record.state_provider_id,
                &record.type_name,
                record.init_parameters.clone().map(Bytes::from),
            )?;
            let m = Arc::new(Metadata::from_serializable(record, state_provider));
            if let Some(list) = self.initialize_state_providers_in_order(&mm, &m).await? {
                for entry in list {
                    register_recovered(&mm, entry);
                }
            }
            self.id_allocator.update_last_id(record.state_provider_id);
        }

        let referenced: HashSet<_> = records.iter().map(|r| r.state_provider_id).collect();
        let removed = self
            .work_dir
            .remove_unreferenced(&referenced, self.config.slow_cleanup_warn())
            .await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.notifier
            .notify_rebuilt(&mm.get_in_memory_metadata_array(MetadataFilter::Active));
        info!(
            records = records.len(),
            removed_folders = removed,
            "recovered state manager checkpoint"
        );
        Ok(())
    }

    /// Undo whatever an interrupted restore left on disk
    pub(super) async fn clean_up_incomplete_restore(&self, cancel: &CancellationToken) -> Result<()> {
        warn!(replica = %self.partitioned_replica_id, "cleaning up incomplete restore");
        self.recover_state_manager_checkpoint(cancel).await?;
        self.open_state_providers(cancel).await?;
        self.change_role_on_state_providers(ReplicaRole::None, cancel).await?;
        self.remove_state_on_state_providers(cancel).await?;
        self.close_state_providers(cancel).await;
        self.checkpoint_manager.clean().await?;
        self.replace_metadata_manager();
        Ok(())
    }

    pub(super) fn set_role(&self, role: ReplicaRole) {
        *self.role.lock() = RoleState {
            role,
            change_role_completed: true,
        };
    }
}

fn register_recovered(mm: &MetadataManager, entry: Arc<Metadata>) {
    if entry.mode() == MetadataMode::Active {
        assert!(
            mm.try_add(entry.name(), Arc::clone(&entry)),
            "state provider {} recovered twice",
            entry.name()
        );
    } else {
        mm.add_deleted(entry.state_provider_id(), entry);
    }
}
