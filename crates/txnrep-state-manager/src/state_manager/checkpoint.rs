//! Checkpoint, backup, restore and tombstone cleanup

use super::{RoleState, StateManager};
use crate::api_dispatcher::FailureAction;
use crate::metadata_manager::MetadataFilter;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use txnrep_common::{Lsn, ReplicaRole, Result};

impl StateManager {
    /// Snapshot the directory and ask every live provider to prepare
    pub fn prepare_checkpoint(&self, checkpoint_lsn: Lsn) -> Result<()> {
        self.api_entry()?;
        let mm = self.metadata_manager();
        let active = mm.get_in_memory_metadata_array(MetadataFilter::Active);
        let deleted = mm.get_deleted_metadata_array();

        self.checkpoint_manager
            .prepare_checkpoint(checkpoint_lsn, &active, &deleted);
        self.dispatcher.prepare_checkpoint_all(&active, checkpoint_lsn)?;
        debug!(
            lsn = checkpoint_lsn,
            active = active.len(),
            deleted = deleted.len(),
            "prepared checkpoint"
        );
        *self.prepared.lock() = active;
        Ok(())
    }

    /// Write provider checkpoints, then the state manager's temporary file
    pub async fn perform_checkpoint_async(&self, cancel: &CancellationToken) -> Result<()> {
        self.api_entry()?;
        let prepared = self.prepared.lock().clone();
        self.dispatcher.perform_checkpoint_all(&prepared, cancel).await?;
        self.checkpoint_manager.perform_checkpoint().await
    }

    /// Make the performed checkpoint current and erase tombstones nobody needs
    pub async fn complete_checkpoint_async(&self, cancel: &CancellationToken) -> Result<()> {
        self.api_entry()?;
        let prepared = std::mem::take(&mut *self.prepared.lock());
        self.dispatcher.complete_checkpoint_all(&prepared, cancel).await?;
        self.checkpoint_manager.complete_checkpoint().await?;
        self.clean_up_metadata(cancel).await
    }

    /// Recover every live provider from its own checkpoint
    pub async fn recover_checkpoint_async(&self, cancel: &CancellationToken) -> Result<()> {
        self.api_entry()?;
        self.recover_state_providers(cancel).await
    }

    /// Copy the last completed checkpoint into `backup_dir`
    ///
    /// The state manager writes its file at the top and each provider backs
    /// up into `backup_dir/<state provider id>`.
    pub async fn backup_checkpoint_async(&self, backup_dir: &Path, cancel: &CancellationToken) -> Result<()> {
        self.api_entry()?;
        tokio::fs::create_dir_all(backup_dir).await?;
        self.checkpoint_manager.backup(backup_dir).await?;
        let live = self
            .metadata_manager()
            .get_in_memory_metadata_array(MetadataFilter::Active);
        self.checkpoint_manager
            .backup_active_state_providers(&self.dispatcher, backup_dir, &live, cancel)
            .await?;
        info!(dir = %backup_dir.display(), providers = live.len(), "backup complete");
        Ok(())
    }

    /// Replace all local state with the backup in `backup_dir`
    pub async fn restore_checkpoint_async(&self, backup_dir: &Path, cancel: &CancellationToken) -> Result<()> {
        self.api_entry()?;
        info!(dir = %backup_dir.display(), "restoring from backup");

        self.change_role_on_state_providers(ReplicaRole::None, cancel).await?;
        self.remove_state_on_state_providers(cancel).await?;
        self.close_state_providers(cancel).await;
        self.checkpoint_manager.clean().await?;
        self.replace_metadata_manager();
        *self.role.lock() = RoleState {
            role: ReplicaRole::Unknown,
            change_role_completed: true,
        };

        self.checkpoint_manager.restore(backup_dir).await?;
        self.recover_state_manager_checkpoint(cancel).await?;
        self.open_state_providers(cancel).await?;

        let restored = async {
            let active = self
                .metadata_manager()
                .get_in_memory_metadata_array(MetadataFilter::Active);
            for m in &active {
                let dir = backup_dir.join(m.state_provider_id().to_string());
                self.dispatcher.restore_checkpoint(m, &dir, cancel).await?;
            }
            self.recover_state_providers(cancel).await
        }
        .await;
        if let Err(e) = restored {
            warn!(error = %e, "restore failed, aborting state providers");
            self.abort_state_providers();
            return Err(e);
        }
        info!(dir = %backup_dir.display(), "restore complete");
        Ok(())
    }

    /// Erase tombstones that are below the replicator's safe LSN
    ///
    /// A provider that fails to shut down keeps its tombstone and is tried
    /// again at the next checkpoint. The others are still erased.
    pub(super) async fn clean_up_metadata(&self, cancel: &CancellationToken) -> Result<()> {
        let safe_lsn = self.logging_replicator()?.safe_lsn_to_remove_state_provider();
        let mm = self.metadata_manager();

        for m in mm.get_deleted_metadata_array() {
            let Some(removal_lsn) = m.removal_lsn() else {
                continue;
            };
            if removal_lsn >= safe_lsn {
                continue;
            }
            let id = m.state_provider_id();
            let erased: Result<()> = async {
                {
                    let _guard = self.change_role_lock.write().await;
                    self.dispatcher.change_role(&m, ReplicaRole::None, cancel).await?;
                }
                self.dispatcher.remove_state(&m).await?;
                self.dispatcher
                    .close(&m, FailureAction::AbortStateProvider, cancel)
                    .await?;
                self.work_dir.remove_state_provider_work_directory(id).await
            }
            .await;
            if let Err(e) = erased {
                warn!(
                    state_provider_id = %id,
                    name = %m.name(),
                    error = %e,
                    "failed to erase deleted state provider, keeping tombstone"
                );
                continue;
            }
            mm.try_remove_deleted(id);
            self.checkpoint_manager.remove_state_provider(id);
            info!(
                state_provider_id = %id,
                name = %m.name(),
                removal_lsn,
                safe_lsn,
                "erased deleted state provider"
            );
        }
        Ok(())
    }
}
