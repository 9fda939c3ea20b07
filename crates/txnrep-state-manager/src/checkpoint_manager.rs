//! Checkpointing of the state manager's own metadata
//!
//! A checkpoint goes through three phases. `prepare` snapshots the live
//! and delay-deleted records, `perform` writes the snapshot to a temporary
//! file and `complete` swaps it in:
//!
//! ```text
//! current -> .bak, .tmp -> current, delete .bak
//! ```
//!
//! The last performed snapshot doubles as the state manager's copy and
//! backup state. A prepared snapshot stays aside until it is performed.

use crate::api_dispatcher::ApiDispatcher;
use crate::checkpoint_file::CheckpointFile;
use crate::constants::{BACKUP_CHECKPOINT_SUFFIX, BACKUP_FILE_NAME, TEMP_CHECKPOINT_SUFFIX};
use crate::metadata::{Metadata, MetadataMode, SerializableMetadata};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use txnrep_common::{CheckpointConfig, Error, INVALID_LSN, Lsn, Result, StateProviderId};

#[derive(Clone, Debug)]
struct Snapshot {
    lsn: Lsn,
    records: Vec<SerializableMetadata>,
}

pub struct CheckpointManager {
    current_path: PathBuf,
    config: CheckpointConfig,
    has_persisted_state: bool,
    prepared: Mutex<Option<Snapshot>>,
    copy_or_checkpoint: RwLock<Snapshot>,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::internal(format!("checkpoint I/O task failed: {e}")))?
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl CheckpointManager {
    pub fn new(current_path: PathBuf, config: CheckpointConfig, has_persisted_state: bool) -> Self {
        Self {
            current_path,
            config,
            has_persisted_state,
            prepared: Mutex::new(None),
            copy_or_checkpoint: RwLock::new(Snapshot {
                lsn: INVALID_LSN,
                records: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        self.current_path.with_extension(TEMP_CHECKPOINT_SUFFIX)
    }

    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        self.current_path.with_extension(BACKUP_CHECKPOINT_SUFFIX)
    }

    /// LSN of the last performed or recovered checkpoint
    #[must_use]
    pub fn prepare_lsn(&self) -> Lsn {
        self.copy_or_checkpoint.read().lsn
    }

    /// Snapshot live records and delay-deleted tombstones as of `lsn`
    ///
    /// False-progress tombstones are left out: they never became durable.
    pub fn prepare_checkpoint(&self, lsn: Lsn, active: &[Arc<Metadata>], deleted: &[Arc<Metadata>]) {
        let mut records: Vec<SerializableMetadata> = active
            .iter()
            .map(|m| {
                let mut record = m.to_serializable();
                record.mode = MetadataMode::Active;
                record
            })
            .collect();
        records.extend(
            deleted
                .iter()
                .filter(|m| m.mode() == MetadataMode::DelayDelete)
                .map(|m| m.to_serializable()),
        );
        debug!(lsn, count = records.len(), "prepared state manager checkpoint");
        *self.prepared.lock() = Some(Snapshot { lsn, records });
    }

    /// Write the prepared snapshot to the temporary checkpoint file
    ///
    /// On success the snapshot becomes the copy and backup state.
    pub async fn perform_checkpoint(&self) -> Result<()> {
        let snapshot = self
            .prepared
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_operation("no prepared state manager checkpoint to perform"))?;
        if self.has_persisted_state {
            let file = CheckpointFile::new(snapshot.lsn, snapshot.records.clone());
            let temp = self.temp_path();
            let sync = self.config.sync_on_write;
            blocking(move || file.write(&temp, sync)).await?;
            debug!(lsn = snapshot.lsn, "wrote temporary state manager checkpoint");
        }
        self.prepared.lock().take();
        *self.copy_or_checkpoint.write() = snapshot;
        Ok(())
    }

    /// Swap the temporary checkpoint in; safe to repeat after a crash
    pub async fn complete_checkpoint(&self) -> Result<()> {
        if !self.has_persisted_state {
            return Ok(());
        }
        let temp = self.temp_path();
        let backup = self.backup_path();
        let current = &self.current_path;

        if tokio::fs::try_exists(&temp).await? {
            if tokio::fs::try_exists(current).await? {
                tokio::fs::rename(current, &backup).await?;
            }
            tokio::fs::rename(&temp, current).await?;
        } else if !tokio::fs::try_exists(current).await? && tokio::fs::try_exists(&backup).await? {
            // Crashed between the two renames.
            tokio::fs::rename(&backup, current).await?;
        }
        remove_if_exists(&backup).await?;
        debug!(path = %current.display(), "completed state manager checkpoint");
        Ok(())
    }

    /// Load the current checkpoint; `None` if none was ever written
    pub async fn recover(&self) -> Result<Option<Vec<SerializableMetadata>>> {
        if !self.has_persisted_state || !tokio::fs::try_exists(&self.current_path).await? {
            return Ok(None);
        }
        let path = self.current_path.clone();
        let verify = self.config.verify_checksum;
        let file = blocking(move || CheckpointFile::read(&path, verify)).await?;
        info!(
            lsn = file.header.prepare_lsn,
            count = file.records.len(),
            "recovered state manager checkpoint"
        );
        *self.copy_or_checkpoint.write() = Snapshot {
            lsn: file.header.prepare_lsn,
            records: file.records.clone(),
        };
        Ok(Some(file.records))
    }

    /// Records to ship to a new secondary, children before parents
    #[must_use]
    pub fn get_current_state(&self) -> Vec<SerializableMetadata> {
        let mut records = self.copy_or_checkpoint.read().records.clone();
        records.sort_by(|a, b| b.name.cmp(&a.name));
        records
    }

    /// Write the state manager part of a backup
    pub async fn backup(&self, backup_dir: &Path) -> Result<()> {
        let snapshot = self.copy_or_checkpoint.read().clone();
        let file = CheckpointFile::new(snapshot.lsn, snapshot.records);
        let path = backup_dir.join(BACKUP_FILE_NAME);
        let sync = self.config.sync_on_write;
        blocking(move || file.write(&path, sync)).await?;
        info!(dir = %backup_dir.display(), lsn = snapshot.lsn, "backed up state manager checkpoint");
        Ok(())
    }

    /// Back up every live provider of the last checkpoint into `backup_dir/<id>`
    pub async fn backup_active_state_providers(
        &self,
        dispatcher: &ApiDispatcher,
        backup_dir: &Path,
        live: &[Arc<Metadata>],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let checkpointed: std::collections::HashSet<StateProviderId> = self
            .copy_or_checkpoint
            .read()
            .records
            .iter()
            .filter(|r| r.mode == MetadataMode::Active)
            .map(|r| r.state_provider_id)
            .collect();

        let backups = live
            .iter()
            .filter(|m| checkpointed.contains(&m.state_provider_id()))
            .map(|m| async move {
                let dir = backup_dir.join(m.state_provider_id().to_string());
                tokio::fs::create_dir_all(&dir).await?;
                dispatcher.backup_checkpoint(m, &dir, cancel).await
            });
        join_all(backups).await.into_iter().collect()
    }

    /// Install the backed-up checkpoint as the current one
    pub async fn restore(&self, backup_dir: &Path) -> Result<()> {
        let source = backup_dir.join(BACKUP_FILE_NAME);
        if !tokio::fs::try_exists(&source).await? {
            return Err(Error::corrupt(format!(
                "backup folder {} has no {BACKUP_FILE_NAME}",
                backup_dir.display()
            )));
        }
        let verify = self.config.verify_checksum;
        let sync = self.config.sync_on_write;
        let current = self.current_path.clone();
        blocking(move || CheckpointFile::read(&source, verify)?.write(&current, sync)).await?;
        info!(dir = %backup_dir.display(), "restored state manager checkpoint");
        Ok(())
    }

    /// Delete every checkpoint file and forget the snapshot
    pub async fn clean(&self) -> Result<()> {
        remove_if_exists(&self.current_path).await?;
        remove_if_exists(&self.temp_path()).await?;
        remove_if_exists(&self.backup_path()).await?;
        self.prepared.lock().take();
        *self.copy_or_checkpoint.write() = Snapshot {
            lsn: INVALID_LSN,
            records: Vec::new(),
        };
        Ok(())
    }

    /// Forget a provider that tombstone cleanup erased
    pub fn remove_state_provider(&self, id: StateProviderId) {
        self.copy_or_checkpoint
            .write()
            .records
            .retain(|r| r.state_provider_id != id);
        if let Some(prepared) = self.prepared.lock().as_mut() {
            prepared.records.retain(|r| r.state_provider_id != id);
        }
    }
}
