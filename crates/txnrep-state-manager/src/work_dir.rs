//! Replica and per-provider working directories
//!
//! Layout under the configured work directory:
//!
//! ```text
//! <work_dir>/<partition>_<replica>/StateManager.cpt
//! <work_dir>/<partition>_<replica>/<state provider id>/...
//! <work_dir>/<partition>_<replica>_<state provider id>/   (version 0, migrated on first use)
//! ```

use crate::constants::CHECKPOINT_FILE_NAME;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use txnrep_common::{Error, PartitionedReplicaId, Result, StateProviderId};

/// Working directories of one replica
#[derive(Clone, Debug)]
pub struct WorkDirectory {
    base_dir: PathBuf,
    replica_dir: PathBuf,
    partitioned_replica_id: PartitionedReplicaId,
    has_persisted_state: bool,
}

impl WorkDirectory {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        partitioned_replica_id: PartitionedReplicaId,
        has_persisted_state: bool,
    ) -> Self {
        let base_dir = base_dir.into();
        let replica_dir = base_dir.join(format!(
            "{}_{}",
            partitioned_replica_id.partition_simple(),
            partitioned_replica_id.replica_id
        ));
        Self {
            base_dir,
            replica_dir,
            partitioned_replica_id,
            has_persisted_state,
        }
    }

    #[must_use]
    pub fn replica_dir(&self) -> &Path {
        &self.replica_dir
    }

    #[must_use]
    pub fn checkpoint_file(&self) -> PathBuf {
        self.replica_dir.join(CHECKPOINT_FILE_NAME)
    }

    #[must_use]
    pub fn state_provider_dir(&self, id: StateProviderId) -> PathBuf {
        self.replica_dir.join(id.to_string())
    }

    /// Folder used before per-provider folders moved under the replica folder
    #[must_use]
    pub fn legacy_state_provider_dir(&self, id: StateProviderId) -> PathBuf {
        self.base_dir.join(format!(
            "{}_{}_{}",
            self.partitioned_replica_id.partition_simple(),
            self.partitioned_replica_id.replica_id,
            id
        ))
    }

    /// Folder for `id`, migrating a version 0 folder if one exists
    pub async fn create_state_provider_work_directory(&self, id: StateProviderId) -> Result<PathBuf> {
        let dir = self.state_provider_dir(id);
        if !self.has_persisted_state {
            return Ok(dir);
        }

        let legacy = self.legacy_state_provider_dir(id);
        if tokio::fs::try_exists(&legacy).await? {
            tokio::fs::create_dir_all(&self.replica_dir).await?;
            tokio::fs::rename(&legacy, &dir).await.map_err(|e| {
                Error::internal(format!(
                    "failed to migrate {} to {}: {e}",
                    legacy.display(),
                    dir.display()
                ))
            })?;
            info!(
                state_provider_id = %id,
                from = %legacy.display(),
                to = %dir.display(),
                "migrated version 0 state provider folder"
            );
            return Ok(dir);
        }

        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn remove_state_provider_work_directory(&self, id: StateProviderId) -> Result<()> {
        let dir = self.state_provider_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(state_provider_id = %id, "removed state provider folder");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete provider folders whose id is not in `referenced`
    pub async fn remove_unreferenced(
        &self,
        referenced: &HashSet<StateProviderId>,
        warn_after: Duration,
    ) -> Result<usize> {
        if !self.has_persisted_state {
            return Ok(0);
        }
        let start = Instant::now();
        let mut removed = 0;

        let mut entries = match tokio::fs::read_dir(&self.replica_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(id) = parse_state_provider_dir(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if referenced.contains(&id) {
                continue;
            }
            tokio::fs::remove_dir_all(entry.path()).await?;
            debug!(state_provider_id = %id, "removed unreferenced state provider folder");
            removed += 1;
        }

        let elapsed = start.elapsed();
        if elapsed > warn_after {
            warn!(
                removed,
                elapsed_ms = elapsed.as_millis(),
                "removing unreferenced state provider folders was slow"
            );
        }
        Ok(removed)
    }

    /// Delete the whole replica folder
    pub async fn remove_all(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.replica_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_state_provider_dir(name: &str) -> Option<StateProviderId> {
    name.parse::<i64>().ok().map(StateProviderId::new)
}

/// Contents of a work directory as seen by tooling
#[derive(Debug, Default)]
pub struct WorkDirScan {
    pub replica_dirs: Vec<ReplicaDirScan>,
    /// Version 0 folders still waiting for migration
    pub legacy_dirs: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct ReplicaDirScan {
    pub path: PathBuf,
    pub has_checkpoint: bool,
    pub state_provider_dirs: Vec<StateProviderId>,
}

/// Classify the folders below `base_dir`
pub fn scan(base_dir: &Path) -> Result<WorkDirScan> {
    let mut scan = WorkDirScan::default();
    for entry in std::fs::read_dir(base_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match name.split('_').count() {
            2 => {
                let path = entry.path();
                let mut ids: Vec<_> = std::fs::read_dir(&path)?
                    .filter_map(std::result::Result::ok)
                    .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
                    .filter_map(|e| parse_state_provider_dir(&e.file_name().to_string_lossy()))
                    .collect();
                ids.sort();
                scan.replica_dirs.push(ReplicaDirScan {
                    has_checkpoint: path.join(CHECKPOINT_FILE_NAME).is_file(),
                    path,
                    state_provider_dirs: ids,
                });
            }
            3 => scan.legacy_dirs.push(entry.path()),
            _ => {}
        }
    }
    scan.replica_dirs.sort_by(|a, b| a.path.cmp(&b.path));
    scan.legacy_dirs.sort();
    Ok(scan)
}
