//! Building a new secondary from the primary's copy stream
//!
//! The stream starts with one unit describing the directory, followed by
//! the units of every live provider, each tagged with the provider's id.

use super::{StateManager, is_delay_deleted, is_stale};
use crate::api_dispatcher::FailureAction;
use crate::constants::STATE_MANAGER_ID;
use crate::metadata::{Metadata, MetadataMode, SerializableMetadata};
use crate::metadata_manager::{MetadataFilter, MetadataManager};
use crate::operation_data::{NamedOperationData, OperationData, decode, encode};
use crate::state_provider::OperationDataStream;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use txnrep_common::{Error, ReplicaRole, Result, StateProviderId};

const COPY_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CopyHeader {
    version: u32,
    record_count: u64,
}

fn encode_directory(records: &[SerializableMetadata]) -> Result<OperationData> {
    let header = CopyHeader {
        version: COPY_VERSION,
        record_count: records.len() as u64,
    };
    let mut data = OperationData::single(encode(&header, "copy header")?);
    for record in records {
        data.push(encode(record, "copy record")?);
    }
    Ok(data)
}

fn decode_directory(data: &OperationData) -> Result<Vec<SerializableMetadata>> {
    let (header, rest) = data
        .buffers()
        .split_first()
        .ok_or_else(|| Error::Deserialization("copy unit has no header".into()))?;
    let header: CopyHeader = decode(header, "copy header")?;
    if header.version != COPY_VERSION {
        return Err(Error::Deserialization(format!(
            "unsupported copy version {}",
            header.version
        )));
    }
    if rest.len() as u64 != header.record_count {
        return Err(Error::Deserialization(format!(
            "copy header declares {} records but unit holds {}",
            header.record_count,
            rest.len()
        )));
    }
    rest.iter().map(|b| decode(b, "copy record")).collect()
}

/// Copy stream handed to a building secondary
pub struct CopyStream {
    directory: Option<OperationData>,
    providers: VecDeque<(StateProviderId, Box<dyn OperationDataStream>)>,
}

impl OperationDataStream for CopyStream {
    fn next(&mut self) -> Result<Option<OperationData>> {
        if let Some(directory) = self.directory.take() {
            return NamedOperationData::new(STATE_MANAGER_ID, Some(directory))
                .to_operation_data()
                .map(Some);
        }
        while let Some((id, stream)) = self.providers.front_mut() {
            if let Some(unit) = stream.next()? {
                return NamedOperationData::new(*id, Some(unit)).to_operation_data().map(Some);
            }
            self.providers.pop_front();
        }
        Ok(None)
    }
}

impl StateManager {
    /// Copy stream of the last prepared checkpoint
    pub fn get_current_state(&self) -> Result<CopyStream> {
        self.api_entry()?;
        let records = self.checkpoint_manager.get_current_state();
        let mm = self.metadata_manager();

        let mut providers = VecDeque::new();
        for record in records.iter().filter(|r| r.mode == MetadataMode::Active) {
            let id = record.state_provider_id;
            let Some(m) = mm
                .try_get_metadata_by_id(id, false)
                .or_else(|| mm.try_get_deleted_metadata(id))
            else {
                warn!(state_provider_id = %id, "checkpointed state provider is gone, not copied");
                continue;
            };
            providers.push_back((id, m.state_provider().get_current_state()?));
        }
        debug!(
            records = records.len(),
            providers = providers.len(),
            "created copy stream"
        );

        Ok(CopyStream {
            directory: Some(encode_directory(&records)?),
            providers,
        })
    }

    /// Tombstone everything local as false progress before a copy arrives
    pub async fn begin_setting_current_state_async(&self) -> Result<()> {
        self.api_entry()?;
        let mm = self.metadata_manager();
        mm.mark_all_deleted_state_providers(MetadataMode::FalseProgress);
        mm.move_state_providers_to_deleted_list();
        let deleted = mm.get_deleted_metadata_array();

        let fresh = self.replace_metadata_manager();
        for m in deleted {
            fresh.add_deleted(m.state_provider_id(), m);
        }
        self.copy_progress.lock().clear();
        info!(tombstoned = fresh.deleted_count(), "began building from copy");
        Ok(())
    }

    /// Apply one unit of the copy stream
    pub async fn set_current_state_async(&self, state_record_number: i64, data: OperationData) -> Result<()> {
        self.api_entry()?;
        let named = NamedOperationData::from_operation_data(&data)?;
        let id = named.state_provider_id;
        let unit = named.user_data.unwrap_or_default();

        if id == STATE_MANAGER_ID {
            let records = decode_directory(&unit)?;
            debug!(records = records.len(), "copying state manager directory");
            for record in records {
                self.copy_to_local_state(record).await?;
            }
            return Ok(());
        }

        let mm = self.metadata_manager();
        if is_delay_deleted(&mm, id) {
            return Err(Error::ObjectClosed);
        }
        let m = mm
            .try_get_metadata_by_id(id, false)
            .ok_or_else(|| Error::NotFound(format!("copied state provider {id}")))?;
        self.dispatcher.set_current_state(&m, state_record_number, unit).await
    }

    /// Finish the copy on every provider it touched
    pub async fn end_setting_current_state(&self, cancel: &CancellationToken) -> Result<()> {
        self.api_entry()?;
        let progress = std::mem::take(&mut *self.copy_progress.lock());
        let mm = self.metadata_manager();
        self.notifier
            .notify_rebuilt(&mm.get_in_memory_metadata_array(MetadataFilter::Active));
        self.dispatcher
            .end_setting_current_state_all(&progress, cancel)
            .await?;
        info!(
            copied = progress.len(),
            active = mm.active_count(),
            deleted = mm.deleted_count(),
            "finished building from copy"
        );
        Ok(())
    }

    async fn copy_to_local_state(&self, record: SerializableMetadata) -> Result<()> {
        let mm = self.metadata_manager();
        let id = record.state_provider_id;

        if is_stale(&mm, id) {
            self.reuse_local_state_provider(&mm, &record).await?;
        } else {
            let state_provider = self.dispatcher.create_state_provider(
                &record.name,
                id,
                &record.type_name,
                record.init_parameters.clone().map(Bytes::from),
            )?;
            let m = Arc::new(Metadata::from_serializable(&record, state_provider));
            if let Some(list) = self.initialize_state_providers_in_order(&mm, &m).await? {
                for entry in list {
                    self.install_copied(&mm, entry).await?;
                }
            }
        }
        self.id_allocator.update_last_id(id);
        Ok(())
    }

    /// Adopt the copied record for a provider this replica already hosts
    async fn reuse_local_state_provider(&self, mm: &MetadataManager, record: &SerializableMetadata) -> Result<()> {
        let id = record.state_provider_id;
        let m = mm
            .try_get_deleted_metadata(id)
            .ok_or_else(|| Error::internal(format!("stale state provider {id} vanished")))?;

        if record.mode == MetadataMode::Active {
            mm.acquire_lock_and_add(m.name(), Arc::clone(&m), Duration::MAX, &self.shutdown)
                .await?;
            mm.try_remove_deleted(id);
            m.set_mode(MetadataMode::Active);
            m.set_create_lsn(record.create_lsn);
            m.set_delete_lsn(record.delete_lsn);
            self.dispatcher.begin_setting_current_state(&m).await?;
            self.copy_progress.lock().push(m);
        } else {
            m.set_mode(record.mode);
            m.set_delete_lsn(record.delete_lsn);
        }
        debug!(state_provider_id = %id, mode = %record.mode, "reused local state provider for copy");
        Ok(())
    }

    async fn install_copied(&self, mm: &MetadataManager, entry: Arc<Metadata>) -> Result<()> {
        let cancel = &self.shutdown;
        self.dispatcher.open(&entry, cancel).await?;

        if entry.mode().is_deleted() {
            mm.add_deleted(entry.state_provider_id(), entry);
            return Ok(());
        }

        if let Err(e) = mm
            .acquire_lock_and_add(entry.name(), Arc::clone(&entry), Duration::MAX, cancel)
            .await
        {
            self.dispatcher
                .close(&entry, FailureAction::AbortStateProvider, cancel)
                .await?;
            return Err(e);
        }
        self.dispatcher.recover_checkpoint(&entry, cancel).await?;
        self.dispatcher
            .change_role(&entry, ReplicaRole::IdleSecondary, cancel)
            .await?;
        self.dispatcher.begin_setting_current_state(&entry).await?;
        self.copy_progress.lock().push(entry);
        Ok(())
    }
}
