//! State provider metadata records.

use crate::constants::EMPTY_STATE_PROVIDER_ID;
use crate::state_provider::StateProvider;
use bytes::Bytes;
use derive_more::Display;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use txnrep_common::{INVALID_LSN, Lsn, StateProviderId, TransactionId};

/// Lifecycle mode of a metadata record
///
/// Tombstone modes are ordered by how deleted they are: a `DelayDelete`
/// record is further gone than a `FalseProgress` one.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
pub enum MetadataMode {
    Active,
    FalseProgress,
    DelayDelete,
}

impl MetadataMode {
    #[must_use]
    pub const fn is_deleted(self) -> bool {
        matches!(self, Self::FalseProgress | Self::DelayDelete)
    }
}

#[derive(Clone, Copy, Debug)]
struct MetadataState {
    create_lsn: Lsn,
    delete_lsn: Lsn,
    mode: MetadataMode,
    transient_create: bool,
    transient_delete: bool,
    transaction_id: TransactionId,
}

/// Metadata for one state provider, shared between the directory maps
pub struct Metadata {
    name: String,
    state_provider_id: StateProviderId,
    parent_id: StateProviderId,
    type_name: String,
    init_parameters: Option<Bytes>,
    state_provider: Arc<dyn StateProvider>,
    state: Mutex<MetadataState>,
}

impl Metadata {
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        state_provider: Arc<dyn StateProvider>,
        init_parameters: Option<Bytes>,
        state_provider_id: StateProviderId,
        parent_id: StateProviderId,
    ) -> Self {
        Self {
            name: name.into(),
            state_provider_id,
            parent_id,
            type_name: type_name.into(),
            init_parameters,
            state_provider,
            state: Mutex::new(MetadataState {
                create_lsn: INVALID_LSN,
                delete_lsn: INVALID_LSN,
                mode: MetadataMode::Active,
                transient_create: false,
                transient_delete: false,
                transaction_id: TransactionId::INVALID,
            }),
        }
    }

    /// Rebuild a record from its persisted form around a freshly created provider
    pub fn from_serializable(record: &SerializableMetadata, state_provider: Arc<dyn StateProvider>) -> Self {
        Self::new(
            record.name.clone(),
            record.type_name.clone(),
            state_provider,
            record.init_parameters.clone().map(Bytes::from),
            record.state_provider_id,
            record.parent_id,
        )
        .with_create_lsn(record.create_lsn)
        .with_delete_lsn(record.delete_lsn)
        .with_mode(record.mode)
    }

    #[must_use]
    pub fn with_create_lsn(self, lsn: Lsn) -> Self {
        self.set_create_lsn(lsn);
        self
    }

    #[must_use]
    pub fn with_delete_lsn(self, lsn: Lsn) -> Self {
        self.set_delete_lsn(lsn);
        self
    }

    #[must_use]
    pub fn with_mode(self, mode: MetadataMode) -> Self {
        self.set_mode(mode);
        self
    }

    /// Mark the record as staged by `transaction_id` but not yet applied
    #[must_use]
    pub fn transient(self, transaction_id: TransactionId) -> Self {
        {
            let mut state = self.state.lock();
            state.transient_create = true;
            state.transaction_id = transaction_id;
        }
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn state_provider_id(&self) -> StateProviderId {
        self.state_provider_id
    }

    #[must_use]
    pub const fn parent_id(&self) -> StateProviderId {
        self.parent_id
    }

    /// Whether this record has no parent
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id == EMPTY_STATE_PROVIDER_ID
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub const fn init_parameters(&self) -> Option<&Bytes> {
        self.init_parameters.as_ref()
    }

    #[must_use]
    pub const fn state_provider(&self) -> &Arc<dyn StateProvider> {
        &self.state_provider
    }

    #[must_use]
    pub fn create_lsn(&self) -> Lsn {
        self.state.lock().create_lsn
    }

    pub fn set_create_lsn(&self, lsn: Lsn) {
        self.state.lock().create_lsn = lsn;
    }

    #[must_use]
    pub fn delete_lsn(&self) -> Lsn {
        self.state.lock().delete_lsn
    }

    pub fn set_delete_lsn(&self, lsn: Lsn) {
        self.state.lock().delete_lsn = lsn;
    }

    #[must_use]
    pub fn mode(&self) -> MetadataMode {
        self.state.lock().mode
    }

    pub fn set_mode(&self, mode: MetadataMode) {
        self.state.lock().mode = mode;
    }

    #[must_use]
    pub fn transient_create(&self) -> bool {
        self.state.lock().transient_create
    }

    pub fn set_transient_create(&self, value: bool) {
        self.state.lock().transient_create = value;
    }

    #[must_use]
    pub fn transient_delete(&self) -> bool {
        self.state.lock().transient_delete
    }

    /// Mark the record as pending removal by `transaction_id`
    pub fn mark_transient_delete(&self, transaction_id: TransactionId) {
        let mut state = self.state.lock();
        state.transient_delete = true;
        state.transaction_id = transaction_id;
    }

    pub fn clear_transient_delete(&self) {
        self.state.lock().transient_delete = false;
    }

    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.state.lock().transaction_id
    }

    /// LSN after which a tombstoned record may be erased
    ///
    /// `None` for active records.
    #[must_use]
    pub fn removal_lsn(&self) -> Option<Lsn> {
        let state = self.state.lock();
        match state.mode {
            MetadataMode::Active => None,
            MetadataMode::DelayDelete => {
                assert!(
                    state.delete_lsn != INVALID_LSN,
                    "delay-deleted state provider {} has no delete LSN",
                    self.state_provider_id
                );
                Some(state.delete_lsn)
            }
            MetadataMode::FalseProgress => Some(state.delete_lsn.max(state.create_lsn)),
        }
    }

    #[must_use]
    pub fn to_serializable(&self) -> SerializableMetadata {
        let state = *self.state.lock();
        SerializableMetadata {
            name: self.name.clone(),
            state_provider_id: self.state_provider_id,
            parent_id: self.parent_id,
            type_name: self.type_name.clone(),
            init_parameters: self.init_parameters.as_ref().map(|b| b.to_vec()),
            create_lsn: state.create_lsn,
            delete_lsn: state.delete_lsn,
            mode: state.mode,
        }
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("Metadata")
            .field("name", &self.name)
            .field("state_provider_id", &self.state_provider_id)
            .field("parent_id", &self.parent_id)
            .field("type_name", &self.type_name)
            .field("create_lsn", &state.create_lsn)
            .field("delete_lsn", &state.delete_lsn)
            .field("mode", &state.mode)
            .field("transient_create", &state.transient_create)
            .field("transient_delete", &state.transient_delete)
            .finish_non_exhaustive()
    }
}

/// Persisted form of a metadata record, used by checkpoints and copy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableMetadata {
    pub name: String,
    pub state_provider_id: StateProviderId,
    pub parent_id: StateProviderId,
    pub type_name: String,
    pub init_parameters: Option<Vec<u8>>,
    pub create_lsn: Lsn,
    pub delete_lsn: Lsn,
    pub mode: MetadataMode,
}
