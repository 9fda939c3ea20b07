//! In-memory directory of state provider metadata
//!
//! The directory keeps three views of the same records:
//!
//! - `in_memory`: every live record by name, including records staged by a
//!   transaction that has not been applied yet (transient)
//! - `id_map`: live, non-transient records by id
//! - `deleted`: tombstones by id, waiting for cleanup or resurrection
//!
//! It also owns the per-name locks. The directory mutex is never held while
//! a lock context's state is touched, and the other way round.

use crate::lock_context::{LockMode, StateManagerLockContext};
use crate::metadata::{Metadata, MetadataMode};
use crate::transaction_context::{OperationType, StateManagerTransactionContext};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use txnrep_common::{Error, INVALID_LSN, Result, StateProviderId, TransactionId};

/// Which live records a snapshot should include
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataFilter {
    /// Records whose insert has been applied
    Active,
    /// Records staged by an open transaction
    Transient,
    All,
}

#[derive(Default)]
struct DirectoryState {
    in_memory: HashMap<String, Arc<Metadata>>,
    id_map: BTreeMap<StateProviderId, Arc<Metadata>>,
    deleted: BTreeMap<StateProviderId, Arc<Metadata>>,
    key_locks: HashMap<String, Arc<StateManagerLockContext>>,
    parent_to_children: HashMap<StateProviderId, Vec<Arc<Metadata>>>,
}

/// Directory of state provider metadata and the locks guarding it
pub struct MetadataManager {
    me: Weak<Self>,
    state: Mutex<DirectoryState>,
}

impl MetadataManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(DirectoryState::default()),
        })
    }

    // Lookups

    #[must_use]
    pub fn try_get_metadata(&self, name: &str, allow_transient: bool) -> Option<Arc<Metadata>> {
        let state = self.state.lock();
        state
            .in_memory
            .get(name)
            .filter(|m| allow_transient || !m.transient_create())
            .cloned()
    }

    #[must_use]
    pub fn try_get_metadata_by_id(
        &self,
        id: StateProviderId,
        allow_transient: bool,
    ) -> Option<Arc<Metadata>> {
        let state = self.state.lock();
        if let Some(m) = state.id_map.get(&id) {
            return Some(Arc::clone(m));
        }
        if !allow_transient {
            return None;
        }
        state
            .in_memory
            .values()
            .find(|m| m.state_provider_id() == id)
            .cloned()
    }

    #[must_use]
    pub fn contains_key(&self, name: &str, allow_transient: bool) -> bool {
        self.try_get_metadata(name, allow_transient).is_some()
    }

    #[must_use]
    pub fn try_get_deleted_metadata(&self, id: StateProviderId) -> Option<Arc<Metadata>> {
        self.state.lock().deleted.get(&id).cloned()
    }

    /// True if `id` is tombstoned in at least `threshold`'s mode
    #[must_use]
    pub fn is_state_provider_deleted_or_stale(
        &self,
        id: StateProviderId,
        threshold: MetadataMode,
    ) -> bool {
        let Some(m) = self.try_get_deleted_metadata(id) else {
            return false;
        };
        let mode = m.mode();
        assert!(
            mode != MetadataMode::DelayDelete || m.delete_lsn() != INVALID_LSN,
            "delay-deleted state provider {id} has no delete LSN"
        );
        mode >= threshold
    }

    #[must_use]
    pub fn get_in_memory_metadata_array(&self, filter: MetadataFilter) -> Vec<Arc<Metadata>> {
        let state = self.state.lock();
        state
            .in_memory
            .values()
            .filter(|m| match filter {
                MetadataFilter::Active => !m.transient_create(),
                MetadataFilter::Transient => m.transient_create(),
                MetadataFilter::All => true,
            })
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get_deleted_metadata_array(&self) -> Vec<Arc<Metadata>> {
        self.state.lock().deleted.values().cloned().collect()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().id_map.len()
    }

    #[must_use]
    pub fn deleted_count(&self) -> usize {
        self.state.lock().deleted.len()
    }

    // Mutations

    /// Insert a live record; false if the name is taken
    pub fn try_add(&self, name: &str, metadata: Arc<Metadata>) -> bool {
        let mut state = self.state.lock();
        if state.in_memory.contains_key(name) {
            return false;
        }
        if !metadata.transient_create() {
            state
                .id_map
                .insert(metadata.state_provider_id(), Arc::clone(&metadata));
        }
        state.in_memory.insert(name.to_owned(), metadata);
        true
    }

    /// Clear the transient flag of an applied insert and index it by id
    pub fn reset_transient_state(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let Some(m) = state.in_memory.get(name).cloned() else {
            return false;
        };
        m.set_transient_create(false);
        state.id_map.insert(m.state_provider_id(), m);
        true
    }

    /// Move a live record into the tombstone map
    ///
    /// The caller must hold the name's write lock.
    pub fn soft_delete(&self, name: &str, mode: MetadataMode) {
        assert!(mode.is_deleted(), "soft delete of {name} with live mode {mode}");
        let lock = self.state.lock().key_locks.get(name).cloned();
        assert!(
            lock.is_some_and(|l| l.mode() == LockMode::Write),
            "soft delete of {name} without its write lock"
        );

        let mut state = self.state.lock();
        let m = state
            .in_memory
            .remove(name)
            .unwrap_or_else(|| panic!("soft delete of unknown state provider {name}"));
        m.set_mode(mode);
        state.id_map.remove(&m.state_provider_id());
        state.deleted.insert(m.state_provider_id(), m);
    }

    pub fn add_deleted(&self, id: StateProviderId, metadata: Arc<Metadata>) {
        assert!(
            metadata.mode().is_deleted(),
            "state provider {id} added to the deleted list while {}",
            metadata.mode()
        );
        self.state.lock().deleted.insert(id, metadata);
    }

    pub fn try_remove_deleted(&self, id: StateProviderId) -> Option<Arc<Metadata>> {
        self.state.lock().deleted.remove(&id)
    }

    /// Stamp every tombstone with `mode`
    pub fn mark_all_deleted_state_providers(&self, mode: MetadataMode) {
        for m in self.get_deleted_metadata_array() {
            m.set_mode(mode);
        }
    }

    /// Tombstone every live record as false progress
    pub fn move_state_providers_to_deleted_list(&self) {
        let mut state = self.state.lock();
        let live: Vec<_> = state.in_memory.drain().map(|(_, m)| m).collect();
        state.id_map.clear();
        for m in live {
            m.set_mode(MetadataMode::FalseProgress);
            state.deleted.insert(m.state_provider_id(), m);
        }
    }

    /// Take the write lock for `name` outside any transaction and register the record
    pub async fn acquire_lock_and_add(
        &self,
        name: &str,
        metadata: Arc<Metadata>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = metadata.state_provider_id();
        let lock = loop {
            let lock = self.get_or_create_lock(name, id);
            match lock.acquire_write(TransactionId::INVALID, id, 1, timeout, cancel).await {
                Ok(()) => break lock,
                Err(Error::ObjectDisposed) => {}
                Err(e) => return Err(e),
            }
        };

        {
            let mut state = self.state.lock();
            assert!(
                !state.in_memory.contains_key(name),
                "state provider {name} registered twice"
            );
            state.id_map.insert(id, Arc::clone(&metadata));
            state.in_memory.insert(name.to_owned(), metadata);
        }

        self.release_lock(&lock, TransactionId::INVALID);
        Ok(())
    }

    /// Bring a tombstoned record back to life under its original id
    pub async fn resurrect(
        &self,
        id: StateProviderId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<Metadata>> {
        let m = self
            .try_get_deleted_metadata(id)
            .ok_or_else(|| Error::NotFound(format!("deleted state provider {id}")))?;
        self.acquire_lock_and_add(m.name(), Arc::clone(&m), timeout, cancel)
            .await?;
        m.set_delete_lsn(INVALID_LSN);
        m.set_mode(MetadataMode::Active);
        m.clear_transient_delete();
        self.try_remove_deleted(id);
        debug!(state_provider_id = %id, name = %m.name(), "resurrected state provider");
        Ok(m)
    }

    // Hierarchy bookkeeping used while initializing provider trees

    pub fn add_child(&self, parent_id: StateProviderId, child: Arc<Metadata>) {
        self.state
            .lock()
            .parent_to_children
            .entry(parent_id)
            .or_default()
            .push(child);
    }

    #[must_use]
    pub fn get_children(&self, parent_id: StateProviderId) -> Vec<Arc<Metadata>> {
        self.state
            .lock()
            .parent_to_children
            .get(&parent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn try_remove_parent(&self, parent_id: StateProviderId) -> Option<Vec<Arc<Metadata>>> {
        self.state.lock().parent_to_children.remove(&parent_id)
    }

    // Locking

    pub async fn lock_for_read(
        &self,
        name: &str,
        id: StateProviderId,
        txn: TransactionId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<StateManagerLockContext>> {
        let lock = loop {
            let lock = self.get_or_create_lock(name, id);
            if lock.is_write_held_by(txn) {
                match lock.grant_reentrant_write(lock.state_provider_id()) {
                    Ok(()) => break lock,
                    Err(Error::ObjectDisposed) => continue,
                    Err(e) => return Err(e),
                }
            }
            match lock.acquire_read(txn, timeout, cancel).await {
                Ok(()) => break lock,
                Err(Error::ObjectDisposed) => {}
                Err(e) => return Err(e),
            }
        };
        Ok(lock)
    }

    pub async fn lock_for_write(
        &self,
        name: &str,
        id: StateProviderId,
        txn: TransactionId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<StateManagerLockContext>> {
        let lock = loop {
            let lock = self.get_or_create_lock(name, id);
            if lock.is_write_held_by(txn) {
                match lock.grant_reentrant_write(id) {
                    Ok(()) => break lock,
                    Err(Error::ObjectDisposed) => continue,
                    Err(e) => return Err(e),
                }
            }
            // The read context still unlocks later, so it keeps a grant on the write lock.
            // A read grant left on a disposed lock does not carry over.
            let grants = if lock.release_read_for_upgrade(txn) { 2 } else { 1 };
            match lock.acquire_write(txn, id, grants, timeout, cancel).await {
                Ok(()) => break lock,
                Err(Error::ObjectDisposed) => {}
                Err(e) => return Err(e),
            }
        };
        Ok(lock)
    }

    /// Release the lock behind a committed or aborted structural operation
    pub fn unlock(&self, context: &StateManagerTransactionContext) -> Result<()> {
        let lock = context.lock_context();
        let txn = context.transaction_id();
        let key = lock.key();
        let current = self.try_get_metadata(key, true);

        match context.operation_type() {
            OperationType::Add => match current {
                Some(m) if m.state_provider_id() == lock.state_provider_id() && m.transient_create() => {
                    debug!(name = %key, txn_id = %txn, "removing aborted transient add");
                    self.remove(key, m.state_provider_id(), txn);
                }
                Some(_) => self.release_lock(lock, txn),
                None => self.remove_lock(lock, txn),
            },
            OperationType::Remove => match current {
                Some(m) => {
                    if m.transient_delete() {
                        m.clear_transient_delete();
                    }
                    self.release_lock(lock, txn);
                }
                None => self.remove_lock(lock, txn),
            },
            OperationType::Read => match current {
                Some(_) => self.release_lock(lock, txn),
                None => self.remove_lock(lock, txn),
            },
        }
        Ok(())
    }

    /// Drop a record and its lock
    pub fn remove(&self, name: &str, id: StateProviderId, txn: TransactionId) {
        let lock = {
            let mut state = self.state.lock();
            if state
                .in_memory
                .get(name)
                .is_some_and(|m| m.state_provider_id() == id)
            {
                state.in_memory.remove(name);
                state.id_map.remove(&id);
            }
            state.key_locks.get(name).cloned()
        };
        if let Some(lock) = lock {
            self.remove_lock(&lock, txn);
        }
    }

    /// Dispose the lock if this is its last grant, otherwise release one grant
    pub fn remove_lock(&self, lock: &Arc<StateManagerLockContext>, txn: TransactionId) {
        if lock.dispose_if_sole_holder() {
            let mut state = self.state.lock();
            if state
                .key_locks
                .get(lock.key())
                .is_some_and(|l| Arc::ptr_eq(l, lock))
            {
                state.key_locks.remove(lock.key());
            }
        } else {
            self.release_lock(lock, txn);
        }
    }

    pub fn release_lock(&self, lock: &Arc<StateManagerLockContext>, txn: TransactionId) {
        if !lock.release(txn) {
            debug!(name = %lock.key(), txn_id = %txn, grants = lock.grantor_count(), "lock still granted");
        }
    }

    /// Dispose every lock; waiters fail with [`Error::ObjectDisposed`]
    pub fn dispose(&self) {
        let locks: Vec<_> = {
            let mut state = self.state.lock();
            state.key_locks.drain().map(|(_, l)| l).collect()
        };
        for lock in locks {
            lock.dispose();
        }
    }

    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.state.lock().key_locks.len()
    }

    fn get_or_create_lock(&self, name: &str, id: StateProviderId) -> Arc<StateManagerLockContext> {
        let mut state = self.state.lock();
        Arc::clone(
            state
                .key_locks
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(StateManagerLockContext::new(name, id, self.me.clone()))),
        )
    }
}
