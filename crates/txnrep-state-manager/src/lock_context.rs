//! Per-name reader/writer lock with a grant count
//!
//! Each state provider name gets one [`StateManagerLockContext`]. The
//! underlying `tokio` lock is held through owned guards so a lock acquired
//! by one task can be released by whichever task completes the transaction.
//! The grant count tracks how many transaction contexts still reference the
//! lock; re-entrant acquisitions by the owning transaction bump the count
//! instead of waiting. Read guards and the write guard are keyed by the
//! transaction holding them, so an upgrade only gives up a read grant the
//! upgrading transaction actually holds on this lock.

use crate::metadata_manager::MetadataManager;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use txnrep_common::{Error, Result, StateProviderId, TransactionId};

/// Mode of the most recent acquisition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

struct LockState {
    mode: LockMode,
    state_provider_id: StateProviderId,
    grantor_count: usize,
    read_guards: Vec<(TransactionId, OwnedRwLockReadGuard<()>)>,
    writer: Option<TransactionId>,
    write_guard: Option<OwnedRwLockWriteGuard<()>>,
    disposed: bool,
}

/// Lock guarding one state provider name
pub struct StateManagerLockContext {
    key: String,
    lock: Arc<RwLock<()>>,
    state: Mutex<LockState>,
    disposed: CancellationToken,
    metadata_manager: Weak<MetadataManager>,
}

impl StateManagerLockContext {
    pub(crate) fn new(
        key: impl Into<String>,
        state_provider_id: StateProviderId,
        metadata_manager: Weak<MetadataManager>,
    ) -> Self {
        Self {
            key: key.into(),
            lock: Arc::new(RwLock::new(())),
            state: Mutex::new(LockState {
                mode: LockMode::Read,
                state_provider_id,
                grantor_count: 0,
                read_guards: Vec::new(),
                writer: None,
                write_guard: None,
                disposed: false,
            }),
            disposed: CancellationToken::new(),
            metadata_manager,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Id of the provider the last writer locked this name for
    #[must_use]
    pub fn state_provider_id(&self) -> StateProviderId {
        self.state.lock().state_provider_id
    }

    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.state.lock().mode
    }

    #[must_use]
    pub fn grantor_count(&self) -> usize {
        self.state.lock().grantor_count
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// True while `txn` holds this lock exclusively
    #[must_use]
    pub fn is_write_held_by(&self, txn: TransactionId) -> bool {
        let state = self.state.lock();
        !state.disposed && state.write_guard.is_some() && state.writer == Some(txn)
    }

    pub(crate) fn metadata_manager(&self) -> Option<Arc<MetadataManager>> {
        self.metadata_manager.upgrade()
    }

    pub(crate) async fn acquire_read(
        &self,
        txn: TransactionId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let guard = self
            .wait(Arc::clone(&self.lock).read_owned(), timeout, cancel)
            .await?;
        let mut state = self.state.lock();
        if state.disposed {
            drop(state);
            drop(guard);
            return Err(Error::ObjectDisposed);
        }
        state.mode = LockMode::Read;
        state.read_guards.push((txn, guard));
        state.grantor_count += 1;
        Ok(())
    }

    /// Acquire exclusively, counting `grants` contexts against the lock
    pub(crate) async fn acquire_write(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        grants: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let guard = self
            .wait(Arc::clone(&self.lock).write_owned(), timeout, cancel)
            .await?;
        let mut state = self.state.lock();
        if state.disposed {
            drop(state);
            drop(guard);
            return Err(Error::ObjectDisposed);
        }
        state.mode = LockMode::Write;
        state.state_provider_id = state_provider_id;
        state.writer = Some(txn);
        state.write_guard = Some(guard);
        state.grantor_count += grants;
        Ok(())
    }

    /// Grant an already-held write lock to another context of the same transaction
    pub(crate) fn grant_reentrant_write(&self, state_provider_id: StateProviderId) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(Error::ObjectDisposed);
        }
        state.state_provider_id = state_provider_id;
        state.grantor_count += 1;
        Ok(())
    }

    /// Give up the read grant `txn` holds so it can upgrade to write
    ///
    /// Returns false if `txn` holds no read grant on this lock.
    pub(crate) fn release_read_for_upgrade(&self, txn: TransactionId) -> bool {
        let guard = Self::take_read_guard(&mut self.state.lock(), txn);
        guard.is_some()
    }

    /// Release one grant held by `txn`
    ///
    /// Returns true once the caller no longer holds the lock in any form.
    pub(crate) fn release(&self, txn: TransactionId) -> bool {
        let mut state = self.state.lock();
        match state.mode {
            LockMode::Write => {
                state.grantor_count = state.grantor_count.saturating_sub(1);
                if state.grantor_count > 0 {
                    return false;
                }
                state.writer = None;
                let guard = state.write_guard.take();
                drop(state);
                drop(guard);
                true
            }
            LockMode::Read => {
                let guard = Self::take_read_guard(&mut state, txn);
                drop(state);
                drop(guard);
                true
            }
        }
    }

    fn take_read_guard(state: &mut LockState, txn: TransactionId) -> Option<OwnedRwLockReadGuard<()>> {
        let pos = state.read_guards.iter().position(|(holder, _)| *holder == txn)?;
        state.grantor_count = state.grantor_count.saturating_sub(1);
        Some(state.read_guards.swap_remove(pos).1)
    }

    /// Dispose the lock when the caller holds the only grant
    ///
    /// Returns false, leaving the lock untouched, if others still hold it.
    pub(crate) fn dispose_if_sole_holder(&self) -> bool {
        {
            let state = self.state.lock();
            if state.grantor_count > 1 {
                return false;
            }
        }
        self.dispose();
        true
    }

    /// Release every guard and fail all waiters with [`Error::ObjectDisposed`]
    pub(crate) fn dispose(&self) {
        let (reads, write) = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.grantor_count = 0;
            state.writer = None;
            (
                std::mem::take(&mut state.read_guards),
                state.write_guard.take(),
            )
        };
        drop(reads);
        drop(write);
        self.disposed.cancel();
    }

    async fn wait<F, T>(&self, acquire: F, timeout: Duration, cancel: &CancellationToken) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let deadline = Instant::now().checked_add(timeout);
        let expiry = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.disposed.cancelled() => Err(Error::ObjectDisposed),
            () = cancel.cancelled() => Err(Error::Cancelled),
            guard = acquire => Ok(guard),
            () = expiry => Err(Error::Timeout),
        }
    }
}

impl fmt::Debug for StateManagerLockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StateManagerLockContext")
            .field("key", &self.key)
            .field("state_provider_id", &state.state_provider_id)
            .field("mode", &state.mode)
            .field("grantor_count", &state.grantor_count)
            .field("writer", &state.writer)
            .field("disposed", &state.disposed)
            .finish_non_exhaustive()
    }
}
