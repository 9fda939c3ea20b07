//! The replicated state provider manager
//!
//! `StateManager` owns the directory of state providers hosted by a replica
//! and keeps it consistent with the replicated log:
//!
//! - structural changes (add, remove) are replicated operations guarded by
//!   per-name locks ([`structural`])
//! - replicated operations are applied per role ([`apply`])
//! - open, close and role changes fan out to every provider ([`lifecycle`])
//! - checkpoints, backup and restore ([`checkpoint`]) and copy to a new
//!   secondary ([`copy`]) move the directory between disk and replicas
//! - provider operations are routed to the logging replicator ([`routing`])
//!
//! A provider is never registered in the directory before it opened
//! successfully; every close and abort path relies on that.

mod apply;
mod checkpoint;
mod copy;
mod lifecycle;
mod routing;
mod structural;

use crate::api_dispatcher::{ApiDispatcher, FailureAction};
use crate::checkpoint_manager::CheckpointManager;
use crate::constants::{STATE_MANAGER_ID, STATE_MANAGER_NAME};
use crate::id_allocator::IdAllocator;
use crate::metadata::{Metadata, MetadataMode};
use crate::metadata_manager::{MetadataFilter, MetadataManager};
use crate::notification::{ChangeNotifier, StateManagerChangeHandler};
use crate::replicator::{FaultType, LockContext, LoggingReplicator, OperationContext, Partition};
use crate::state_provider::{StateProvider, StateProviderFactory};
use crate::work_dir::WorkDirectory;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use txnrep_common::{
    AccessStatus, Error, PartitionedReplicaId, ReplicaRole, Result, StateManagerConfig,
    StateProviderId, TransactionId,
};

pub use copy::CopyStream;

#[derive(Clone, Copy, Debug)]
struct RoleState {
    role: ReplicaRole,
    change_role_completed: bool,
}

/// Manager of the state providers of one replica
pub struct StateManager {
    config: StateManagerConfig,
    partitioned_replica_id: PartitionedReplicaId,
    work_dir: WorkDirectory,
    partition: Arc<dyn Partition>,
    logging_replicator: Weak<dyn LoggingReplicator>,
    dispatcher: ApiDispatcher,
    metadata_manager: RwLock<Arc<MetadataManager>>,
    checkpoint_manager: CheckpointManager,
    id_allocator: Arc<IdAllocator>,
    notifier: ChangeNotifier,
    role: Mutex<RoleState>,
    change_role_lock: tokio::sync::RwLock<()>,
    prepared: Mutex<Vec<Arc<Metadata>>>,
    copy_progress: Mutex<Vec<Arc<Metadata>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl StateManager {
    pub fn new(
        config: StateManagerConfig,
        partitioned_replica_id: PartitionedReplicaId,
        partition: Arc<dyn Partition>,
        logging_replicator: Weak<dyn LoggingReplicator>,
        factory: Arc<dyn StateProviderFactory>,
    ) -> Self {
        let work_dir = WorkDirectory::new(
            &config.work_dir,
            partitioned_replica_id,
            config.has_persisted_state,
        );
        let checkpoint_manager = CheckpointManager::new(
            work_dir.checkpoint_file(),
            config.checkpoint.clone(),
            config.has_persisted_state,
        );
        info!(
            replica = %partitioned_replica_id,
            work_dir = %work_dir.replica_dir().display(),
            "state manager created"
        );

        Self {
            dispatcher: ApiDispatcher::new(partitioned_replica_id, factory),
            config,
            partitioned_replica_id,
            work_dir,
            partition,
            logging_replicator,
            metadata_manager: RwLock::new(MetadataManager::new()),
            checkpoint_manager,
            id_allocator: Arc::new(IdAllocator::system()),
            notifier: ChangeNotifier::default(),
            role: Mutex::new(RoleState {
                role: ReplicaRole::Unknown,
                change_role_completed: true,
            }),
            change_role_lock: tokio::sync::RwLock::new(()),
            prepared: Mutex::new(Vec::new()),
            copy_progress: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use a specific id allocator, e.g. one shared by all replicas of a process
    #[must_use]
    pub fn with_id_allocator(mut self, id_allocator: Arc<IdAllocator>) -> Self {
        self.id_allocator = id_allocator;
        self
    }

    #[must_use]
    pub const fn partitioned_replica_id(&self) -> PartitionedReplicaId {
        self.partitioned_replica_id
    }

    #[must_use]
    pub const fn work_directory(&self) -> &WorkDirectory {
        &self.work_dir
    }

    #[must_use]
    pub fn role(&self) -> ReplicaRole {
        self.role.lock().role
    }

    /// Current directory; replaced wholesale by restore and copy
    #[must_use]
    pub fn metadata_manager(&self) -> Arc<MetadataManager> {
        Arc::clone(&self.metadata_manager.read())
    }

    pub fn register_change_handler(&self, handler: Arc<dyn StateManagerChangeHandler>) -> Result<()> {
        self.notifier.register(handler)
    }

    pub fn unregister_change_handler(&self) {
        self.notifier.unregister();
    }

    // Reads

    /// Provider registered under `name`
    pub fn get(&self, name: &str) -> Result<Arc<dyn StateProvider>> {
        self.api_entry()?;
        validate_name(name, false)?;
        self.check_readable()?;
        self.metadata_manager()
            .try_get_metadata(name, false)
            .map(|m| Arc::clone(m.state_provider()))
            .ok_or_else(|| Error::NameDoesNotExist(name.to_owned()))
    }

    /// Snapshot of the registered providers
    pub fn create_enumerator(&self, parents_only: bool) -> Result<Vec<(String, Arc<dyn StateProvider>)>> {
        self.api_entry()?;
        self.check_readable()?;
        let mut providers: Vec<_> = self
            .metadata_manager()
            .get_in_memory_metadata_array(MetadataFilter::Active)
            .into_iter()
            .filter(|m| !parents_only || m.is_root())
            .map(|m| (m.name().to_owned(), Arc::clone(m.state_provider())))
            .collect();
        providers.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(providers)
    }

    /// Fail unless `id` is a registered provider
    pub fn is_registered(
        &self,
        id: StateProviderId,
        check_for_deleting: bool,
        transaction_id: TransactionId,
    ) -> Result<()> {
        if id == STATE_MANAGER_ID {
            return Ok(());
        }
        let m = self
            .metadata_manager()
            .try_get_metadata_by_id(id, false)
            .ok_or_else(|| Error::invalid_parameter(format!("state provider {id} is not registered")))?;
        if check_for_deleting && m.transient_delete() && m.transaction_id() == transaction_id {
            return Err(Error::ObjectClosed);
        }
        Ok(())
    }

    // Unlock

    /// Release a context returned by apply
    pub fn unlock(&self, context: OperationContext) -> Result<()> {
        match context {
            OperationContext::StateManager(ctx) => ctx.unlock(),
            OperationContext::Named {
                state_provider_id,
                context,
            } => {
                let mm = self.metadata_manager();
                let m = mm
                    .try_get_metadata_by_id(state_provider_id, true)
                    .or_else(|| mm.try_get_deleted_metadata(state_provider_id))
                    .ok_or_else(|| Error::NotFound(format!("state provider {state_provider_id}")))?;
                m.state_provider().unlock(context)
            }
        }
    }

    /// Unlock after a single-operation transaction aborted, faulting the replica on failure
    pub fn single_operation_transaction_abort_unlock(
        &self,
        state_provider_id: StateProviderId,
        context: OperationContext,
    ) {
        if let Err(e) = self.unlock(context) {
            error!(
                state_provider_id = %state_provider_id,
                error = %e,
                "unlock after aborted single operation transaction failed"
            );
            self.partition.report_fault(FaultType::Transient);
        }
    }

    // Entry checks

    fn api_entry(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ObjectClosed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        match self.partition.write_status()? {
            AccessStatus::NotPrimary => Err(Error::NotPrimary),
            _ => Ok(()),
        }
    }

    fn check_readable(&self) -> Result<()> {
        if self.partition.read_status()? == AccessStatus::Granted {
            return Ok(());
        }
        if self.role() == ReplicaRole::ActiveSecondary && self.logging_replicator()?.is_readable() {
            return Ok(());
        }
        Err(Error::NotReadable)
    }

    fn logging_replicator(&self) -> Result<Arc<dyn LoggingReplicator>> {
        self.logging_replicator.upgrade().ok_or(Error::ObjectClosed)
    }

    /// Swap in an empty directory, disposing the old one's locks
    fn replace_metadata_manager(&self) -> Arc<MetadataManager> {
        let fresh = MetadataManager::new();
        let old = std::mem::replace(&mut *self.metadata_manager.write(), Arc::clone(&fresh));
        old.dispose();
        fresh
    }

    // Provider tree initialization

    /// Initialize `metadata` and, for a root, collect it with its registered children
    ///
    /// Children are initialized first and parked under their parent; a child
    /// yields `None`.
    async fn initialize_state_providers_in_order(
        &self,
        mm: &MetadataManager,
        metadata: &Arc<Metadata>,
    ) -> Result<Option<Vec<Arc<Metadata>>>> {
        let id = metadata.state_provider_id();
        let children = mm.get_children(id);
        let work_dir = self.work_dir.create_state_provider_work_directory(id).await?;
        self.dispatcher.initialize(metadata, work_dir, &children)?;

        if !metadata.is_root() {
            mm.add_child(metadata.parent_id(), Arc::clone(metadata));
            return Ok(None);
        }

        let mut list = vec![Arc::clone(metadata)];
        let mut pending = VecDeque::from([id]);
        while let Some(parent) = pending.pop_front() {
            for child in mm.try_remove_parent(parent).unwrap_or_default() {
                pending.push_back(child.state_provider_id());
                list.push(child);
            }
        }
        Ok(Some(list))
    }

    /// Open, recover and role-align a new provider tree, then register it
    async fn initialize_state_providers(
        &self,
        mm: &MetadataManager,
        metadata: &Arc<Metadata>,
        should_add: bool,
    ) -> Result<()> {
        let Some(list) = self.initialize_state_providers_in_order(mm, metadata).await? else {
            return Ok(());
        };
        let cancel = &self.shutdown;

        for m in &list {
            self.dispatcher.open(m, cancel).await?;
            if let Err(e) = self.dispatcher.recover_checkpoint(m, cancel).await {
                self.dispatcher
                    .close(m, FailureAction::AbortStateProvider, cancel)
                    .await?;
                return Err(e);
            }

            {
                let _guard = self.change_role_lock.write().await;
                if let Err(e) = self.align_role(m, self.role()).await {
                    self.dispatcher
                        .close(m, FailureAction::AbortStateProvider, cancel)
                        .await?;
                    return Err(e);
                }
            }

            if should_add {
                assert!(
                    mm.try_add(m.name(), Arc::clone(m)),
                    "state provider {} initialized twice",
                    m.name()
                );
            } else {
                mm.reset_transient_state(m.name());
            }
            debug!(
                state_provider_id = %m.state_provider_id(),
                name = %m.name(),
                "state provider initialized"
            );
        }
        Ok(())
    }

    /// Bring a freshly opened provider to the replica's role
    ///
    /// Providers are only initialized by applies, which run once the replica
    /// has been given a role.
    async fn align_role(&self, metadata: &Metadata, role: ReplicaRole) -> Result<()> {
        let cancel = &self.shutdown;
        match role {
            ReplicaRole::Primary | ReplicaRole::IdleSecondary => {
                self.dispatcher.change_role(metadata, role, cancel).await
            }
            ReplicaRole::ActiveSecondary => {
                self.dispatcher
                    .change_role(metadata, ReplicaRole::IdleSecondary, cancel)
                    .await?;
                self.dispatcher
                    .change_role(metadata, ReplicaRole::ActiveSecondary, cancel)
                    .await
            }
            ReplicaRole::Unknown | ReplicaRole::None => unreachable!(
                "state provider {} initialized while the replica role is {role}",
                metadata.name()
            ),
        }
    }

    // Bulk operations over every provider

    fn all_state_providers(&self) -> (Vec<Arc<Metadata>>, Vec<Arc<Metadata>>) {
        let mm = self.metadata_manager();
        (
            mm.get_in_memory_metadata_array(MetadataFilter::All),
            mm.get_deleted_metadata_array(),
        )
    }

    async fn open_state_providers(&self, cancel: &CancellationToken) -> Result<()> {
        let (active, deleted) = self.all_state_providers();
        assert!(
            active.iter().all(|m| !m.transient_create()),
            "transient state provider found while opening"
        );
        let opened = async {
            self.dispatcher.open_all(&active, cancel).await?;
            self.dispatcher.open_all(&deleted, cancel).await
        }
        .await;
        if let Err(e) = &opened {
            error!(error = %e, "opening state providers failed, aborting them");
            self.abort_state_providers();
        }
        opened
    }

    async fn recover_state_providers(&self, cancel: &CancellationToken) -> Result<()> {
        let active = self
            .metadata_manager()
            .get_in_memory_metadata_array(MetadataFilter::Active);
        self.dispatcher.recover_checkpoint_all(&active, cancel).await
    }

    async fn close_state_providers(&self, cancel: &CancellationToken) {
        let (active, deleted) = self.all_state_providers();
        for list in [&active, &deleted] {
            if let Err(e) = self
                .dispatcher
                .close_all(list, FailureAction::AbortStateProvider, cancel)
                .await
            {
                error!(error = %e, "closing state providers failed");
            }
        }
    }

    fn abort_state_providers(&self) {
        let (active, deleted) = self.all_state_providers();
        self.dispatcher.abort_all(&active);
        self.dispatcher.abort_all(&deleted);
    }

    async fn change_role_on_state_providers(
        &self,
        role: ReplicaRole,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = self.change_role_lock.write().await;
        let active = self
            .metadata_manager()
            .get_in_memory_metadata_array(MetadataFilter::Active);
        self.dispatcher.change_role_all(&active, role, cancel).await
    }

    async fn remove_state_on_state_providers(&self, cancel: &CancellationToken) -> Result<()> {
        let (active, deleted) = self.all_state_providers();
        {
            let _guard = self.change_role_lock.write().await;
            self.dispatcher
                .change_role_all(&deleted, ReplicaRole::None, cancel)
                .await?;
        }
        self.dispatcher.remove_state_all(&active).await?;
        self.dispatcher.remove_state_all(&deleted).await
    }
}

/// Check that `name` is a usable state provider name
///
/// Names are absolute URIs such as `fabric:/orders`; the state manager's own
/// name is reserved unless `allow_reserved` is set.
pub fn validate_name(name: &str, allow_reserved: bool) -> Result<()> {
    let invalid = || Error::InvalidName(name.to_owned());
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (scheme, rest) = name.split_once(':').ok_or_else(invalid)?;
    let mut chars = scheme.chars();
    let scheme_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'));
    if !scheme_ok || rest.is_empty() {
        return Err(invalid());
    }
    if !allow_reserved && name == STATE_MANAGER_NAME {
        return Err(invalid());
    }
    Ok(())
}

/// Tombstones at least as deleted as false progress
fn is_stale(mm: &MetadataManager, id: StateProviderId) -> bool {
    mm.is_state_provider_deleted_or_stale(id, MetadataMode::FalseProgress)
}

/// Tombstones whose delete was applied
fn is_delay_deleted(mm: &MetadataManager, id: StateProviderId) -> bool {
    mm.is_state_provider_deleted_or_stale(id, MetadataMode::DelayDelete)
}
