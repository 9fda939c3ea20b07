//! Test doubles for state providers and the replication seams

use crate::constants::EMPTY_STATE_PROVIDER_ID;
use crate::notification::StateManagerChangeHandler;
use crate::operation_data::{ApplyType, MetadataOperationData, OperationData, RedoOperationData};
use crate::replicator::{
    ApplyContext, FaultType, LockContext, LoggingReplicator, OperationContext, Partition, Transaction,
    TransactionBase, UserContext,
};
use crate::state_manager::StateManager;
use crate::state_provider::{
    FactoryArguments, InitializationContext, OperationDataStream, StateProvider, StateProviderFactory,
    StateProviderInfo, VecOperationDataStream,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use txnrep_common::{
    AccessStatus, Error, INVALID_LSN, Lsn, PartitionedReplicaId, ReplicaRole, Result, StateManagerConfig,
    StateProviderId, TransactionId,
};

type EventLog = Arc<Mutex<Vec<String>>>;

const STATE_FILE: &str = "state.bin";

/// State provider that records every call and keeps its state as a list of blobs
pub struct TestStateProvider {
    name: String,
    log: EventLog,
    children: Vec<StateProviderInfo>,
    init_parameters: Option<Bytes>,
    faults: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<&'static str>>,
    open: AtomicBool,
    role: Mutex<ReplicaRole>,
    state: Mutex<Vec<Vec<u8>>>,
    applied: Mutex<Vec<(Lsn, Vec<u8>, Vec<u8>)>>,
    unlocks: AtomicUsize,
    initialized_children: AtomicUsize,
}

impl TestStateProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build("", EventLog::default(), Vec::new(), None, HashSet::new()))
    }

    fn build(
        name: &str,
        log: EventLog,
        children: Vec<StateProviderInfo>,
        init_parameters: Option<Bytes>,
        faults: HashSet<&'static str>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            log,
            children,
            init_parameters,
            faults: Mutex::new(faults),
            calls: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
            role: Mutex::new(ReplicaRole::Unknown),
            state: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            unlocks: AtomicUsize::new(0),
            initialized_children: AtomicUsize::new(0),
        }
    }

    fn record(&self, call: &'static str) -> Result<()> {
        self.calls.lock().push(call);
        self.log.lock().push(format!("{call} {}", self.name));
        if self.faults.lock().contains(call) {
            return Err(Error::provider(format!("{call} failed for {}", self.name)));
        }
        Ok(())
    }

    pub fn fail(&self, call: &'static str) {
        self.faults.lock().insert(call);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> ReplicaRole {
        *self.role.lock()
    }

    pub fn state(&self) -> Vec<Vec<u8>> {
        self.state.lock().clone()
    }

    pub fn set_state<B: AsRef<[u8]>>(&self, items: &[B]) {
        *self.state.lock() = items.iter().map(|b| b.as_ref().to_vec()).collect();
    }

    pub fn applied(&self) -> Vec<(Lsn, Vec<u8>, Vec<u8>)> {
        self.applied.lock().clone()
    }

    pub fn unlock_count(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }

    pub fn init_parameters(&self) -> Option<Bytes> {
        self.init_parameters.clone()
    }

    pub fn initialized_children(&self) -> usize {
        self.initialized_children.load(Ordering::SeqCst)
    }
}

fn first_buffer(data: Option<&OperationData>) -> Vec<u8> {
    data.and_then(OperationData::first)
        .map(|b| b.to_vec())
        .unwrap_or_default()
}

#[async_trait]
impl StateProvider for TestStateProvider {
    fn initialize(&self, context: InitializationContext) -> Result<()> {
        self.record("initialize")?;
        self.initialized_children
            .store(context.children.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn open(&self, _cancel: &CancellationToken) -> Result<()> {
        self.record("open")?;
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn change_role(&self, role: ReplicaRole, _cancel: &CancellationToken) -> Result<()> {
        self.record("change_role")?;
        *self.role.lock() = role;
        Ok(())
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<()> {
        self.record("close")?;
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self) {
        self.calls.lock().push("abort");
        self.open.store(false, Ordering::SeqCst);
    }

    async fn recover_checkpoint(&self, _cancel: &CancellationToken) -> Result<()> {
        self.record("recover_checkpoint")
    }

    fn prepare_checkpoint(&self, _checkpoint_lsn: Lsn) -> Result<()> {
        self.record("prepare_checkpoint")
    }

    async fn perform_checkpoint(&self, _cancel: &CancellationToken) -> Result<()> {
        self.record("perform_checkpoint")
    }

    async fn complete_checkpoint(&self, _cancel: &CancellationToken) -> Result<()> {
        self.record("complete_checkpoint")
    }

    async fn remove_state(&self, _state_provider_id: StateProviderId) -> Result<()> {
        self.record("remove_state")?;
        self.state.lock().clear();
        Ok(())
    }

    async fn backup_checkpoint(&self, backup_dir: &Path, _cancel: &CancellationToken) -> Result<()> {
        self.record("backup_checkpoint")?;
        let bytes = bincode::serialize(&*self.state.lock())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(backup_dir.join(STATE_FILE), bytes)?;
        Ok(())
    }

    async fn restore_checkpoint(&self, backup_dir: &Path, _cancel: &CancellationToken) -> Result<()> {
        self.record("restore_checkpoint")?;
        let bytes = std::fs::read(backup_dir.join(STATE_FILE))?;
        *self.state.lock() =
            bincode::deserialize(&bytes).map_err(|e| Error::Deserialization(e.to_string()))?;
        Ok(())
    }

    fn get_current_state(&self) -> Result<Box<dyn OperationDataStream>> {
        self.record("get_current_state")?;
        let units = self
            .state
            .lock()
            .iter()
            .map(|item| OperationData::single(Bytes::from(item.clone())))
            .collect();
        Ok(Box::new(VecOperationDataStream::new(units)))
    }

    async fn begin_setting_current_state(&self) -> Result<()> {
        self.record("begin_setting_current_state")?;
        self.state.lock().clear();
        Ok(())
    }

    async fn set_current_state(&self, _state_record_number: i64, data: OperationData) -> Result<()> {
        self.record("set_current_state")?;
        self.state.lock().push(first_buffer(Some(&data)));
        Ok(())
    }

    async fn end_setting_current_state(&self, _cancel: &CancellationToken) -> Result<()> {
        self.record("end_setting_current_state")
    }

    async fn apply(
        &self,
        lsn: Lsn,
        _transaction: &dyn TransactionBase,
        _apply_context: ApplyContext,
        metadata: Option<OperationData>,
        data: Option<OperationData>,
    ) -> Result<Option<UserContext>> {
        self.record("apply")?;
        self.applied
            .lock()
            .push((lsn, first_buffer(metadata.as_ref()), first_buffer(data.as_ref())));
        Ok(Some(Arc::new(lsn)))
    }

    fn unlock(&self, _context: UserContext) -> Result<()> {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_children(&self, _name: &str) -> Result<Vec<StateProviderInfo>> {
        Ok(self.children.clone())
    }

    async fn prepare_for_remove(
        &self,
        _transaction: &dyn Transaction,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.record("prepare_for_remove")
    }
}

/// Factory of [`TestStateProvider`]s; the type name `Unknown` is rejected
#[derive(Default)]
pub struct TestFactory {
    log: EventLog,
    children: Mutex<HashMap<String, Vec<StateProviderInfo>>>,
    faults: Mutex<HashMap<String, HashSet<&'static str>>>,
    created: Mutex<Vec<Arc<TestStateProvider>>>,
}

impl TestFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn declare_children(&self, name: &str, children: &[&str]) {
        let infos = children
            .iter()
            .map(|c| StateProviderInfo::new("Store", *c))
            .collect();
        self.children.lock().insert(name.to_owned(), infos);
    }

    /// Make `call` fail on providers named `name`, present and future
    pub fn fail(&self, name: &str, call: &'static str) {
        self.faults
            .lock()
            .entry(name.to_owned())
            .or_default()
            .insert(call);
        if let Some(p) = self.provider(name) {
            p.fail(call);
        }
    }

    /// Most recently created provider named `name`
    pub fn provider(&self, name: &str) -> Option<Arc<TestStateProvider>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|p| p.name == name)
            .cloned()
    }

    pub fn created_count(&self, name: &str) -> usize {
        self.created.lock().iter().filter(|p| p.name == name).count()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl StateProviderFactory for TestFactory {
    fn create(&self, args: FactoryArguments) -> Result<Arc<dyn StateProvider>> {
        if args.type_name == "Unknown" {
            return Err(Error::invalid_parameter(format!("unknown type {}", args.type_name)));
        }
        let provider = Arc::new(TestStateProvider::build(
            &args.name,
            Arc::clone(&self.log),
            self.children.lock().get(&args.name).cloned().unwrap_or_default(),
            args.init_parameters,
            self.faults.lock().get(&args.name).cloned().unwrap_or_default(),
        ));
        self.created.lock().push(Arc::clone(&provider));
        Ok(provider)
    }
}

#[derive(Clone)]
pub struct RecordedOperation {
    pub state_provider_id: StateProviderId,
    pub metadata: Option<OperationData>,
    pub redo: Option<OperationData>,
}

struct InjectedFailures {
    remaining: usize,
    error: Option<fn() -> Error>,
}

/// Transaction that buffers operations and applies them as primary on commit
pub struct TestTransaction {
    id: TransactionId,
    commit_lsn: AtomicI64,
    operations: Mutex<Vec<RecordedOperation>>,
    lock_contexts: Mutex<Vec<Arc<dyn LockContext>>>,
    failures: Mutex<InjectedFailures>,
    rejected: AtomicUsize,
}

impl TestTransaction {
    pub fn new(id: i64) -> Arc<Self> {
        Arc::new(Self {
            id: TransactionId::new(id),
            commit_lsn: AtomicI64::new(INVALID_LSN),
            operations: Mutex::new(Vec::new()),
            lock_contexts: Mutex::new(Vec::new()),
            failures: Mutex::new(InjectedFailures {
                remaining: 0,
                error: None,
            }),
            rejected: AtomicUsize::new(0),
        })
    }

    /// A transaction that already committed at `commit_lsn`, as seen by a secondary
    pub fn committed(id: i64, commit_lsn: Lsn) -> Arc<Self> {
        let txn = Self::new(id);
        txn.commit_lsn.store(commit_lsn, Ordering::SeqCst);
        txn
    }

    pub fn operations(&self) -> Vec<RecordedOperation> {
        self.operations.lock().clone()
    }

    pub fn lock_context_count(&self) -> usize {
        self.lock_contexts.lock().len()
    }

    /// Reject the next `count` operations with `error`
    pub fn fail_next_operations(&self, count: usize, error: fn() -> Error) {
        *self.failures.lock() = InjectedFailures {
            remaining: count,
            error: Some(error),
        };
    }

    pub fn rejected_operations(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    /// Apply every operation as primary starting at `lsn`, then release all locks
    pub async fn commit(&self, sm: &StateManager, lsn: Lsn) -> Result<Lsn> {
        let operations = std::mem::take(&mut *self.operations.lock());
        let last = lsn + operations.len().saturating_sub(1) as Lsn;
        self.commit_lsn.store(last, Ordering::SeqCst);

        let mut contexts = Vec::new();
        for (lsn, op) in (lsn..).zip(operations) {
            if let Some(ctx) = sm
                .apply_async(lsn, self, ApplyContext::PRIMARY_REDO, op.state_provider_id, op.metadata, op.redo)
                .await?
            {
                contexts.push(ctx);
            }
        }
        for ctx in contexts {
            sm.unlock(ctx)?;
        }
        self.release_locks()?;
        Ok(last)
    }

    pub fn abort(&self) -> Result<()> {
        self.operations.lock().clear();
        self.release_locks()
    }

    fn release_locks(&self) -> Result<()> {
        let contexts = std::mem::take(&mut *self.lock_contexts.lock());
        contexts.iter().try_for_each(|c| c.unlock())
    }
}

impl TransactionBase for TestTransaction {
    fn transaction_id(&self) -> TransactionId {
        self.id
    }

    fn commit_sequence_number(&self) -> Lsn {
        self.commit_lsn.load(Ordering::SeqCst)
    }
}

impl Transaction for TestTransaction {
    fn add_lock_context(&self, lock_context: Arc<dyn LockContext>) -> Result<()> {
        self.lock_contexts.lock().push(lock_context);
        Ok(())
    }

    fn add_operation(
        &self,
        metadata: Option<OperationData>,
        _undo: Option<OperationData>,
        redo: Option<OperationData>,
        state_provider_id: StateProviderId,
        _context: Option<OperationContext>,
    ) -> Result<()> {
        {
            let mut failures = self.failures.lock();
            if failures.remaining > 0 {
                failures.remaining -= 1;
                self.rejected.fetch_add(1, Ordering::SeqCst);
                if let Some(error) = failures.error {
                    return Err(error());
                }
            }
        }
        self.operations.lock().push(RecordedOperation {
            state_provider_id,
            metadata,
            redo,
        });
        Ok(())
    }
}

type RecordedCall = (&'static str, Option<OperationData>, Option<OperationContext>);

/// Logging replicator that records routed operations
pub struct TestLoggingReplicator {
    safe_lsn: AtomicI64,
    readable: AtomicBool,
    next_lsn: AtomicI64,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl TestLoggingReplicator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            safe_lsn: AtomicI64::new(0),
            readable: AtomicBool::new(true),
            next_lsn: AtomicI64::new(1),
            recorded: Mutex::new(Vec::new()),
        })
    }

    pub fn set_safe_lsn(&self, lsn: Lsn) {
        self.safe_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn set_readable(&self, readable: bool) {
        self.readable.store(readable, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.recorded.lock().clone()
    }

    fn record(&self, call: &'static str, metadata: Option<OperationData>, context: Option<OperationContext>) -> Lsn {
        self.recorded.lock().push((call, metadata, context));
        self.next_lsn.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl LoggingReplicator for TestLoggingReplicator {
    fn begin_transaction(
        &self,
        _transaction: &dyn Transaction,
        metadata: Option<OperationData>,
        _undo: Option<OperationData>,
        _redo: Option<OperationData>,
        context: Option<OperationContext>,
    ) -> Result<()> {
        self.record("begin_transaction", metadata, context);
        Ok(())
    }

    async fn begin_transaction_async(
        &self,
        _transaction: &dyn Transaction,
        metadata: Option<OperationData>,
        _undo: Option<OperationData>,
        _redo: Option<OperationData>,
        context: Option<OperationContext>,
    ) -> Result<Lsn> {
        Ok(self.record("begin_transaction_async", metadata, context))
    }

    fn add_operation(
        &self,
        _transaction: &dyn Transaction,
        metadata: Option<OperationData>,
        _undo: Option<OperationData>,
        _redo: Option<OperationData>,
        context: Option<OperationContext>,
    ) -> Result<()> {
        self.record("add_operation", metadata, context);
        Ok(())
    }

    async fn add_operation_async(
        &self,
        _operation: &dyn TransactionBase,
        metadata: Option<OperationData>,
        _undo: Option<OperationData>,
        _redo: Option<OperationData>,
        context: Option<OperationContext>,
    ) -> Result<Lsn> {
        Ok(self.record("add_operation_async", metadata, context))
    }

    async fn add_redo_only_operation_async(
        &self,
        _operation: &dyn TransactionBase,
        metadata: Option<OperationData>,
        _redo: Option<OperationData>,
        context: Option<OperationContext>,
    ) -> Result<Lsn> {
        Ok(self.record("add_redo_only_operation_async", metadata, context))
    }

    fn safe_lsn_to_remove_state_provider(&self) -> Lsn {
        self.safe_lsn.load(Ordering::SeqCst)
    }

    fn is_readable(&self) -> bool {
        self.readable.load(Ordering::SeqCst)
    }
}

/// Partition with settable access status
pub struct TestPartition {
    read_status: Mutex<AccessStatus>,
    write_status: Mutex<AccessStatus>,
    faults: Mutex<Vec<FaultType>>,
}

impl TestPartition {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            read_status: Mutex::new(AccessStatus::Granted),
            write_status: Mutex::new(AccessStatus::Granted),
            faults: Mutex::new(Vec::new()),
        })
    }

    pub fn set_read_status(&self, status: AccessStatus) {
        *self.read_status.lock() = status;
    }

    pub fn set_write_status(&self, status: AccessStatus) {
        *self.write_status.lock() = status;
    }

    pub fn faults(&self) -> Vec<FaultType> {
        self.faults.lock().clone()
    }
}

impl Partition for TestPartition {
    fn read_status(&self) -> Result<AccessStatus> {
        Ok(*self.read_status.lock())
    }

    fn write_status(&self) -> Result<AccessStatus> {
        Ok(*self.write_status.lock())
    }

    fn report_fault(&self, fault: FaultType) {
        self.faults.lock().push(fault);
    }
}

/// Change handler that records events as `"<kind> <name>"`
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl StateManagerChangeHandler for RecordingHandler {
    fn on_rebuilt(&self, state_providers: Vec<(String, Arc<dyn StateProvider>)>) {
        let mut names: Vec<_> = state_providers.into_iter().map(|(n, _)| n).collect();
        names.sort();
        self.events
            .lock()
            .extend(names.into_iter().map(|n| format!("rebuilt {n}")));
    }

    fn on_added(&self, _transaction: &dyn TransactionBase, name: &str, _state_provider: &Arc<dyn StateProvider>) {
        self.events.lock().push(format!("added {name}"));
    }

    fn on_removed(&self, _transaction: &dyn TransactionBase, name: &str, _state_provider: &Arc<dyn StateProvider>) {
        self.events.lock().push(format!("removed {name}"));
    }
}

/// Replicated insert of a root provider of type `Store`
pub fn insert_operation(
    id: StateProviderId,
    name: &str,
    init_parameters: Option<Bytes>,
) -> (OperationData, Option<OperationData>) {
    let metadata = MetadataOperationData::new(id, name, ApplyType::Insert)
        .to_operation_data()
        .unwrap();
    let redo = RedoOperationData::new("Store", init_parameters.as_ref(), EMPTY_STATE_PROVIDER_ID)
        .to_operation_data()
        .unwrap();
    (metadata, Some(redo))
}

pub fn delete_operation(id: StateProviderId, name: &str) -> (OperationData, Option<OperationData>) {
    let metadata = MetadataOperationData::new(id, name, ApplyType::Delete)
        .to_operation_data()
        .unwrap();
    (metadata, None)
}

const TIMEOUT: Duration = Duration::from_secs(5);

/// A state manager wired to test doubles over a temporary work directory
pub struct Harness {
    pub sm: Arc<StateManager>,
    pub factory: Arc<TestFactory>,
    pub replicator: Arc<TestLoggingReplicator>,
    pub partition: Arc<TestPartition>,
    pub cancel: CancellationToken,
    dir: Arc<TempDir>,
    partitioned_replica_id: PartitionedReplicaId,
    next_txn: AtomicI64,
    next_lsn: AtomicI64,
}

impl Harness {
    /// Created but not opened
    pub fn new() -> Self {
        let dir = Arc::new(tempfile::tempdir().unwrap());
        Self::over(dir, PartitionedReplicaId::random(1))
    }

    fn over(dir: Arc<TempDir>, partitioned_replica_id: PartitionedReplicaId) -> Self {
        let factory = TestFactory::new();
        let replicator = TestLoggingReplicator::new();
        let partition = TestPartition::new();
        let weak: Weak<dyn LoggingReplicator> = Arc::downgrade(&replicator) as Weak<dyn LoggingReplicator>;
        let sm = StateManager::new(
            StateManagerConfig::with_work_dir(dir.path()),
            partitioned_replica_id,
            Arc::clone(&partition) as Arc<dyn Partition>,
            weak,
            Arc::clone(&factory) as Arc<dyn StateProviderFactory>,
        );
        Self {
            sm: Arc::new(sm),
            factory,
            replicator,
            partition,
            cancel: CancellationToken::new(),
            dir,
            partitioned_replica_id,
            next_txn: AtomicI64::new(1_000),
            next_lsn: AtomicI64::new(1),
        }
    }

    /// A new state manager over the same replica folder
    pub fn reopen(&self) -> Self {
        Self::over(Arc::clone(&self.dir), self.partitioned_replica_id)
    }

    async fn opened(role_path: &[ReplicaRole]) -> Self {
        let h = Self::new();
        h.sm.open_async(false, false, &h.cancel).await.unwrap();
        for role in role_path {
            h.change_role(*role).await;
        }
        h
    }

    pub async fn primary() -> Self {
        Self::opened(&[ReplicaRole::Primary]).await
    }

    pub async fn idle_secondary() -> Self {
        Self::opened(&[ReplicaRole::IdleSecondary]).await
    }

    pub async fn secondary() -> Self {
        Self::opened(&[ReplicaRole::IdleSecondary, ReplicaRole::ActiveSecondary]).await
    }

    pub async fn change_role(&self, role: ReplicaRole) {
        self.sm.change_role_async(role, &self.cancel).await.unwrap();
    }

    fn transaction(&self) -> Arc<TestTransaction> {
        TestTransaction::new(self.next_txn.fetch_add(1, Ordering::SeqCst))
    }

    async fn commit(&self, txn: &TestTransaction) -> Lsn {
        let count = txn.operations().len().max(1) as Lsn;
        let lsn = self.next_lsn.fetch_add(count, Ordering::SeqCst);
        txn.commit(&self.sm, lsn).await.unwrap()
    }

    /// Add `name` in its own transaction and commit it; returns the commit LSN
    pub async fn add_committed(&self, name: &str) -> Lsn {
        let txn = self.transaction();
        self.sm
            .add_async(&*txn, name, "Store", None, TIMEOUT, &self.cancel)
            .await
            .unwrap();
        self.commit(&txn).await
    }

    /// Remove `name` in its own transaction and commit it; returns the commit LSN
    pub async fn remove_committed(&self, name: &str) -> Lsn {
        let txn = self.transaction();
        self.sm
            .remove_async(&*txn, name, TIMEOUT, &self.cancel)
            .await
            .unwrap();
        self.commit(&txn).await
    }

    pub fn id_of(&self, name: &str) -> StateProviderId {
        self.sm
            .metadata_manager()
            .try_get_metadata(name, false)
            .map(|m| m.state_provider_id())
            .unwrap()
    }

    /// Run a full prepare, perform, complete cycle at `lsn`
    pub async fn checkpoint(&self, lsn: Lsn) {
        self.sm.prepare_checkpoint(lsn).unwrap();
        self.sm.perform_checkpoint_async(&self.cancel).await.unwrap();
        self.sm.complete_checkpoint_async(&self.cancel).await.unwrap();
    }
}
