//! Adding and removing state providers inside a transaction

use super::{StateManager, validate_name};
use crate::constants::{EMPTY_STATE_PROVIDER_ID, STATE_MANAGER_ID};
use crate::metadata::Metadata;
use crate::metadata_manager::MetadataManager;
use crate::operation_data::{ApplyType, MetadataOperationData, OperationData, RedoOperationData};
use crate::replicator::Transaction;
use crate::state_provider::StateProvider;
use crate::transaction_context::{OperationType, StateManagerTransactionContext};
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use txnrep_common::{Error, Result, StateProviderId};

/// A provider created for an add but not yet staged in the directory
struct PendingAdd {
    name: String,
    state_provider_id: StateProviderId,
    state_provider: Arc<dyn StateProvider>,
    type_name: String,
    init_parameters: Option<Bytes>,
    parent_id: StateProviderId,
}

/// Initialization parameters travel as at most one buffer
fn single_init_parameter(init_parameters: Option<OperationData>) -> Result<Option<Bytes>> {
    let Some(data) = init_parameters else {
        return Ok(None);
    };
    if data.len() > 1 {
        return Err(Error::invalid_parameter(format!(
            "initialization parameters must be a single buffer, got {}",
            data.len()
        )));
    }
    Ok(data.into_buffers().into_iter().next())
}

impl StateManager {
    /// Register a new state provider (and the children it declares) in `transaction`
    ///
    /// The provider becomes visible once the transaction commits and its
    /// insert is applied. Children are staged before their parent.
    pub async fn add_async(
        &self,
        transaction: &dyn Transaction,
        name: &str,
        type_name: &str,
        init_parameters: Option<OperationData>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.api_entry()?;
        validate_name(name, false)?;
        self.check_writable()?;
        let init_parameters = single_init_parameter(init_parameters)?;

        let mm = self.metadata_manager();
        if mm.contains_key(name, true) {
            return Err(Error::NameAlreadyExists(name.to_owned()));
        }

        let root = self.create_pending(name, type_name, init_parameters, EMPTY_STATE_PROVIDER_ID)?;
        self.lock_for_write_in(transaction, &mm, name, root.state_provider_id, OperationType::Add, timeout, cancel)
            .await?;
        if mm.contains_key(name, true) {
            return Err(Error::NameAlreadyExists(name.to_owned()));
        }

        self.add_tree(transaction, &mm, root, timeout, cancel).await
    }

    /// Return the provider registered under `name`, adding it first if needed
    ///
    /// The flag is true when the provider already existed.
    pub async fn get_or_add_async(
        &self,
        transaction: &dyn Transaction,
        name: &str,
        type_name: &str,
        init_parameters: Option<OperationData>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(Arc<dyn StateProvider>, bool)> {
        self.api_entry()?;
        validate_name(name, false)?;
        self.check_writable()?;
        let init_parameters = single_init_parameter(init_parameters)?;

        let mm = self.metadata_manager();
        let txn_id = transaction.transaction_id();
        let lock = mm
            .lock_for_read(name, EMPTY_STATE_PROVIDER_ID, txn_id, timeout, cancel)
            .await?;
        let context = Arc::new(StateManagerTransactionContext::new(txn_id, lock, OperationType::Read));
        self.register_lock_context(transaction, &mm, context)?;
        if let Some(m) = mm.try_get_metadata(name, false) {
            return Ok((Arc::clone(m.state_provider()), true));
        }

        let root = self.create_pending(name, type_name, init_parameters, EMPTY_STATE_PROVIDER_ID)?;
        self.lock_for_write_in(transaction, &mm, name, root.state_provider_id, OperationType::Add, timeout, cancel)
            .await?;
        if let Some(m) = mm.try_get_metadata(name, false) {
            return Ok((Arc::clone(m.state_provider()), true));
        }

        let state_provider = Arc::clone(&root.state_provider);
        self.add_tree(transaction, &mm, root, timeout, cancel).await?;
        Ok((state_provider, false))
    }

    /// Unregister `name` and its children in `transaction`
    ///
    /// Fails fast: a child that cannot be removed fails the call and the
    /// caller is expected to abort the transaction.
    pub async fn remove_async(
        &self,
        transaction: &dyn Transaction,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.api_entry()?;
        validate_name(name, false)?;
        self.check_writable()?;

        let mm = self.metadata_manager();
        let root = mm
            .try_get_metadata(name, false)
            .ok_or_else(|| Error::NameDoesNotExist(name.to_owned()))?;
        let children = Self::collect_child_names(&mm, &root)?;

        self.remove_single(transaction, &mm, name, timeout, cancel).await?;
        for child in &children {
            self.remove_single(transaction, &mm, child, timeout, cancel).await?;
        }
        Ok(())
    }

    fn create_pending(
        &self,
        name: &str,
        type_name: &str,
        init_parameters: Option<Bytes>,
        parent_id: StateProviderId,
    ) -> Result<PendingAdd> {
        let state_provider_id = self.id_allocator.next();
        let state_provider = self.dispatcher.create_state_provider(
            name,
            state_provider_id,
            type_name,
            init_parameters.clone(),
        )?;
        Ok(PendingAdd {
            name: name.to_owned(),
            state_provider_id,
            state_provider,
            type_name: type_name.to_owned(),
            init_parameters,
            parent_id,
        })
    }

    /// Stage the declared children of `root`, then `root` itself
    ///
    /// The caller already holds the root's write lock.
    async fn add_tree(
        &self,
        transaction: &dyn Transaction,
        mm: &MetadataManager,
        root: PendingAdd,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let children = self.discover_children(&root)?;
        for child in children {
            self.lock_for_write_in(
                transaction,
                mm,
                &child.name,
                child.state_provider_id,
                OperationType::Add,
                timeout,
                cancel,
            )
            .await?;
            self.add_single(transaction, mm, child, timeout, cancel).await?;
        }
        self.add_single(transaction, mm, root, timeout, cancel).await
    }

    /// Walk the declared hierarchy below `root` breadth first
    fn discover_children(&self, root: &PendingAdd) -> Result<Vec<PendingAdd>> {
        let mut seen = HashSet::from([root.name.clone()]);
        let mut children = Vec::new();
        let mut pending = VecDeque::from([(root.name.clone(), Arc::clone(&root.state_provider))]);

        while let Some((name, state_provider)) = pending.pop_front() {
            for info in state_provider.get_children(&name)? {
                if !seen.insert(info.name.clone()) {
                    continue;
                }
                validate_name(&info.name, false)?;
                let child = self.create_pending(
                    &info.name,
                    &info.type_name,
                    info.init_parameters,
                    root.state_provider_id,
                )?;
                pending.push_back((child.name.clone(), Arc::clone(&child.state_provider)));
                children.push(child);
            }
        }
        Ok(children)
    }

    /// Names of the registered children below `root`, breadth first
    fn collect_child_names(mm: &MetadataManager, root: &Metadata) -> Result<Vec<String>> {
        let mut seen = HashSet::from([root.name().to_owned()]);
        let mut names = Vec::new();
        let mut pending = VecDeque::from([(root.name().to_owned(), Arc::clone(root.state_provider()))]);

        while let Some((name, state_provider)) = pending.pop_front() {
            for info in state_provider.get_children(&name)? {
                if !seen.insert(info.name.clone()) {
                    continue;
                }
                if let Some(child) = mm.try_get_metadata(&info.name, false) {
                    pending.push_back((info.name.clone(), Arc::clone(child.state_provider())));
                }
                names.push(info.name);
            }
        }
        Ok(names)
    }

    async fn add_single(
        &self,
        transaction: &dyn Transaction,
        mm: &MetadataManager,
        pending: PendingAdd,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let PendingAdd {
            name,
            state_provider_id,
            state_provider,
            type_name,
            init_parameters,
            parent_id,
        } = pending;

        let redo = RedoOperationData::new(&type_name, init_parameters.as_ref(), parent_id)
            .to_operation_data()?;
        let metadata = Arc::new(
            Metadata::new(
                name.as_str(),
                type_name,
                state_provider,
                init_parameters,
                state_provider_id,
                parent_id,
            )
            .transient(transaction.transaction_id()),
        );
        if !mm.try_add(&name, metadata) {
            return Err(Error::NameAlreadyExists(name));
        }
        debug!(
            %name,
            state_provider_id = %state_provider_id,
            txn_id = %transaction.transaction_id(),
            "staged state provider insert"
        );

        let operation = MetadataOperationData::new(state_provider_id, name, ApplyType::Insert)
            .to_operation_data()?;
        self.replicate(transaction, operation, Some(redo), timeout, cancel).await
    }

    async fn remove_single(
        &self,
        transaction: &dyn Transaction,
        mm: &MetadataManager,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = mm
            .try_get_metadata(name, false)
            .map(|m| m.state_provider_id())
            .ok_or_else(|| Error::NameDoesNotExist(name.to_owned()))?;
        self.lock_for_write_in(transaction, mm, name, id, OperationType::Remove, timeout, cancel)
            .await?;

        let m = mm
            .try_get_metadata(name, true)
            .ok_or_else(|| Error::NameDoesNotExist(name.to_owned()))?;
        assert!(
            !m.transient_create(),
            "remove of {name} while its insert is pending"
        );
        if m.transient_delete() {
            return Err(Error::NameDoesNotExist(name.to_owned()));
        }
        m.mark_transient_delete(transaction.transaction_id());
        m.state_provider()
            .prepare_for_remove(transaction, timeout, cancel)
            .await?;
        debug!(
            %name,
            state_provider_id = %m.state_provider_id(),
            txn_id = %transaction.transaction_id(),
            "staged state provider delete"
        );

        let operation = MetadataOperationData::new(m.state_provider_id(), name, ApplyType::Delete)
            .to_operation_data()?;
        self.replicate(transaction, operation, None, timeout, cancel).await
    }

    /// Take the write lock for `name` and hand it to `transaction`
    #[allow(clippy::too_many_arguments)]
    async fn lock_for_write_in(
        &self,
        transaction: &dyn Transaction,
        mm: &MetadataManager,
        name: &str,
        id: StateProviderId,
        operation_type: OperationType,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let txn_id = transaction.transaction_id();
        let lock = mm.lock_for_write(name, id, txn_id, timeout, cancel).await?;
        let context = Arc::new(StateManagerTransactionContext::new(txn_id, lock, operation_type));
        self.register_lock_context(transaction, mm, context)
    }

    fn register_lock_context(
        &self,
        transaction: &dyn Transaction,
        mm: &MetadataManager,
        context: Arc<StateManagerTransactionContext>,
    ) -> Result<()> {
        if let Err(e) = transaction.add_lock_context(Arc::clone(&context) as _) {
            mm.unlock(&context)?;
            return Err(e);
        }
        Ok(())
    }

    /// Append a structural operation, retrying while the log pushes back
    async fn replicate(
        &self,
        transaction: &dyn Transaction,
        metadata: OperationData,
        redo: Option<OperationData>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let retry = &self.config.replication;
        let start = Instant::now();
        let mut backoff = retry.starting_backoff();
        let mut retries = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let error = match transaction.add_operation(
                Some(metadata.clone()),
                None,
                redo.clone(),
                STATE_MANAGER_ID,
                None,
            ) {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if start.elapsed() >= timeout {
                return Err(Error::Timeout);
            }
            backoff = retry.next_backoff(backoff);
            retries += 1;
            if retries >= retry.max_retry_count {
                warn!(
                    txn_id = %transaction.transaction_id(),
                    error = %error,
                    backoff_ms = backoff.as_millis(),
                    "structural operation still retrying"
                );
                retries = 0;
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, TestTransaction};
    use txnrep_common::AccessStatus;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_add_then_get() {
        let h = Harness::primary().await;
        let txn = TestTransaction::new(1);
        h.sm.add_async(&*txn, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
            .await
            .unwrap();

        // Staged but not applied
        assert!(matches!(h.sm.get("fabric:/a"), Err(Error::NameDoesNotExist(_))));

        txn.commit(&h.sm, 10).await.unwrap();
        let provider = h.sm.get("fabric:/a").unwrap();
        let test_provider = h.factory.provider("fabric:/a").unwrap();
        assert!(Arc::ptr_eq(&provider, &(test_provider.clone() as Arc<dyn StateProvider>)));
        assert!(test_provider.is_open());

        let m = h.sm.metadata_manager().try_get_metadata("fabric:/a", false).unwrap();
        assert_eq!(m.create_lsn(), 10);
        assert_eq!(h.sm.metadata_manager().lock_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let h = Harness::primary().await;
        h.add_committed("fabric:/a").await;

        let txn = TestTransaction::new(2);
        let err = h
            .sm
            .add_async(&*txn, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameAlreadyExists(_)));
        txn.abort().unwrap();
    }

    #[tokio::test]
    async fn test_add_validation() {
        let h = Harness::primary().await;
        let txn = TestTransaction::new(1);

        let err = h
            .sm
            .add_async(&*txn, "not a uri", "Store", None, TIMEOUT, &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)));

        let two_buffers = OperationData::from_buffers(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        let err = h
            .sm
            .add_async(&*txn, "fabric:/a", "Store", Some(two_buffers), TIMEOUT, &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));

        h.partition.set_write_status(AccessStatus::NotPrimary);
        let err = h
            .sm
            .add_async(&*txn, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotPrimary));
        assert!(txn.operations().is_empty());
    }

    #[tokio::test]
    async fn test_abort_leaves_no_trace() {
        let h = Harness::primary().await;
        let txn = TestTransaction::new(1);
        h.sm.add_async(&*txn, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
            .await
            .unwrap();
        txn.abort().unwrap();

        let mm = h.sm.metadata_manager();
        assert!(!mm.contains_key("fabric:/a", true));
        assert_eq!(mm.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_children_staged_before_parent() {
        let h = Harness::primary().await;
        h.factory.declare_children("fabric:/a", &["fabric:/a/x", "fabric:/a/y"]);
        h.factory.declare_children("fabric:/a/x", &["fabric:/a/x/deep", "fabric:/a/y"]);

        let txn = TestTransaction::new(1);
        h.sm.add_async(&*txn, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
            .await
            .unwrap();

        let names: Vec<_> = txn
            .operations()
            .iter()
            .map(|op| MetadataOperationData::from_operation_data(op.metadata.as_ref().unwrap()).unwrap().name)
            .collect();
        assert_eq!(names, vec!["fabric:/a/x", "fabric:/a/y", "fabric:/a/x/deep", "fabric:/a"]);

        txn.commit(&h.sm, 1).await.unwrap();
        let mm = h.sm.metadata_manager();
        let root_id = mm.try_get_metadata("fabric:/a", false).unwrap().state_provider_id();
        for child in ["fabric:/a/x", "fabric:/a/y", "fabric:/a/x/deep"] {
            let m = mm.try_get_metadata(child, false).unwrap();
            assert_eq!(m.parent_id(), root_id);
            assert!(h.factory.provider(child).unwrap().is_open());
        }
        assert_eq!(h.factory.provider("fabric:/a").unwrap().initialized_children(), 3);
    }

    #[tokio::test]
    async fn test_get_or_add() {
        let h = Harness::primary().await;
        let txn = TestTransaction::new(1);
        let (first, existed) = h
            .sm
            .get_or_add_async(&*txn, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
            .await
            .unwrap();
        assert!(!existed);
        txn.commit(&h.sm, 5).await.unwrap();
        assert_eq!(h.sm.metadata_manager().lock_count(), 1);

        let txn = TestTransaction::new(2);
        let (second, existed) = h
            .sm
            .get_or_add_async(&*txn, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
            .await
            .unwrap();
        assert!(existed);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(txn.operations().is_empty());
        txn.commit(&h.sm, 6).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_then_commit() {
        let h = Harness::primary().await;
        h.add_committed("fabric:/a").await;
        let id = h.id_of("fabric:/a");

        let txn = TestTransaction::new(2);
        h.sm.remove_async(&*txn, "fabric:/a", TIMEOUT, &h.cancel).await.unwrap();
        // Still visible until applied
        assert!(h.sm.get("fabric:/a").is_ok());

        txn.commit(&h.sm, 20).await.unwrap();
        assert!(matches!(h.sm.get("fabric:/a"), Err(Error::NameDoesNotExist(_))));
        let mm = h.sm.metadata_manager();
        let tombstone = mm.try_get_deleted_metadata(id).unwrap();
        assert_eq!(tombstone.delete_lsn(), 20);
        assert_eq!(mm.lock_count(), 0);
        // Deleted providers stay open until cleanup
        assert!(h.factory.provider("fabric:/a").unwrap().is_open());
    }

    #[tokio::test]
    async fn test_remove_missing_takes_no_lock() {
        let h = Harness::primary().await;
        let txn = TestTransaction::new(1);
        let err = h
            .sm
            .remove_async(&*txn, "fabric:/missing", TIMEOUT, &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameDoesNotExist(_)));
        assert_eq!(h.sm.metadata_manager().lock_count(), 0);
        assert_eq!(txn.lock_context_count(), 0);
    }

    #[tokio::test]
    async fn test_second_remove_in_same_transaction() {
        let h = Harness::primary().await;
        h.add_committed("fabric:/a").await;

        let txn = TestTransaction::new(2);
        h.sm.remove_async(&*txn, "fabric:/a", TIMEOUT, &h.cancel).await.unwrap();
        let err = h
            .sm
            .remove_async(&*txn, "fabric:/a", TIMEOUT, &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameDoesNotExist(_)));

        txn.abort().unwrap();
        let m = h.sm.metadata_manager().try_get_metadata("fabric:/a", false).unwrap();
        assert!(!m.transient_delete());
        assert_eq!(h.sm.metadata_manager().lock_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_includes_children() {
        let h = Harness::primary().await;
        h.factory.declare_children("fabric:/a", &["fabric:/a/x"]);
        h.add_committed("fabric:/a").await;

        let txn = TestTransaction::new(2);
        h.sm.remove_async(&*txn, "fabric:/a", TIMEOUT, &h.cancel).await.unwrap();
        assert_eq!(txn.operations().len(), 2);
        txn.commit(&h.sm, 30).await.unwrap();

        let mm = h.sm.metadata_manager();
        assert!(!mm.contains_key("fabric:/a/x", true));
        assert_eq!(mm.deleted_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_add_waits_for_lock() {
        let h = Harness::primary().await;
        let first = TestTransaction::new(1);
        h.sm.add_async(&*first, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
            .await
            .unwrap();

        let second = TestTransaction::new(2);
        let err = h
            .sm
            .add_async(&*second, "fabric:/a", "Store", None, Duration::from_millis(50), &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameAlreadyExists(_)));

        let err = h
            .sm
            .remove_async(&*second, "fabric:/a", Duration::from_millis(50), &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameDoesNotExist(_)));
        first.commit(&h.sm, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_released_after_upgrade_across_disposed_lock() {
        let h = Harness::primary().await;
        let settle = || tokio::time::sleep(Duration::from_millis(20));

        // t2 keeps a read grant on the name after its get-or-add fails.
        let t2 = TestTransaction::new(2);
        let err = h
            .sm
            .get_or_add_async(&*t2, "fabric:/a", "Unknown", None, TIMEOUT, &h.cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidParameter(_)));

        // t1 upgrades and queues behind t2's read. t2 then gives up that read
        // to upgrade too, letting t1 in first. Aborting t1 disposes the lock
        // and t2 retries on a fresh one.
        let t1 = TestTransaction::new(1);
        let (first, second) = tokio::join!(
            async {
                let result = h
                    .sm
                    .get_or_add_async(&*t1, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
                    .await;
                settle().await;
                t1.abort().unwrap();
                result
            },
            async {
                settle().await;
                h.sm.add_async(&*t2, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
                    .await
            }
        );
        let (_, existed) = first.unwrap();
        assert!(!existed);
        second.unwrap();
        t2.commit(&h.sm, 10).await.unwrap();
        assert!(h.sm.get("fabric:/a").is_ok());

        let t3 = TestTransaction::new(3);
        h.sm.remove_async(&*t3, "fabric:/a", Duration::from_millis(200), &h.cancel)
            .await
            .unwrap();
        t3.commit(&h.sm, 11).await.unwrap();
        assert_eq!(h.sm.metadata_manager().lock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicate_retries_busy_log() {
        let h = Harness::primary().await;
        let txn = TestTransaction::new(1);
        txn.fail_next_operations(5, || Error::ReplicationQueueFull);
        h.sm.add_async(&*txn, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
            .await
            .unwrap();
        assert_eq!(txn.operations().len(), 1);
        assert_eq!(txn.rejected_operations(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicate_times_out() {
        let h = Harness::primary().await;
        let txn = TestTransaction::new(1);
        txn.fail_next_operations(usize::MAX, || Error::NoWriteQuorum);
        let err = h
            .sm
            .add_async(&*txn, "fabric:/a", "Store", None, Duration::from_secs(1), &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        txn.abort().unwrap();
        assert!(!h.sm.metadata_manager().contains_key("fabric:/a", true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicate_cancelled() {
        let h = Harness::primary().await;
        let txn = TestTransaction::new(1);
        txn.fail_next_operations(usize::MAX, || Error::ServiceTooBusy);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = h
            .sm
            .add_async(&*txn, "fabric:/a", "Store", None, Duration::from_secs(3600), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        txn.abort().unwrap();
    }

    #[tokio::test]
    async fn test_non_retryable_failure_surfaces() {
        let h = Harness::primary().await;
        let txn = TestTransaction::new(1);
        txn.fail_next_operations(1, || Error::NotPrimary);
        let err = h
            .sm
            .add_async(&*txn, "fabric:/a", "Store", None, TIMEOUT, &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotPrimary));
        txn.abort().unwrap();
    }
}
