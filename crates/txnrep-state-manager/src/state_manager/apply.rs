//! Applying replicated operations
//!
//! Structural operations (id [`STATE_MANAGER_ID`]) are interpreted here;
//! everything else is handed to the owning provider. Secondary and recovery
//! applies are idempotent: replaying an operation whose effect is already
//! visible is a no-op.

use super::{StateManager, is_delay_deleted, is_stale};
use crate::constants::STATE_MANAGER_ID;
use crate::metadata::{Metadata, MetadataMode};
use crate::metadata_manager::MetadataManager;
use crate::operation_data::{
    ApplyType, MetadataOperationData, NamedOperationData, OperationData, RedoOperationData,
};
use crate::replicator::{ApplyContext, ApplyOperation, ApplyRole, OperationContext, TransactionBase};
use crate::transaction_context::{OperationType, StateManagerTransactionContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use txnrep_common::{Error, Lsn, ReplicaRole, Result, StateProviderId};

type ApplyResult = Result<Option<Arc<StateManagerTransactionContext>>>;

impl StateManager {
    /// Apply an operation whose metadata is still wrapped with its provider id
    pub async fn apply_named_async(
        &self,
        lsn: Lsn,
        transaction: &dyn TransactionBase,
        apply_context: ApplyContext,
        metadata: Option<OperationData>,
        data: Option<OperationData>,
    ) -> Result<Option<OperationContext>> {
        let metadata = metadata
            .ok_or_else(|| Error::invalid_parameter("named operation without metadata"))?;
        let named = NamedOperationData::from_operation_data(&metadata)?;
        self.apply_async(
            lsn,
            transaction,
            apply_context,
            named.state_provider_id,
            named.user_data,
            data,
        )
        .await
    }

    /// Apply one replicated operation
    ///
    /// A returned context must be passed to [`StateManager::unlock`] once the
    /// transaction is done.
    pub async fn apply_async(
        &self,
        lsn: Lsn,
        transaction: &dyn TransactionBase,
        apply_context: ApplyContext,
        state_provider_id: StateProviderId,
        metadata: Option<OperationData>,
        data: Option<OperationData>,
    ) -> Result<Option<OperationContext>> {
        self.api_entry()?;
        if state_provider_id == STATE_MANAGER_ID {
            let context = self
                .apply_on_state_manager(lsn, transaction, apply_context, metadata, data)
                .await?;
            return Ok(context.map(OperationContext::StateManager));
        }

        let mm = self.metadata_manager();
        if is_delay_deleted(&mm, state_provider_id) {
            trace!(
                state_provider_id = %state_provider_id,
                lsn,
                "skipping operation of deleted state provider"
            );
            return Ok(None);
        }
        let m = mm
            .try_get_metadata_by_id(state_provider_id, false)
            .or_else(|| mm.try_get_deleted_metadata(state_provider_id))
            .ok_or_else(|| Error::NotFound(format!("state provider {state_provider_id}")))?;
        let context = m
            .state_provider()
            .apply(lsn, transaction, apply_context, metadata, data)
            .await?;
        Ok(context.map(|c| OperationContext::named(state_provider_id, c)))
    }

    async fn apply_on_state_manager(
        &self,
        lsn: Lsn,
        transaction: &dyn TransactionBase,
        apply_context: ApplyContext,
        metadata: Option<OperationData>,
        data: Option<OperationData>,
    ) -> ApplyResult {
        let metadata = metadata
            .ok_or_else(|| Error::invalid_parameter("structural operation without metadata"))?;
        let operation = MetadataOperationData::from_operation_data(&metadata)?;
        let redo = match (operation.apply_type, data) {
            (ApplyType::Insert, Some(data)) => Some(RedoOperationData::from_operation_data(&data)?),
            _ => None,
        };
        debug!(
            lsn,
            name = %operation.name,
            state_provider_id = %operation.state_provider_id,
            apply_type = ?operation.apply_type,
            role = ?apply_context.role,
            op = ?apply_context.operation,
            "applying structural operation"
        );

        match apply_context.operation {
            ApplyOperation::FalseProgress => {
                self.apply_false_progress(transaction, &operation).await?;
                Ok(None)
            }
            ApplyOperation::Undo => Err(Error::invalid_operation(
                "structural operations are never undone",
            )),
            ApplyOperation::Redo => match (apply_context.role, operation.apply_type) {
                (ApplyRole::Primary, ApplyType::Insert) => {
                    self.apply_insert_on_primary(lsn, transaction, &operation).await?;
                    Ok(None)
                }
                (ApplyRole::Primary, ApplyType::Delete) => {
                    self.apply_delete_on_primary(lsn, transaction, &operation)?;
                    Ok(None)
                }
                (ApplyRole::Secondary, ApplyType::Insert) => {
                    let redo = required_redo(redo)?;
                    self.apply_insert_on_secondary(lsn, transaction, &operation, &redo).await
                }
                (ApplyRole::Recovery, ApplyType::Insert) => {
                    let redo = required_redo(redo)?;
                    self.apply_insert_on_recovery(lsn, transaction, &operation, &redo).await
                }
                (ApplyRole::Secondary, ApplyType::Delete) => {
                    self.apply_delete(lsn, transaction, &operation, false).await
                }
                (ApplyRole::Recovery, ApplyType::Delete) => {
                    self.apply_delete(lsn, transaction, &operation, true).await
                }
            },
        }
    }

    async fn apply_insert_on_primary(
        &self,
        lsn: Lsn,
        transaction: &dyn TransactionBase,
        operation: &MetadataOperationData,
    ) -> Result<()> {
        let mm = self.metadata_manager();
        let m = staged_record(&mm, operation)?;
        m.set_create_lsn(lsn);
        self.initialize_state_providers(&mm, &m, false).await?;
        self.notifier.notify_added(transaction, &m);
        Ok(())
    }

    fn apply_delete_on_primary(
        &self,
        lsn: Lsn,
        transaction: &dyn TransactionBase,
        operation: &MetadataOperationData,
    ) -> Result<()> {
        let mm = self.metadata_manager();
        let m = staged_record(&mm, operation)?;
        m.set_delete_lsn(lsn);
        mm.soft_delete(&operation.name, MetadataMode::DelayDelete);
        self.notifier.notify_removed(transaction, &m);
        Ok(())
    }

    /// Undo a structural operation the new primary never saw
    async fn apply_false_progress(
        &self,
        transaction: &dyn TransactionBase,
        operation: &MetadataOperationData,
    ) -> Result<()> {
        assert_eq!(
            self.role(),
            ReplicaRole::IdleSecondary,
            "false progress processed outside of an idle secondary"
        );
        let mm = self.metadata_manager();
        let id = operation.state_provider_id;

        match operation.apply_type {
            ApplyType::Insert => {
                let m = mm.try_get_metadata(&operation.name, false).ok_or_else(|| {
                    Error::internal(format!("false progress insert of unknown {}", operation.name))
                })?;
                assert_eq!(m.state_provider_id(), id, "false progress id mismatch");
                let txn_id = transaction.transaction_id();
                let lock = mm
                    .lock_for_write(&operation.name, id, txn_id, Duration::MAX, &self.shutdown)
                    .await?;
                mm.soft_delete(&operation.name, MetadataMode::FalseProgress);
                mm.remove_lock(&lock, txn_id);
                self.notifier.notify_removed(transaction, &m);
            }
            ApplyType::Delete => {
                let m = mm.resurrect(id, Duration::MAX, &self.shutdown).await?;
                self.dispatcher
                    .change_role(&m, ReplicaRole::IdleSecondary, &self.shutdown)
                    .await?;
                self.notifier.notify_added(transaction, &m);
            }
        }
        debug!(state_provider_id = %id, name = %operation.name, "undid false progress");
        Ok(())
    }

    async fn apply_insert_on_secondary(
        &self,
        lsn: Lsn,
        transaction: &dyn TransactionBase,
        operation: &MetadataOperationData,
        redo: &RedoOperationData,
    ) -> ApplyResult {
        let mm = self.metadata_manager();
        if self.insert_already_applied(&mm, lsn, transaction, operation) {
            return Ok(None);
        }

        let context = self.lock_for_apply(&mm, transaction, operation, OperationType::Add).await?;
        let result = async {
            let id = operation.state_provider_id;
            let m = if is_stale(&mm, id) {
                self.resurrect_for_insert(&mm, id).await?
            } else {
                let m = self.metadata_for_insert(lsn, operation, redo)?;
                self.initialize_state_providers(&mm, &m, true).await?;
                m
            };
            self.id_allocator.update_last_id(id);
            self.notifier.notify_added(transaction, &m);
            Ok(())
        }
        .await;
        finish_locked_apply(&mm, context, result)
    }

    async fn apply_insert_on_recovery(
        &self,
        lsn: Lsn,
        transaction: &dyn TransactionBase,
        operation: &MetadataOperationData,
        redo: &RedoOperationData,
    ) -> ApplyResult {
        let mm = self.metadata_manager();
        if self.insert_already_applied(&mm, lsn, transaction, operation) {
            return Ok(None);
        }

        let context = self.lock_for_apply(&mm, transaction, operation, OperationType::Add).await?;
        let result = async {
            let m = self.metadata_for_insert(lsn, operation, redo)?;
            if let Some(list) = self.initialize_state_providers_in_order(&mm, &m).await? {
                for entry in &list {
                    self.dispatcher.open(entry, &self.shutdown).await?;
                    assert!(
                        mm.try_add(entry.name(), Arc::clone(entry)),
                        "state provider {} recovered twice",
                        entry.name()
                    );
                    self.dispatcher.recover_checkpoint(entry, &self.shutdown).await?;
                    self.id_allocator.update_last_id(entry.state_provider_id());
                }
            }
            self.id_allocator.update_last_id(operation.state_provider_id);
            self.notifier.notify_added(transaction, &m);
            Ok(())
        }
        .await;
        finish_locked_apply(&mm, context, result)
    }

    async fn apply_delete(
        &self,
        lsn: Lsn,
        transaction: &dyn TransactionBase,
        operation: &MetadataOperationData,
        recovering: bool,
    ) -> ApplyResult {
        let mm = self.metadata_manager();
        let id = operation.state_provider_id;

        if let Some(tombstone) = mm.try_get_deleted_metadata(id) {
            if recovering || tombstone.mode() == MetadataMode::DelayDelete {
                assert!(
                    tombstone.delete_lsn() == lsn
                        || tombstone.delete_lsn() == transaction.commit_sequence_number(),
                    "replayed delete of {} at {lsn} but tombstone says {}",
                    operation.name,
                    tombstone.delete_lsn()
                );
                return Ok(None);
            }
            panic!("delete of {} replayed against a false progress tombstone", operation.name);
        }

        let m = mm.try_get_metadata(&operation.name, false).ok_or_else(|| {
            Error::internal(format!("delete of unknown state provider {}", operation.name))
        })?;
        assert_eq!(m.state_provider_id(), id, "delete id mismatch for {}", operation.name);

        let context = self.lock_for_apply(&mm, transaction, operation, OperationType::Remove).await?;
        m.set_delete_lsn(lsn);
        mm.soft_delete(&operation.name, MetadataMode::DelayDelete);
        self.notifier.notify_removed(transaction, &m);
        Ok(Some(context))
    }

    /// True if `operation` is an insert this replica already reflects
    fn insert_already_applied(
        &self,
        mm: &MetadataManager,
        lsn: Lsn,
        transaction: &dyn TransactionBase,
        operation: &MetadataOperationData,
    ) -> bool {
        let id = operation.state_provider_id;
        if is_delay_deleted(mm, id) {
            debug!(state_provider_id = %id, lsn, "insert of a deleted state provider already applied");
            return true;
        }
        let Some(existing) = mm.try_get_metadata(&operation.name, false) else {
            return false;
        };
        assert_eq!(
            existing.state_provider_id(),
            id,
            "{} replayed with a different id",
            operation.name
        );
        let create_lsn = existing.create_lsn();
        assert!(
            create_lsn == lsn || create_lsn == transaction.commit_sequence_number(),
            "{} replayed at {lsn} but was created at {create_lsn}",
            operation.name
        );
        true
    }

    async fn lock_for_apply(
        &self,
        mm: &MetadataManager,
        transaction: &dyn TransactionBase,
        operation: &MetadataOperationData,
        operation_type: OperationType,
    ) -> Result<Arc<StateManagerTransactionContext>> {
        let txn_id = transaction.transaction_id();
        let lock = mm
            .lock_for_write(
                &operation.name,
                operation.state_provider_id,
                txn_id,
                Duration::MAX,
                &self.shutdown,
            )
            .await?;
        Ok(Arc::new(StateManagerTransactionContext::new(txn_id, lock, operation_type)))
    }

    fn metadata_for_insert(
        &self,
        lsn: Lsn,
        operation: &MetadataOperationData,
        redo: &RedoOperationData,
    ) -> Result<Arc<Metadata>> {
        let init_parameters = redo.init_parameters();
        let state_provider = self.dispatcher.create_state_provider(
            &operation.name,
            operation.state_provider_id,
            &redo.type_name,
            init_parameters.clone(),
        )?;
        Ok(Arc::new(
            Metadata::new(
                operation.name.as_str(),
                redo.type_name.as_str(),
                state_provider,
                init_parameters,
                operation.state_provider_id,
                redo.parent_id,
            )
            .with_create_lsn(lsn),
        ))
    }

    /// Reuse a provider tombstoned as false progress by a copy
    async fn resurrect_for_insert(&self, mm: &MetadataManager, id: StateProviderId) -> Result<Arc<Metadata>> {
        let m = mm
            .try_remove_deleted(id)
            .ok_or_else(|| Error::internal(format!("stale state provider {id} vanished")))?;
        m.set_mode(MetadataMode::Active);
        m.set_delete_lsn(txnrep_common::INVALID_LSN);
        assert!(mm.try_add(m.name(), Arc::clone(&m)), "{} resurrected twice", m.name());

        self.dispatcher.begin_setting_current_state(&m).await?;
        self.dispatcher
            .end_setting_current_state_all(std::slice::from_ref(&m), &self.shutdown)
            .await?;
        if self.role() == ReplicaRole::ActiveSecondary {
            self.dispatcher
                .change_role(&m, ReplicaRole::ActiveSecondary, &self.shutdown)
                .await?;
        }
        debug!(state_provider_id = %id, name = %m.name(), "reused false progress state provider");
        Ok(m)
    }
}

fn required_redo(redo: Option<RedoOperationData>) -> Result<RedoOperationData> {
    redo.ok_or_else(|| Error::invalid_parameter("insert replayed without redo data"))
}

/// The record staged by the primary for `operation`
fn staged_record(mm: &MetadataManager, operation: &MetadataOperationData) -> Result<Arc<Metadata>> {
    let m = mm.try_get_metadata(&operation.name, true).ok_or_else(|| {
        Error::internal(format!("no staged record for {}", operation.name))
    })?;
    assert_eq!(
        m.state_provider_id(),
        operation.state_provider_id,
        "staged record id mismatch for {}",
        operation.name
    );
    Ok(m)
}

/// Hand the lock to the caller on success, release it on failure
fn finish_locked_apply(
    mm: &MetadataManager,
    context: Arc<StateManagerTransactionContext>,
    result: Result<()>,
) -> ApplyResult {
    match result {
        Ok(()) => Ok(Some(context)),
        Err(e) => {
            mm.unlock(&context)?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::StateManagerChangeHandler;
    use crate::state_provider::StateProvider;
    use crate::testing::{Harness, RecordingHandler, TestTransaction, insert_operation, delete_operation};
    use bytes::Bytes;

    async fn replay(
        h: &Harness,
        ctx: ApplyContext,
        lsn: Lsn,
        op: (OperationData, Option<OperationData>),
    ) -> Option<OperationContext> {
        let txn = TestTransaction::committed(lsn, lsn);
        h.sm
            .apply_async(lsn, &*txn, ctx, STATE_MANAGER_ID, Some(op.0), op.1)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_secondary_insert_is_idempotent() {
        let h = Harness::secondary().await;
        let id = StateProviderId::new(500);

        let ctx = replay(&h, ApplyContext::SECONDARY_REDO, 10, insert_operation(id, "fabric:/a", None)).await;
        h.sm.unlock(ctx.unwrap()).unwrap();
        let provider = h.factory.provider("fabric:/a").unwrap();
        assert!(provider.is_open());
        assert_eq!(provider.role(), ReplicaRole::ActiveSecondary);
        assert_eq!(h.sm.id_allocator.last_id(), id);

        // Replaying the same record changes nothing
        let again = replay(&h, ApplyContext::SECONDARY_REDO, 10, insert_operation(id, "fabric:/a", None)).await;
        assert!(again.is_none());
        assert_eq!(h.factory.created_count("fabric:/a"), 1);
        assert_eq!(h.sm.metadata_manager().active_count(), 1);
    }

    #[tokio::test]
    async fn test_secondary_delete_is_idempotent() {
        let h = Harness::secondary().await;
        let id = StateProviderId::new(500);
        let ctx = replay(&h, ApplyContext::SECONDARY_REDO, 10, insert_operation(id, "fabric:/a", None)).await;
        h.sm.unlock(ctx.unwrap()).unwrap();

        let ctx = replay(&h, ApplyContext::SECONDARY_REDO, 11, delete_operation(id, "fabric:/a")).await;
        h.sm.unlock(ctx.unwrap()).unwrap();
        let mm = h.sm.metadata_manager();
        assert_eq!(mm.try_get_deleted_metadata(id).unwrap().delete_lsn(), 11);
        assert_eq!(mm.lock_count(), 0);

        assert!(replay(&h, ApplyContext::SECONDARY_REDO, 11, delete_operation(id, "fabric:/a")).await.is_none());
        // A late insert replay for the deleted provider is ignored too
        assert!(replay(&h, ApplyContext::SECONDARY_REDO, 10, insert_operation(id, "fabric:/a", None)).await.is_none());
        assert_eq!(mm.active_count(), 0);
    }

    #[tokio::test]
    async fn test_secondary_insert_carries_init_parameters() {
        let h = Harness::secondary().await;
        let id = StateProviderId::new(9);
        let init = Bytes::from_static(b"cfg");
        let ctx = replay(&h, ApplyContext::SECONDARY_REDO, 3, insert_operation(id, "fabric:/a", Some(init.clone()))).await;
        h.sm.unlock(ctx.unwrap()).unwrap();

        let m = h.sm.metadata_manager().try_get_metadata("fabric:/a", false).unwrap();
        assert_eq!(m.init_parameters(), Some(&init));
        assert_eq!(h.factory.provider("fabric:/a").unwrap().init_parameters(), Some(init));
    }

    #[tokio::test]
    async fn test_failed_open_leaves_nothing_registered() {
        let h = Harness::secondary().await;
        h.factory.fail("fabric:/a", "open");
        let txn = TestTransaction::committed(10, 10);
        let (metadata, redo) = insert_operation(StateProviderId::new(5), "fabric:/a", None);
        let err = h
            .sm
            .apply_async(10, &*txn, ApplyContext::SECONDARY_REDO, STATE_MANAGER_ID, Some(metadata), redo)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));

        let mm = h.sm.metadata_manager();
        assert!(!mm.contains_key("fabric:/a", true));
        assert_eq!(mm.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_recover_closes_provider() {
        let h = Harness::secondary().await;
        h.factory.fail("fabric:/a", "recover_checkpoint");
        let txn = TestTransaction::committed(10, 10);
        let (metadata, redo) = insert_operation(StateProviderId::new(5), "fabric:/a", None);
        assert!(
            h.sm.apply_async(10, &*txn, ApplyContext::SECONDARY_REDO, STATE_MANAGER_ID, Some(metadata), redo)
                .await
                .is_err()
        );
        let provider = h.factory.provider("fabric:/a").unwrap();
        assert_eq!(provider.calls(), vec!["initialize", "open", "recover_checkpoint", "close"]);
        assert!(!h.sm.metadata_manager().contains_key("fabric:/a", true));
    }

    #[tokio::test]
    async fn test_undo_is_rejected() {
        let h = Harness::secondary().await;
        let txn = TestTransaction::committed(1, 1);
        let (metadata, redo) = insert_operation(StateProviderId::new(5), "fabric:/a", None);
        let ctx = ApplyContext::new(ApplyRole::Secondary, ApplyOperation::Undo);
        let err = h
            .sm
            .apply_async(1, &*txn, ctx, STATE_MANAGER_ID, Some(metadata), redo)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_false_progress_insert_and_delete() {
        let h = Harness::secondary().await;
        let handler = RecordingHandler::new();
        h.sm.register_change_handler(handler.clone() as Arc<dyn StateManagerChangeHandler>).unwrap();
        let a = StateProviderId::new(100);
        let b = StateProviderId::new(200);

        for (lsn, op) in [
            (10, insert_operation(a, "fabric:/a", None)),
            (11, insert_operation(b, "fabric:/b", None)),
            (12, delete_operation(b, "fabric:/b")),
        ] {
            if let Some(ctx) = replay(&h, ApplyContext::SECONDARY_REDO, lsn, op).await {
                h.sm.unlock(ctx).unwrap();
            }
        }
        h.change_role(ReplicaRole::IdleSecondary).await;

        // Undo the delete of b, then the insert of a
        assert!(replay(&h, ApplyContext::SECONDARY_FALSE_PROGRESS, 12, delete_operation(b, "fabric:/b")).await.is_none());
        assert!(replay(&h, ApplyContext::SECONDARY_FALSE_PROGRESS, 10, insert_operation(a, "fabric:/a", None)).await.is_none());

        let mm = h.sm.metadata_manager();
        let resurrected = mm.try_get_metadata("fabric:/b", false).unwrap();
        assert_eq!(resurrected.state_provider_id(), b);
        assert_eq!(resurrected.mode(), MetadataMode::Active);
        assert!(Arc::ptr_eq(
            resurrected.state_provider(),
            &(h.factory.provider("fabric:/b").unwrap() as Arc<dyn StateProvider>)
        ));

        let undone = mm.try_get_deleted_metadata(a).unwrap();
        assert_eq!(undone.mode(), MetadataMode::FalseProgress);
        assert_eq!(undone.removal_lsn(), Some(10));
        assert!(!mm.contains_key("fabric:/a", true));
        assert_eq!(mm.lock_count(), 1);

        assert_eq!(
            handler.events(),
            vec!["added fabric:/a", "added fabric:/b", "removed fabric:/b", "added fabric:/b", "removed fabric:/a"]
        );
    }

    #[tokio::test]
    async fn test_secondary_insert_reuses_false_progress_provider() {
        let h = Harness::secondary().await;
        let a = StateProviderId::new(100);
        let ctx = replay(&h, ApplyContext::SECONDARY_REDO, 10, insert_operation(a, "fabric:/a", None)).await;
        h.sm.unlock(ctx.unwrap()).unwrap();
        let provider = h.factory.provider("fabric:/a").unwrap();

        // A copy that tombstones everything, then the insert is replayed from the log
        h.sm.begin_setting_current_state_async().await.unwrap();
        let ctx = replay(&h, ApplyContext::SECONDARY_REDO, 10, insert_operation(a, "fabric:/a", None)).await;
        h.sm.unlock(ctx.unwrap()).unwrap();

        let m = h.sm.metadata_manager().try_get_metadata("fabric:/a", false).unwrap();
        assert_eq!(m.mode(), MetadataMode::Active);
        assert_eq!(h.factory.created_count("fabric:/a"), 1);
        let calls = provider.calls();
        assert!(calls.ends_with(&["begin_setting_current_state", "end_setting_current_state", "change_role"]));
    }

    #[tokio::test]
    async fn test_provider_operations_are_forwarded() {
        let h = Harness::primary().await;
        h.add_committed("fabric:/a").await;
        let id = h.id_of("fabric:/a");
        let txn = TestTransaction::committed(40, 40);

        let named = NamedOperationData::new(id, Some(OperationData::single(Bytes::from_static(b"m"))))
            .to_operation_data()
            .unwrap();
        let ctx = h
            .sm
            .apply_named_async(40, &*txn, ApplyContext::PRIMARY_REDO, Some(named), Some(OperationData::single(Bytes::from_static(b"r"))))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(ctx, OperationContext::Named { state_provider_id, .. } if state_provider_id == id));
        h.sm.unlock(ctx).unwrap();

        let provider = h.factory.provider("fabric:/a").unwrap();
        assert_eq!(provider.applied(), vec![(40, b"m".to_vec(), b"r".to_vec())]);
        assert_eq!(provider.unlock_count(), 1);
    }

    #[tokio::test]
    async fn test_operations_of_deleted_provider_are_dropped() {
        let h = Harness::primary().await;
        h.add_committed("fabric:/a").await;
        let id = h.id_of("fabric:/a");
        h.remove_committed("fabric:/a").await;

        let txn = TestTransaction::committed(50, 50);
        let ctx = h
            .sm
            .apply_async(50, &*txn, ApplyContext::PRIMARY_REDO, id, None, None)
            .await
            .unwrap();
        assert!(ctx.is_none());
        assert!(h.factory.provider("fabric:/a").unwrap().applied().is_empty());
    }
}
