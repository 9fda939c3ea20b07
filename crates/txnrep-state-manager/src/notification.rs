//! State manager change notifications
//!
//! Only root providers (no parent) are reported; children are an
//! implementation detail of their parent.

use crate::metadata::Metadata;
use crate::replicator::TransactionBase;
use crate::state_provider::StateProvider;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;
use txnrep_common::{Error, Result};

/// Receives structural changes of the state manager
pub trait StateManagerChangeHandler: Send + Sync {
    /// The whole set of providers was rebuilt (recovery, restore, copy)
    fn on_rebuilt(&self, state_providers: Vec<(String, Arc<dyn StateProvider>)>);

    fn on_added(
        &self,
        transaction: &dyn TransactionBase,
        name: &str,
        state_provider: &Arc<dyn StateProvider>,
    );

    fn on_removed(
        &self,
        transaction: &dyn TransactionBase,
        name: &str,
        state_provider: &Arc<dyn StateProvider>,
    );
}

/// Slot holding the registered handler
#[derive(Default)]
pub struct ChangeNotifier {
    handler: RwLock<Option<Arc<dyn StateManagerChangeHandler>>>,
}

impl ChangeNotifier {
    pub fn register(&self, handler: Arc<dyn StateManagerChangeHandler>) -> Result<()> {
        let mut slot = self.handler.write();
        if slot.is_some() {
            return Err(Error::invalid_operation(
                "a state manager change handler is already registered",
            ));
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn unregister(&self) {
        self.handler.write().take();
    }

    fn current(&self) -> Option<Arc<dyn StateManagerChangeHandler>> {
        self.handler.read().clone()
    }

    pub fn notify_added(&self, transaction: &dyn TransactionBase, metadata: &Metadata) {
        if !metadata.is_root() {
            return;
        }
        if let Some(handler) = self.current() {
            debug!(name = %metadata.name(), txn_id = %transaction.transaction_id(), "notify added");
            handler.on_added(transaction, metadata.name(), metadata.state_provider());
        }
    }

    pub fn notify_removed(&self, transaction: &dyn TransactionBase, metadata: &Metadata) {
        if !metadata.is_root() {
            return;
        }
        if let Some(handler) = self.current() {
            debug!(name = %metadata.name(), txn_id = %transaction.transaction_id(), "notify removed");
            handler.on_removed(transaction, metadata.name(), metadata.state_provider());
        }
    }

    /// Report the given records, keeping only roots
    pub fn notify_rebuilt(&self, records: &[Arc<Metadata>]) {
        let Some(handler) = self.current() else {
            return;
        };
        let providers: Vec<_> = records
            .iter()
            .filter(|m| m.is_root())
            .map(|m| (m.name().to_owned(), Arc::clone(m.state_provider())))
            .collect();
        debug!(count = providers.len(), "notify rebuilt");
        handler.on_rebuilt(providers);
    }
}
