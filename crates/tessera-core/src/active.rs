use crate::concurrency::CancellationToken;
use crate::lifecycle::Stage;
use crate::lock::TxnId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use tessera_model::{OperationName, PathAddress};
use tracing::info;

/// Identifies an in-flight operation for introspection and cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationId {
    pub address: PathAddress,
    pub name: OperationName,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub txn: TxnId,
    pub operation: OperationId,
    pub stage: Stage,
    pub started: chrono::DateTime<chrono::Utc>,
}

struct Entry {
    info: ActiveOperation,
    cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct ActiveOperations {
    entries: Mutex<BTreeMap<TxnId, Entry>>,
}

/// Unregisters its transaction when dropped.
pub(crate) struct ActiveGuard<'a> {
    active: &'a ActiveOperations,
    txn: TxnId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.unregister(self.txn);
    }
}

impl ActiveOperations {
    pub(crate) fn register(
        &self,
        txn: TxnId,
        operation: OperationId,
        cancel: CancellationToken,
    ) -> ActiveGuard<'_> {
        let info = ActiveOperation {
            txn,
            operation,
            stage: Stage::Model,
            started: chrono::Utc::now(),
        };
        self.entries.lock().insert(txn, Entry { info, cancel });
        ActiveGuard { active: self, txn }
    }

    pub(crate) fn unregister(&self, txn: TxnId) {
        self.entries.lock().remove(&txn);
    }

    pub(crate) fn set_stage(&self, txn: TxnId, stage: Stage) {
        if let Some(entry) = self.entries.lock().get_mut(&txn) {
            entry.info.stage = stage;
        }
    }

    pub(crate) fn list(&self) -> Vec<ActiveOperation> {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub(crate) fn cancel(&self, txn: TxnId) -> bool {
        match self.entries.lock().get(&txn) {
            Some(entry) => {
                info!(
                    "cancelling {txn} ({} at {})",
                    entry.info.operation.name, entry.info.operation.address
                );
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&self) -> usize {
        let entries = self.entries.lock();
        for entry in entries.values() {
            entry.cancel.cancel();
        }
        entries.len()
    }
}
