use crate::active::{ActiveOperation, ActiveOperations, OperationId};
use crate::boot::{self, BootHandler};
use crate::collaborators::{
    AllowAll, AuditLog, Authorizer, NotificationSink, NullNotificationSink, TracingAuditLog,
};
use crate::concurrency::CancellationToken;
use crate::config::KernelConfig;
use crate::context::OperationContext;
use crate::handler::{FnHandler, HandlerError, StepHandler, StepResult};
use crate::handlers::OperationRegistry;
use crate::lifecycle::{ProcessState, ProcessStatus};
use crate::lock::{LockCoordinator, TxnId};
use crate::step::IdAllocator;
use crate::transaction::Transaction;
use crate::{rollback, scheduler, CoreError};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_model::{CallerType, Operation, OperationHeaders, PathAddress, Response};
use tessera_runtime::{select_container, ServiceContainer};
use tessera_store::{ConfigurationPersister, NullPersister, Snapshot, SnapshotHandle};
use tracing::{debug, info, warn};

/// Shared by every transaction of one engine.
pub(crate) struct EngineInner {
    pub(crate) config: KernelConfig,
    pub(crate) snapshots: SnapshotHandle,
    pub(crate) locks: LockCoordinator,
    pub(crate) container: Arc<dyn ServiceContainer>,
    pub(crate) persister: Arc<dyn ConfigurationPersister>,
    pub(crate) registry: OperationRegistry,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) audit: Arc<dyn AuditLog>,
    pub(crate) notifications: Arc<dyn NotificationSink>,
    pub(crate) process: ProcessState,
    pub(crate) active: ActiveOperations,
    pub(crate) ids: IdAllocator,
    next_txn: AtomicU64,
}

impl EngineInner {
    pub(crate) fn next_txn_id(&self) -> TxnId {
        TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Entry point of the kernel: executes operations as staged transactions
/// against the published model and the service container.
///
/// Cloning is cheap; clones share the same model, locks, and container, so
/// one engine can serve operations from any number of threads.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// An engine with the builtin operations, the container named by
    /// `config.container`, and no persistence.
    pub fn new(config: KernelConfig) -> Result<Self, CoreError> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: KernelConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Execute `operation` with its registered handler.
    ///
    /// Client failures, rollbacks, timeouts, and cancellation are reported in
    /// the returned `Response`. Only an unexpected handler fault returns
    /// `Err`, still carrying the finalized response.
    pub fn execute(&self, operation: Operation) -> Result<Response, CoreError> {
        let handler = self.inner.registry.resolve_or_unknown(&operation.name);
        self.run(operation, handler, true)
    }

    /// Execute `operation` with `handler` as its root step.
    pub fn execute_with<F>(&self, operation: Operation, handler: F) -> Result<Response, CoreError>
    where
        F: FnMut(&mut OperationContext<'_>, &Operation) -> Result<StepResult, HandlerError>
            + Send
            + 'static,
    {
        self.run(operation, Box::new(FnHandler(handler)), true)
    }

    /// Execute `operation` with a handler that is not in the registry.
    pub fn execute_step(
        &self,
        operation: Operation,
        handler: Box<dyn StepHandler>,
    ) -> Result<Response, CoreError> {
        self.run(operation, handler, true)
    }

    /// Replay `operations` as a single transaction. Operations under the
    /// parallel boot key run their MODEL stage on worker threads.
    /// Boot never writes back to the persister.
    pub fn boot(&self, operations: Vec<Operation>) -> Result<Response, CoreError> {
        let count = operations.len();
        let (sequential, partitions) =
            boot::partition(operations, &self.inner.config.parallel_boot_key);
        info!(
            "booting {count} operations: {} sequential, {} partitions",
            sequential.len(),
            partitions.len()
        );
        let headers = OperationHeaders {
            caller_type: CallerType::Internal,
            ..OperationHeaders::default()
        };
        let operation = Operation::new("boot", PathAddress::root()).with_headers(headers);
        let response = self.run(
            operation,
            Box::new(BootHandler {
                sequential,
                partitions,
            }),
            false,
        )?;
        if response.is_failed() {
            warn!(
                "boot finished with failures: {}",
                response.failure_message().unwrap_or_default()
            );
        }
        Ok(response)
    }

    fn run(
        &self,
        operation: Operation,
        handler: Box<dyn StepHandler>,
        persist: bool,
    ) -> Result<Response, CoreError> {
        let operation = Arc::new(operation);
        let cancel = CancellationToken::new();
        let mut txn = Transaction::root(
            Arc::clone(&self.inner),
            Arc::clone(&operation),
            cancel.clone(),
            persist,
            handler,
        );
        let txn_id = txn.id;
        let _active = self.inner.active.register(
            txn_id,
            OperationId {
                address: operation.address.clone(),
                name: operation.name.clone(),
            },
            cancel,
        );
        debug!("{txn_id}: {} {}", operation.name, operation.address);

        scheduler::run(&mut txn);
        let handler_error = rollback::finalize(&mut txn);
        let response = txn.take_response();
        let fault = txn.state.fault.take().or(handler_error);
        drop(txn);

        debug!("{txn_id}: finished {}", response.outcome);
        match fault {
            Some(message) => Err(CoreError::HandlerFault {
                message,
                response: Box::new(response),
            }),
            None => Ok(response),
        }
    }

    /// Read from the published model without starting a transaction.
    pub fn read_resource(&self, address: &PathAddress, recursive: bool) -> Option<Value> {
        self.inner
            .snapshots
            .load()
            .resources()
            .to_json(address, recursive)
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshots.load()
    }

    pub fn process_state(&self) -> ProcessStatus {
        self.inner.process.status()
    }

    pub fn active_operations(&self) -> Vec<ActiveOperation> {
        self.inner.active.list()
    }

    /// Request cancellation of a running transaction. Returns false if it is not active.
    pub fn cancel(&self, txn: TxnId) -> bool {
        self.inner.active.cancel(txn)
    }

    /// Cancel every active transaction, returning how many were signalled.
    pub fn cancel_all(&self) -> usize {
        self.inner.active.cancel_all()
    }

    /// The transaction currently holding the exclusive model lock, if any.
    pub fn exclusive_holder(&self) -> Option<TxnId> {
        self.inner.locks.exclusive_holder()
    }

    pub fn container(&self) -> Arc<dyn ServiceContainer> {
        Arc::clone(&self.inner.container)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.inner.registry
    }
}

/// Assembles an [`Engine`] around its collaborators.
pub struct EngineBuilder {
    config: KernelConfig,
    container: Option<Arc<dyn ServiceContainer>>,
    persister: Option<Arc<dyn ConfigurationPersister>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    audit: Option<Arc<dyn AuditLog>>,
    notifications: Option<Arc<dyn NotificationSink>>,
    registry: OperationRegistry,
    initial: Option<Snapshot>,
}

impl EngineBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            container: None,
            persister: None,
            authorizer: None,
            audit: None,
            notifications: None,
            registry: OperationRegistry::with_builtins(),
            initial: None,
        }
    }

    #[must_use]
    pub fn container(mut self, container: Arc<dyn ServiceContainer>) -> Self {
        self.container = Some(container);
        self
    }

    #[must_use]
    pub fn persister(mut self, persister: Arc<dyn ConfigurationPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    #[must_use]
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    #[must_use]
    pub fn audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    #[must_use]
    pub fn notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = Some(sink);
        self
    }

    /// Register or replace an operation handler.
    #[must_use]
    pub fn register_operation<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn StepHandler> + Send + Sync + 'static,
    {
        self.registry.register(name, factory);
        self
    }

    /// Start from `snapshot` instead of an empty model.
    #[must_use]
    pub fn initial_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.initial = Some(snapshot);
        self
    }

    pub fn build(self) -> Result<Engine, CoreError> {
        let container = match self.container {
            Some(container) => container,
            None => select_container(&self.config.container)?,
        };
        debug!("engine using the {} container", container.name());
        let inner = EngineInner {
            snapshots: SnapshotHandle::new(self.initial.unwrap_or_default()),
            locks: LockCoordinator::new(),
            container,
            persister: self.persister.unwrap_or_else(|| Arc::new(NullPersister)),
            registry: self.registry,
            authorizer: self.authorizer.unwrap_or_else(|| Arc::new(AllowAll)),
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditLog)),
            notifications: self
                .notifications
                .unwrap_or_else(|| Arc::new(NullNotificationSink)),
            process: ProcessState::default(),
            active: ActiveOperations::default(),
            ids: IdAllocator::default(),
            next_txn: AtomicU64::new(0),
            config: self.config,
        };
        Ok(Engine {
            inner: Arc::new(inner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_model::Outcome;

    fn engine() -> Engine {
        Engine::new(KernelConfig::default().with_container("local")).unwrap()
    }

    #[test]
    fn unknown_operation_is_a_client_failure() {
        let response = engine()
            .execute(Operation::new("frobnicate", PathAddress::root()))
            .unwrap();
        assert_eq!(response.outcome, Outcome::Failed);
        assert_eq!(
            response.failure_message().unwrap(),
            "unknown operation 'frobnicate'"
        );
    }

    #[test]
    fn txn_ids_are_unique() {
        let engine = engine();
        let a = engine.inner.next_txn_id();
        let b = engine.inner.next_txn_id();
        assert_ne!(a, b);
    }

    #[test]
    fn invalid_container_name_fails_build() {
        let config = KernelConfig::default().with_container("nope");
        assert!(Engine::new(config).is_err());
    }

    #[test]
    fn read_root_of_empty_model() {
        let value = engine().read_resource(&PathAddress::root(), false);
        assert!(value.is_some());
    }
}
