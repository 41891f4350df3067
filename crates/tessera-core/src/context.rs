//! The API handlers see while their step runs, and while its result is delivered.

use crate::collaborators::{AccessAction, AuditRecord, Notification};
use crate::config::KernelConfig;
use crate::handler::{FnHandler, HandlerError, StepHandler, StepResult};
use crate::lifecycle::{ResultAction, Stage};
use crate::lock::{LockMode, TxnId};
use crate::step::{ResponseId, StepId, WriteKind};
use crate::transaction::{NewStep, Transaction};
use std::sync::Arc;
use tessera_model::{Operation, OperationName, PathAddress, Response, ServiceName};
use tessera_runtime::{ServiceContainer, ServiceSpec};
use tessera_store::{
    CapabilityId, CapabilityRegistry, RegistrationPoint, RegistrationTree, RequirementKey,
    ResourceTree,
};
use tracing::debug;

pub struct OperationContext<'a> {
    pub(crate) txn: &'a mut Transaction,
    pub(crate) step: StepId,
}

impl OperationContext<'_> {
    pub fn txn_id(&self) -> TxnId {
        self.txn.id
    }

    pub fn step_id(&self) -> StepId {
        self.step
    }

    pub fn stage(&self) -> Stage {
        self.txn.stage
    }

    pub fn config(&self) -> &KernelConfig {
        &self.txn.engine.config
    }

    pub fn is_cancelled(&self) -> bool {
        self.txn.cancel.is_cancelled()
    }

    fn operation(&self) -> Result<Arc<Operation>, HandlerError> {
        self.txn
            .state
            .steps
            .get(&self.step)
            .map(|record| Arc::clone(&record.operation))
            .ok_or_else(|| HandlerError::fault(format!("{} has no record", self.step)))
    }

    pub(crate) fn response_id(&self) -> ResponseId {
        self.txn
            .state
            .steps
            .get(&self.step)
            .map_or(self.txn.root_response, |record| record.response)
    }

    // Reads never lock: they see the published snapshot until this transaction writes.

    pub fn read_resources(&self) -> Arc<ResourceTree> {
        self.txn.snapshot.resources(&self.txn.engine.snapshots)
    }

    pub fn read_registrations(&self) -> Arc<RegistrationTree> {
        self.txn.snapshot.registrations(&self.txn.engine.snapshots)
    }

    pub fn read_capabilities(&self) -> Arc<CapabilityRegistry> {
        self.txn.snapshot.capabilities(&self.txn.engine.snapshots)
    }

    /// Common preamble of every model write.
    fn begin_write(&mut self, kind: WriteKind) -> Result<(), HandlerError> {
        if self.txn.stage != Stage::Model {
            return Err(HandlerError::fault(format!(
                "model writes are not allowed in the {} stage",
                self.txn.stage
            )));
        }
        let op = self.operation()?;
        self.txn.check_scope(&op.address)?;
        self.authorize(kind, &op, AccessAction::WriteModel)?;
        self.txn.ensure_lock(LockMode::Exclusive)?;
        if let Some(record) = self.txn.state.steps.get_mut(&self.step) {
            record.wrote = true;
        }
        Ok(())
    }

    fn authorize(
        &mut self,
        kind: WriteKind,
        op: &Operation,
        action: AccessAction,
    ) -> Result<(), HandlerError> {
        let already = self
            .txn
            .state
            .steps
            .get(&self.step)
            .is_some_and(|record| record.authorized.contains(&kind));
        if already {
            return Ok(());
        }
        self.txn
            .engine
            .authorizer
            .authorize(op, &op.address, action)
            .map_err(|reason| {
                HandlerError::client(format!(
                    "{} at {} is not authorized: {reason}",
                    op.name, op.address
                ))
            })?;
        if let Some(record) = self.txn.state.steps.get_mut(&self.step) {
            record.authorized.insert(kind);
        }
        Ok(())
    }

    pub fn resources_mut(&mut self) -> Result<&mut ResourceTree, HandlerError> {
        self.begin_write(WriteKind::Resources)?;
        Ok(self.txn.snapshot.resources_mut(&self.txn.engine.snapshots))
    }

    pub fn registrations_mut(&mut self) -> Result<&mut RegistrationTree, HandlerError> {
        self.begin_write(WriteKind::Registrations)?;
        Ok(self
            .txn
            .snapshot
            .registrations_mut(&self.txn.engine.snapshots))
    }

    /// Raw capability access. Prefer the registering methods below, which also
    /// record which step is responsible for a later validation failure.
    pub fn capabilities_mut(&mut self) -> Result<&mut CapabilityRegistry, HandlerError> {
        self.begin_write(WriteKind::Capabilities)?;
        Ok(self
            .txn
            .snapshot
            .capabilities_mut(&self.txn.engine.snapshots))
    }

    pub fn register_capability(
        &mut self,
        id: CapabilityId,
        point: RegistrationPoint,
    ) -> Result<(), HandlerError> {
        self.txn.state.capability_removals.remove(&id);
        self.capabilities_mut()?.register_capability(id, point);
        Ok(())
    }

    /// Returns true if the capability no longer exists.
    pub fn remove_capability(
        &mut self,
        id: &CapabilityId,
        point: &RegistrationPoint,
    ) -> Result<bool, HandlerError> {
        let gone = self.capabilities_mut()?.remove_capability(id, point);
        if gone {
            self.txn
                .state
                .capability_removals
                .insert(id.clone(), self.step);
        }
        Ok(gone)
    }

    pub fn register_requirement(
        &mut self,
        key: RequirementKey,
        point: RegistrationPoint,
    ) -> Result<(), HandlerError> {
        self.txn
            .state
            .requirement_owners
            .entry(key.clone())
            .or_default()
            .insert(self.step);
        self.capabilities_mut()?.register_requirement(key, point);
        Ok(())
    }

    pub fn remove_requirement(
        &mut self,
        key: &RequirementKey,
        point: &RegistrationPoint,
    ) -> Result<(), HandlerError> {
        self.capabilities_mut()?.remove_requirement(key, point);
        Ok(())
    }

    /// Drop every capability and requirement registered at `address`.
    pub fn remove_capabilities_at(&mut self, address: &PathAddress) -> Result<(), HandlerError> {
        let (gone, _) = self.capabilities_mut()?.remove_address(address);
        for id in gone {
            self.txn.state.capability_removals.insert(id, self.step);
        }
        Ok(())
    }

    pub fn acquire_lock(&mut self, mode: LockMode) -> Result<(), HandlerError> {
        self.txn.ensure_lock(mode)
    }

    /// Queue a step for the same operation and response as this one.
    pub fn add_step<F>(&mut self, stage: Stage, handler: F) -> Result<StepId, HandlerError>
    where
        F: FnMut(&mut OperationContext<'_>, &Operation) -> Result<StepResult, HandlerError>
            + Send
            + 'static,
    {
        self.add_handler_step(stage, Box::new(FnHandler(handler)), false)
    }

    /// Like [`add_step`](Self::add_step) but runs before steps already queued for `stage`.
    pub fn add_priority_step<F>(
        &mut self,
        stage: Stage,
        handler: F,
    ) -> Result<StepId, HandlerError>
    where
        F: FnMut(&mut OperationContext<'_>, &Operation) -> Result<StepResult, HandlerError>
            + Send
            + 'static,
    {
        self.add_handler_step(stage, Box::new(FnHandler(handler)), true)
    }

    pub fn add_handler_step(
        &mut self,
        stage: Stage,
        handler: Box<dyn StepHandler>,
        priority: bool,
    ) -> Result<StepId, HandlerError> {
        let spec = NewStep {
            stage,
            operation: self.operation()?,
            parent: Some(self.step),
            response: Some(self.response_id()),
            priority,
        };
        let (id, _) = self.txn.push_step(spec, handler)?;
        debug!("{} queued {id} for the {stage} stage", self.step);
        Ok(id)
    }

    /// Queue a nested operation with its own response slot.
    pub fn add_child_step(
        &mut self,
        stage: Stage,
        operation: Operation,
        handler: Box<dyn StepHandler>,
        priority: bool,
    ) -> Result<ResponseId, HandlerError> {
        let spec = NewStep {
            stage,
            operation: Arc::new(operation),
            parent: Some(self.step),
            response: None,
            priority,
        };
        let (id, response) = self.txn.push_step(spec, handler)?;
        debug!("{} queued child {id} for the {stage} stage", self.step);
        Ok(response)
    }

    /// The registered handler for `name`, if any.
    pub fn resolve_handler(&self, name: &OperationName) -> Option<Box<dyn StepHandler>> {
        self.txn.engine.registry.resolve(name)
    }

    /// Register the result handler, run once the transaction's outcome is decided.
    pub fn complete_step<F>(&mut self, handler: F)
    where
        F: FnOnce(&mut ResultContext<'_>, ResultAction) -> Result<(), HandlerError>
            + Send
            + 'static,
    {
        if let Some(record) = self.txn.state.steps.get_mut(&self.step) {
            record.result_handler = Some(Box::new(handler));
        }
    }

    pub fn response_mut(&mut self) -> &mut Response {
        let id = self.response_id();
        self.txn.state.responses.entry(id).or_default()
    }

    pub fn set_result(&mut self, result: serde_json::Value) {
        self.response_mut().result = result;
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.txn.state.warnings.push(warning.into());
    }

    /// Force ROLLBACK regardless of how the remaining steps fare.
    pub fn set_rollback_only(&mut self) {
        self.txn.state.rollback_only = true;
        self.txn.force_rollback();
    }

    pub fn container(&self) -> Arc<dyn ServiceContainer> {
        Arc::clone(&self.txn.engine.container)
    }

    fn begin_service_change(&mut self) -> Result<(), HandlerError> {
        if self.txn.stage != Stage::Runtime {
            return Err(HandlerError::fault(format!(
                "service changes are not allowed in the {} stage",
                self.txn.stage
            )));
        }
        let op = self.operation()?;
        self.authorize(WriteKind::Services, &op, AccessAction::WriteRuntime)?;
        self.txn.ensure_lock(LockMode::Exclusive)?;
        self.txn.state.services_touched = true;
        Ok(())
    }

    /// Install a service. Rollback removes it again before this step's result handler runs.
    pub fn add_service(&mut self, spec: ServiceSpec) -> Result<(), HandlerError> {
        self.begin_service_change()?;
        let name = spec.name.clone();
        self.txn.engine.container.add_service(spec)?;
        self.txn.state.service_owners.insert(name.clone(), self.step);
        if let Some(record) = self.txn.state.steps.get_mut(&self.step) {
            record.services_added.push(name);
            record.wrote = true;
        }
        Ok(())
    }

    /// Begin removing a service; the stability gate waits for it to finish.
    pub fn remove_service(&mut self, name: &ServiceName) -> Result<(), HandlerError> {
        self.begin_service_change()?;
        self.txn
            .engine
            .container
            .remove_service(name, Box::new(|_| {}))?;
        if let Some(record) = self.txn.state.steps.get_mut(&self.step) {
            record.wrote = true;
        }
        Ok(())
    }

    pub fn require_reload(&mut self) {
        self.txn.state.requires_reload = true;
        if self.txn.engine.process.require_reload() {
            self.txn.state.reload_changed = true;
        }
    }

    pub fn require_restart(&mut self) {
        self.txn.state.requires_restart = true;
        if self.txn.engine.process.require_restart() {
            self.txn.state.restart_changed = true;
        }
    }

    /// Buffered; delivered only if the transaction commits.
    pub fn emit(&mut self, notification: Notification) {
        self.txn.state.notifications.push(notification);
    }

    /// Buffered; recorded only if the transaction commits.
    pub fn audit(&mut self, record: AuditRecord) {
        self.txn.state.audit.push(record);
    }
}

/// Passed to result handlers during finalization.
pub struct ResultContext<'a> {
    pub(crate) txn: &'a mut Transaction,
    pub(crate) step: StepId,
    pub(crate) action: ResultAction,
}

impl ResultContext<'_> {
    pub fn step_id(&self) -> StepId {
        self.step
    }

    pub fn action(&self) -> ResultAction {
        self.action
    }

    /// Whether this step's own handler reported a failure.
    pub fn step_failed(&self) -> bool {
        self.txn
            .state
            .steps
            .get(&self.step)
            .is_some_and(|record| record.failed)
    }

    pub fn response_mut(&mut self) -> &mut Response {
        let id = self
            .txn
            .state
            .steps
            .get(&self.step)
            .map_or(self.txn.root_response, |record| record.response);
        self.txn.state.responses.entry(id).or_default()
    }

    pub fn response(&self, id: ResponseId) -> Option<&Response> {
        self.txn.state.responses.get(&id)
    }

    pub fn container(&self) -> Arc<dyn ServiceContainer> {
        Arc::clone(&self.txn.engine.container)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.txn.engine.config
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.txn.state.warnings.push(warning.into());
    }
}
