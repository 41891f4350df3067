use crate::collaborators::{AuditRecord, Notification};
use crate::concurrency::CancellationToken;
use crate::engine::EngineInner;
use crate::handler::{HandlerError, StepHandler};
use crate::lifecycle::{ResultAction, Stage};
use crate::lock::{LockMode, TxnId};
use crate::step::{PendingStep, ResponseId, StageQueues, StepId, StepRecord, VerifyQueue};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tessera_model::{Operation, OperationHeaders, Outcome, PathAddress, Response, ServiceName};
use tessera_store::{
    CapabilityId, ModifiedParts, PersistenceResource, RequirementKey, Snapshot,
    TransactionSnapshot,
};

pub(crate) enum TxnMode {
    Root,
    /// A parallel boot partition: MODEL only, no locking, writes confined to `prefix`.
    Worker { prefix: PathAddress },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Ok,
    Failed,
    Deferred,
    Fault,
    Timeout,
    Cancelled,
}

/// Everything a transaction accumulates that can be handed across threads.
#[derive(Default)]
pub(crate) struct TxnState {
    pub(crate) steps: BTreeMap<StepId, StepRecord>,
    pub(crate) responses: BTreeMap<ResponseId, Response>,
    pub(crate) first_executed: Option<StepId>,
    pub(crate) last_executed: Option<StepId>,
    pub(crate) last_outcome: Option<DispatchOutcome>,
    pub(crate) action: ResultAction,
    pub(crate) rollback_only: bool,
    pub(crate) cancelled: bool,
    pub(crate) timed_out: bool,
    pub(crate) defer_used: bool,
    pub(crate) fault: Option<String>,
    pub(crate) first_failure: Option<Value>,
    pub(crate) capability_removals: BTreeMap<CapabilityId, StepId>,
    pub(crate) requirement_owners: BTreeMap<RequirementKey, BTreeSet<StepId>>,
    pub(crate) service_owners: BTreeMap<ServiceName, StepId>,
    pub(crate) services_touched: bool,
    pub(crate) requires_reload: bool,
    pub(crate) requires_restart: bool,
    pub(crate) reload_changed: bool,
    pub(crate) restart_changed: bool,
    pub(crate) audit: Vec<AuditRecord>,
    pub(crate) notifications: Vec<Notification>,
    pub(crate) warnings: Vec<String>,
}

impl TxnState {
    /// Merge a worker's state, chaining its executed steps after ours.
    pub(crate) fn absorb(&mut self, mut other: TxnState) {
        if let Some(first) = other.first_executed {
            if let Some(record) = other.steps.get_mut(&first) {
                record.predecessor = self.last_executed;
            }
            if self.first_executed.is_none() {
                self.first_executed = Some(first);
            }
            self.last_executed = other.last_executed;
        }
        self.steps.append(&mut other.steps);
        self.responses.append(&mut other.responses);
        if other.action == ResultAction::Rollback {
            self.action = ResultAction::Rollback;
        }
        self.rollback_only |= other.rollback_only;
        self.cancelled |= other.cancelled;
        self.timed_out |= other.timed_out;
        self.defer_used |= other.defer_used;
        if self.fault.is_none() {
            self.fault = other.fault;
        }
        if self.first_failure.is_none() {
            self.first_failure = other.first_failure;
        }
        self.capability_removals.append(&mut other.capability_removals);
        for (key, owners) in other.requirement_owners {
            self.requirement_owners
                .entry(key)
                .or_default()
                .extend(owners);
        }
        self.service_owners.append(&mut other.service_owners);
        self.services_touched |= other.services_touched;
        self.requires_reload |= other.requires_reload;
        self.requires_restart |= other.requires_restart;
        self.reload_changed |= other.reload_changed;
        self.restart_changed |= other.restart_changed;
        self.audit.append(&mut other.audit);
        self.notifications.append(&mut other.notifications);
        self.warnings.append(&mut other.warnings);
    }
}

/// One execution of the stage pipeline. Confined to the thread that created it.
pub(crate) struct Transaction {
    pub(crate) id: TxnId,
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) mode: TxnMode,
    pub(crate) snapshot: TransactionSnapshot,
    pub(crate) stage: Stage,
    pub(crate) queues: StageQueues,
    pub(crate) verify: Arc<VerifyQueue>,
    pub(crate) cancel: CancellationToken,
    pub(crate) headers: OperationHeaders,
    pub(crate) timeout: Duration,
    pub(crate) root_step: StepId,
    pub(crate) root_response: ResponseId,
    pub(crate) persist: bool,
    pub(crate) validated_generation: Option<u64>,
    pub(crate) persistence: Option<Box<dyn PersistenceResource>>,
    pub(crate) state: TxnState,
    _not_send: PhantomData<Rc<()>>,
}

impl Transaction {
    /// A top-level transaction whose root step will run `handler`.
    pub(crate) fn root(
        engine: Arc<EngineInner>,
        operation: Arc<Operation>,
        cancel: CancellationToken,
        persist: bool,
        handler: Box<dyn StepHandler>,
    ) -> Self {
        let id = engine.next_txn_id();
        let headers = operation.headers.clone();
        let timeout = headers
            .blocking_timeout()
            .unwrap_or_else(|| engine.config.blocking_timeout());
        let root_step = engine.ids.step();
        let root_response = engine.ids.response();
        let mut state = TxnState::default();
        state.responses.insert(root_response, Response::default());
        state.steps.insert(
            root_step,
            StepRecord::new(operation, Stage::Model, None, root_response, true),
        );
        let mut queues = StageQueues::default();
        queues.model.push_back(PendingStep {
            id: root_step,
            handler,
        });
        Self {
            id,
            engine,
            mode: TxnMode::Root,
            snapshot: TransactionSnapshot::new(),
            stage: Stage::Model,
            queues,
            verify: Arc::new(VerifyQueue::default()),
            cancel,
            headers,
            timeout,
            root_step,
            root_response,
            persist,
            validated_generation: None,
            persistence: None,
            state,
            _not_send: PhantomData,
        }
    }

    /// A boot partition executing on behalf of `parent`, seeded from `seed`.
    pub(crate) fn worker(parent: &WorkerSeed, prefix: PathAddress) -> Self {
        Self {
            id: parent.txn,
            engine: Arc::clone(&parent.engine),
            mode: TxnMode::Worker { prefix },
            snapshot: TransactionSnapshot::seeded(Arc::clone(&parent.snapshot)),
            stage: Stage::Model,
            queues: StageQueues::default(),
            verify: Arc::clone(&parent.verify),
            cancel: parent.cancel.clone(),
            headers: parent.headers.clone(),
            timeout: parent.timeout,
            root_step: parent.step,
            root_response: parent.response,
            persist: false,
            validated_generation: None,
            persistence: None,
            state: TxnState::default(),
            _not_send: PhantomData,
        }
    }

    pub(crate) fn is_worker(&self) -> bool {
        matches!(self.mode, TxnMode::Worker { .. })
    }

    pub(crate) fn seed(&self, step: StepId, response: ResponseId) -> WorkerSeed {
        WorkerSeed {
            engine: Arc::clone(&self.engine),
            txn: self.id,
            snapshot: Arc::new(self.snapshot.view(&self.engine.snapshots)),
            verify: Arc::clone(&self.verify),
            cancel: self.cancel.clone(),
            headers: self.headers.clone(),
            timeout: self.timeout,
            step,
            response,
        }
    }

    pub(crate) fn check_stage(&self, stage: Stage) -> Result<(), HandlerError> {
        if stage == Stage::Done {
            return Err(HandlerError::fault("steps cannot be added to the done stage"));
        }
        if stage < self.stage {
            return Err(HandlerError::fault(format!(
                "cannot add a {stage} step while the {} stage is executing",
                self.stage
            )));
        }
        if stage == Stage::Domain && !self.engine.config.coordinating_controller {
            return Err(HandlerError::fault(
                "the domain stage requires a coordinating controller",
            ));
        }
        Ok(())
    }

    /// Writes from a boot partition must stay inside its prefix.
    pub(crate) fn check_scope(&self, address: &PathAddress) -> Result<(), HandlerError> {
        match &self.mode {
            TxnMode::Worker { prefix } if !address.starts_with(prefix) => Err(
                HandlerError::fault(format!("boot partition {prefix} cannot write {address}")),
            ),
            _ => Ok(()),
        }
    }

    pub(crate) fn push_step(
        &mut self,
        spec: NewStep,
        handler: Box<dyn StepHandler>,
    ) -> Result<(StepId, ResponseId), HandlerError> {
        self.check_stage(spec.stage)?;
        let (response, owns_response) = match spec.response {
            Some(response) => (response, false),
            None => {
                let response = self.engine.ids.response();
                self.state.responses.insert(response, Response::default());
                (response, true)
            }
        };
        let id = self.engine.ids.step();
        self.state.steps.insert(
            id,
            StepRecord::new(
                spec.operation,
                spec.stage,
                spec.parent,
                response,
                owns_response,
            ),
        );
        let pending = PendingStep { id, handler };
        match self.queues.queue_mut(spec.stage) {
            Some(queue) if spec.priority => queue.push_front(pending),
            Some(queue) => queue.push_back(pending),
            None => self.verify.push(pending, spec.priority),
        }
        Ok((id, response))
    }

    pub(crate) fn ensure_lock(&mut self, mode: LockMode) -> Result<(), HandlerError> {
        if self.is_worker() {
            return Ok(());
        }
        match (self.engine.locks.held_by(self.id), mode) {
            (Some(LockMode::Exclusive), _) | (Some(LockMode::Shared), LockMode::Shared) => Ok(()),
            _ => {
                self.engine
                    .locks
                    .acquire(self.id, mode, self.timeout, &self.cancel)?;
                Ok(())
            }
        }
    }

    /// Mark `step` failed and record its failure on its response.
    pub(crate) fn fail_step(&mut self, step: StepId, description: Value) {
        let response = match self.state.steps.get_mut(&step) {
            Some(record) => {
                record.failed = true;
                record.response
            }
            None => self.root_response,
        };
        self.state
            .responses
            .entry(response)
            .or_default()
            .fail(description.clone());
        if self.state.first_failure.is_none() {
            self.state.first_failure = Some(description);
        }
    }

    pub(crate) fn force_rollback(&mut self) {
        self.state.action = ResultAction::Rollback;
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
        if !self.is_worker() {
            self.engine.active.set_stage(self.id, stage);
        }
    }

    /// Assemble the top-level response after finalization.
    pub(crate) fn take_response(&mut self) -> Response {
        let action = self.state.action;
        let mut response = self
            .state
            .responses
            .remove(&self.root_response)
            .unwrap_or_default();
        response.rolled_back = action == ResultAction::Rollback;
        if self.state.cancelled {
            response.outcome = Outcome::Cancelled;
            if response.failure_description.is_none() {
                response.failure_description = Some(Value::from("operation cancelled"));
            }
        } else if response.rolled_back || response.failure_description.is_some() {
            response.outcome = Outcome::Failed;
        }
        if response.rolled_back && response.failure_description.is_none() {
            response.failure_description = Some(
                self.state
                    .first_failure
                    .clone()
                    .unwrap_or_else(|| Value::from("operation rolled back")),
            );
        }
        if action == ResultAction::Keep {
            response.response_headers.requires_reload |= self.state.requires_reload;
            response.response_headers.requires_restart |= self.state.requires_restart;
        }
        for warning in self.state.warnings.drain(..) {
            response.add_warning(warning);
        }
        response.response_headers.dedup_warnings();
        response
    }

    /// Hand back what a boot partition produced.
    pub(crate) fn into_worker_result(mut self) -> WorkerResult {
        let prefix = match &self.mode {
            TxnMode::Worker { prefix } => prefix.clone(),
            TxnMode::Root => PathAddress::root(),
        };
        let snapshot = std::mem::take(&mut self.snapshot);
        WorkerResult {
            prefix,
            parts: snapshot.into_parts(),
            queues: std::mem::take(&mut self.queues),
            state: std::mem::take(&mut self.state),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.is_worker() {
            self.engine.locks.release(self.id);
        }
    }
}

/// Where and how a new step is queued.
pub(crate) struct NewStep {
    pub(crate) stage: Stage,
    pub(crate) operation: Arc<Operation>,
    pub(crate) parent: Option<StepId>,
    /// `None` allocates a fresh response slot.
    pub(crate) response: Option<ResponseId>,
    pub(crate) priority: bool,
}

/// What a boot worker needs from the controlling transaction.
pub(crate) struct WorkerSeed {
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) txn: TxnId,
    pub(crate) snapshot: Arc<Snapshot>,
    pub(crate) verify: Arc<VerifyQueue>,
    pub(crate) cancel: CancellationToken,
    pub(crate) headers: OperationHeaders,
    pub(crate) timeout: Duration,
    pub(crate) step: StepId,
    pub(crate) response: ResponseId,
}

pub(crate) struct WorkerResult {
    pub(crate) prefix: PathAddress,
    pub(crate) parts: ModifiedParts,
    pub(crate) queues: StageQueues,
    pub(crate) state: TxnState,
}
