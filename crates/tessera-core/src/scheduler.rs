//! The stage loop: pop, dispatch, decide whether to continue, advance.

use crate::context::OperationContext;
use crate::handler::{HandlerError, StepResult};
use crate::lifecycle::{validate_stage_transition, ResultAction, Stage};
use crate::stability;
use crate::step::{PendingStep, StepId};
use crate::transaction::{DispatchOutcome, Transaction};
use crate::validator;
use serde_json::Value;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Drive `txn` until DONE, or until a step or gate stops it.
///
/// Worker transactions stop once their MODEL queue drains.
pub(crate) fn run(txn: &mut Transaction) {
    loop {
        if txn.cancel.is_cancelled() {
            mark_cancelled(txn);
            return;
        }
        match next_step(txn) {
            Some(step) => {
                dispatch(txn, step);
                if !can_continue(txn) {
                    debug!("{} stops in the {} stage", txn.id, txn.stage);
                    return;
                }
            }
            None => {
                if !advance(txn) {
                    return;
                }
            }
        }
    }
}

fn next_step(txn: &mut Transaction) -> Option<PendingStep> {
    match txn.queues.queue_mut(txn.stage) {
        Some(queue) => queue.pop_front(),
        None if txn.stage == Stage::Verify => txn.verify.pop(),
        None => None,
    }
}

fn mark_cancelled(txn: &mut Transaction) {
    if !txn.state.cancelled {
        debug!("{} cancelled in the {} stage", txn.id, txn.stage);
    }
    txn.state.cancelled = true;
    txn.force_rollback();
}

/// Leave the current stage. Returns false when execution should stop.
fn advance(txn: &mut Transaction) -> bool {
    if txn.stage == Stage::Model {
        if txn.is_worker() {
            return false;
        }
        if !validator::validate(txn) {
            return false;
        }
    }
    let Some(next) = txn.stage.next() else {
        return false;
    };
    if let Err(e) = validate_stage_transition(txn.stage, next) {
        error!("{}: {e}", txn.id);
        txn.state.fault.get_or_insert_with(|| e.to_string());
        txn.force_rollback();
        return false;
    }
    if next == Stage::Verify && !stability::await_stability(txn) {
        return false;
    }
    debug!("{} enters the {next} stage", txn.id);
    txn.set_stage(next);
    next != Stage::Done
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

fn dispatch(txn: &mut Transaction, pending: PendingStep) {
    let PendingStep { id, mut handler } = pending;
    let last = txn.state.last_executed;
    let Some(record) = txn.state.steps.get_mut(&id) else {
        warn!("{} dropped {id}: no step record", txn.id);
        return;
    };
    record.predecessor = last;
    record.executed = true;
    let operation = Arc::clone(&record.operation);
    debug!(
        "{} dispatching {id} ({} at {}, parent {:?}) in the {} stage",
        txn.id, operation.name, operation.address, record.parent, txn.stage
    );
    if txn.state.first_executed.is_none() {
        txn.state.first_executed = Some(id);
    }
    txn.state.last_executed = Some(id);

    let result = {
        let mut ctx = OperationContext {
            txn: &mut *txn,
            step: id,
        };
        catch_unwind(AssertUnwindSafe(|| handler.execute(&mut ctx, &operation)))
    };

    let outcome = match result {
        Ok(Ok(StepResult::Ok)) => DispatchOutcome::Ok,
        Ok(Ok(StepResult::Fail(description))) => {
            txn.fail_step(id, description);
            DispatchOutcome::Failed
        }
        Ok(Ok(StepResult::FailDeferRollback(description))) => {
            txn.fail_step(id, description);
            DispatchOutcome::Deferred
        }
        Ok(Err(HandlerError::Client(description))) => {
            txn.fail_step(id, description);
            DispatchOutcome::Failed
        }
        Ok(Err(HandlerError::Cancelled)) => DispatchOutcome::Cancelled,
        Ok(Err(HandlerError::Timeout(message))) => {
            warn!("{} {id} timed out: {message}", txn.id);
            txn.state.timed_out = true;
            txn.fail_step(id, Value::String(format!("timed out: {message}")));
            DispatchOutcome::Timeout
        }
        Ok(Err(HandlerError::Fault(message))) => record_fault(txn, id, message),
        Err(payload) => record_fault(txn, id, panic_message(payload.as_ref())),
    };
    txn.state.last_outcome = Some(outcome);
}

fn record_fault(txn: &mut Transaction, id: StepId, message: String) -> DispatchOutcome {
    error!("{} {id} failed unexpectedly: {message}", txn.id);
    txn.fail_step(id, Value::String(message.clone()));
    if txn.state.fault.is_none() {
        txn.state.fault = Some(message);
    }
    DispatchOutcome::Fault
}

/// The post-dispatch checkpoint.
fn can_continue(txn: &mut Transaction) -> bool {
    if txn.cancel.is_cancelled() {
        mark_cancelled(txn);
        return false;
    }
    let runtime_policy = txn.headers.rollback_on_runtime_failure;
    match txn.state.last_outcome {
        None | Some(DispatchOutcome::Ok) => {}
        Some(DispatchOutcome::Cancelled) => {
            mark_cancelled(txn);
            return false;
        }
        Some(DispatchOutcome::Fault | DispatchOutcome::Timeout) => {
            txn.force_rollback();
            return false;
        }
        Some(DispatchOutcome::Failed) => {
            if txn.stage == Stage::Model || runtime_policy {
                txn.force_rollback();
            }
        }
        Some(DispatchOutcome::Deferred) => {
            let deferrable = matches!(txn.stage, Stage::Runtime | Stage::Verify)
                && !txn.state.defer_used
                && !txn.state.rollback_only;
            if deferrable {
                debug!("{} defers rollback once", txn.id);
                txn.state.defer_used = true;
            } else if txn.stage == Stage::Model || runtime_policy {
                txn.force_rollback();
            }
        }
    }
    txn.state.action == ResultAction::Keep
}
