//! Finalization: fix the result action, unwind the executed steps in reverse,
//! then publish or discard the snapshot and release the lock.

use crate::collaborators::AuditRecord;
use crate::context::ResultContext;
use crate::handler::HandlerError;
use crate::lifecycle::{ResultAction, Stage};
use crate::scheduler::panic_message;
use crate::step::StepId;
use crate::transaction::Transaction;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tessera_model::{Outcome, ServiceName};
use tessera_runtime::RemovalTracker;
use tracing::{debug, error, info, warn};

/// Finalize `txn`. Returns the first result-handler failure, if any.
pub(crate) fn finalize(txn: &mut Transaction) -> Option<String> {
    prepare_persistence(txn);
    let action = txn.state.action;
    txn.set_stage(Stage::Done);
    info!("{} finalizing with {action}", txn.id);

    let mut first_error: Option<String> = None;
    let mut cursor = txn.state.last_executed;
    while let Some(id) = cursor {
        let Some(record) = txn.state.steps.get_mut(&id) else {
            break;
        };
        cursor = record.predecessor;
        let handler = record.result_handler.take();
        let services = if action == ResultAction::Rollback {
            std::mem::take(&mut record.services_added)
        } else {
            Vec::new()
        };
        if !services.is_empty() {
            remove_services(txn, id, &services);
        }
        let Some(handler) = handler else {
            continue;
        };
        let outcome = {
            let mut ctx = ResultContext {
                txn: &mut *txn,
                step: id,
                action,
            };
            catch_unwind(AssertUnwindSafe(|| handler(&mut ctx, action)))
        };
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(describe(&e)),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        if let Some(message) = failure {
            warn!("{} result handler of {id} failed: {message}", txn.id);
            if first_error.is_none() {
                first_error = Some(message);
            }
        }
    }

    let snapshot = std::mem::take(&mut txn.snapshot);
    let persistence = txn.persistence.take();
    match action {
        ResultAction::Keep => match snapshot.commit(&txn.engine.snapshots) {
            Ok(published) => {
                if let Some(published) = published {
                    debug!("{} published snapshot {}", txn.id, published.version());
                }
                if let Some(resource) = persistence {
                    if let Err(e) = resource.commit() {
                        error!("{} failed to persist configuration: {e}", txn.id);
                        txn.state
                            .warnings
                            .push(format!("configuration was not persisted: {e}"));
                    }
                }
            }
            Err(e) => {
                error!("{} could not publish its snapshot: {e}", txn.id);
                if let Some(resource) = persistence {
                    resource.rollback();
                }
                if first_error.is_none() {
                    first_error = Some(e.to_string());
                }
            }
        },
        ResultAction::Rollback => {
            snapshot.discard();
            if let Some(resource) = persistence {
                resource.rollback();
            }
        }
    }
    if !txn.is_worker() {
        txn.engine.locks.release(txn.id);
    }

    match action {
        ResultAction::Keep => flush(txn),
        ResultAction::Rollback => revert_process_flags(txn),
    }
    first_error
}

fn describe(e: &HandlerError) -> String {
    match e {
        HandlerError::Client(Value::String(s)) => s.clone(),
        other => other.to_string(),
    }
}

/// On KEEP with a modified model, prepare the persisted write before anything is published.
fn prepare_persistence(txn: &mut Transaction) {
    if !txn.persist
        || txn.state.action != ResultAction::Keep
        || !txn.snapshot.modified().resources
    {
        return;
    }
    let tree = txn.snapshot.resources(&txn.engine.snapshots);
    match txn.engine.persister.store(&tree) {
        Ok(resource) => txn.persistence = Some(resource),
        Err(e) => {
            error!("{} could not prepare configuration persistence: {e}", txn.id);
            let root = txn.root_step;
            txn.fail_step(
                root,
                Value::String(format!("failed to persist configuration: {e}")),
            );
            txn.force_rollback();
        }
    }
}

/// Remove the services `step` added and wait for the removals to finish.
fn remove_services(txn: &mut Transaction, step: StepId, services: &[ServiceName]) {
    let container = Arc::clone(&txn.engine.container);
    let tracker = RemovalTracker::new();
    for name in services {
        debug!("{} rollback of {step} removes service {name}", txn.id);
        if let Err(e) = container.remove_service(name, tracker.begin(name)) {
            warn!("{} could not remove service {name}: {e}", txn.id);
            tracker.abandon(name);
        }
    }
    if let Err(stragglers) = tracker.await_all(txn.engine.config.removal_timeout()) {
        let names: Vec<String> = stragglers.iter().map(ToString::to_string).collect();
        warn!(
            "{} services still being removed after rollback: {}",
            txn.id,
            names.join(", ")
        );
        txn.engine.process.mark_stuck_removals();
        debug!("{} marked the process restart-required", txn.id);
        txn.state.warnings.push(format!(
            "services could not be removed: {}; restart required",
            names.join(", ")
        ));
    }
}

fn flush(txn: &mut Transaction) {
    let engine = Arc::clone(&txn.engine);
    let executed: Vec<AuditRecord> = txn
        .state
        .steps
        .values()
        .filter(|record| record.owns_response && record.executed)
        .map(|record| AuditRecord {
            txn: txn.id,
            operation: record.operation.name.clone(),
            address: record.operation.address.clone(),
            caller: record.operation.headers.caller_type,
            outcome: txn
                .state
                .responses
                .get(&record.response)
                .map_or(Outcome::Success, |response| response.outcome),
        })
        .collect();
    for record in &executed {
        engine.audit.record(record);
    }
    for record in txn.state.audit.drain(..) {
        engine.audit.record(&record);
    }
    for notification in txn.state.notifications.drain(..) {
        engine.notifications.emit(&notification);
    }
}

fn revert_process_flags(txn: &mut Transaction) {
    txn.state.audit.clear();
    txn.state.notifications.clear();
    if txn.state.reload_changed {
        txn.engine.process.revert_reload();
    }
    if txn.state.restart_changed {
        txn.engine.process.revert_restart();
    }
}
