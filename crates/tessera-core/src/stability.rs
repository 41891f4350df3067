//! The gate between RUNTIME and VERIFY: wait for the service container to settle.

use crate::lifecycle::Stage;
use crate::transaction::Transaction;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Returns false, with ROLLBACK forced, if execution must not enter VERIFY.
pub(crate) fn await_stability(txn: &mut Transaction) -> bool {
    if !txn.state.services_touched {
        return true;
    }
    let container = Arc::clone(&txn.engine.container);
    let deadline = Instant::now() + txn.timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if container.wait_quiescent(remaining.min(WAIT_SLICE)) {
            break;
        }
        if txn.cancel.is_cancelled() {
            txn.state.cancelled = true;
            txn.force_rollback();
            return false;
        }
        if Instant::now() >= deadline {
            warn!(
                "{} service container did not stabilize within {}ms; process marked restart-required",
                txn.id,
                txn.timeout.as_millis()
            );
            txn.engine.process.mark_unstable();
            txn.state.timed_out = true;
            let root = txn.root_step;
            txn.fail_step(
                root,
                Value::from("timed out waiting for the service container to stabilize"),
            );
            txn.force_rollback();
            return false;
        }
    }
    debug!("{} service container is stable", txn.id);

    let mut any_failed = false;
    for (name, reason) in container.failed_services() {
        let Some(step) = txn.state.service_owners.get(&name).copied() else {
            continue;
        };
        any_failed = true;
        txn.fail_step(
            step,
            Value::String(format!("service '{name}' failed to start: {reason}")),
        );
    }
    if any_failed && txn.headers.rollback_on_runtime_failure {
        debug!(
            "{} rolls back: services failed before the {} stage",
            txn.id,
            Stage::Verify
        );
        txn.force_rollback();
        return false;
    }
    true
}
