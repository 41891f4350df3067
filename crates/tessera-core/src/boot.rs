//! Boot: replaying a persisted model as one transaction.
//!
//! Operations whose address starts with the parallel boot key are grouped by
//! their first element; each group runs its MODEL steps on a worker thread
//! against a private copy of the stores. The controlling transaction then
//! grafts every group's subtree back in, in group order, and carries on with
//! RUNTIME as a single transaction.

use crate::context::{OperationContext, ResultContext};
use crate::handler::{HandlerError, StepHandler, StepResult};
use crate::handlers::ADD;
use crate::lifecycle::Stage;
use crate::lock::LockMode;
use crate::scheduler;
use crate::step::ResponseId;
use crate::transaction::{NewStep, Transaction, WorkerResult, WorkerSeed};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tessera_model::{Operation, PathAddress, Response};
use tessera_store::ResourceTree;
use tracing::{debug, info};

/// `add` operations recreating every resource in `tree`, parents first.
pub fn operations_from_tree(tree: &ResourceTree) -> Vec<Operation> {
    tree.iter()
        .filter(|(address, _)| !address.is_root())
        .map(|(address, resource)| {
            let mut operation = Operation::new(ADD, address.clone());
            operation.parameters = resource.model.clone();
            operation
        })
        .collect()
}

type Partition = (PathAddress, Vec<Operation>);

/// Split boot operations into the sequential remainder and per-prefix groups,
/// groups ordered by first appearance. Wildcard prefixes stay sequential so
/// definitions reach every group.
pub(crate) fn partition(
    operations: Vec<Operation>,
    key: &str,
) -> (Vec<Operation>, Vec<Partition>) {
    let mut sequential = Vec::new();
    let mut partitions: Vec<Partition> = Vec::new();
    for operation in operations {
        let prefix = match operation.address.first() {
            Some(first) if !key.is_empty() && first.key == key && !first.is_wildcard() => {
                PathAddress::root().append(first.key.clone(), first.value.clone())
            }
            _ => {
                sequential.push(operation);
                continue;
            }
        };
        match partitions.iter_mut().find(|(p, _)| *p == prefix) {
            Some((_, group)) => group.push(operation),
            None => partitions.push((prefix, vec![operation])),
        }
    }
    (sequential, partitions)
}

type Labels = Vec<(String, ResponseId)>;

fn label(operation: &Operation) -> String {
    format!("{} {}", operation.name, operation.address)
}

/// Copy each labelled child failure into the boot response.
fn gather_failures(rctx: &mut ResultContext<'_>, labels: &Labels) {
    let failures: Map<String, Value> = labels
        .iter()
        .filter_map(|(label, id)| {
            let failure = rctx.response(*id)?.failure_description.clone()?;
            Some((label.clone(), failure))
        })
        .collect();
    merge_failures(rctx.response_mut(), failures);
}

fn merge_failures(response: &mut Response, failures: Map<String, Value>) {
    if failures.is_empty() {
        return;
    }
    match &mut response.failure_description {
        Some(Value::Object(existing)) => existing.extend(failures),
        Some(_) => {}
        None => response.fail(Value::Object(failures)),
    }
}

/// Root step of a boot transaction.
pub(crate) struct BootHandler {
    pub(crate) sequential: Vec<Operation>,
    pub(crate) partitions: Vec<Partition>,
}

impl StepHandler for BootHandler {
    fn execute(
        &mut self,
        ctx: &mut OperationContext<'_>,
        _: &Operation,
    ) -> Result<StepResult, HandlerError> {
        ctx.acquire_lock(LockMode::Exclusive)?;
        let mut labels = Labels::new();
        for operation in std::mem::take(&mut self.sequential) {
            let name = label(&operation);
            let handler = ctx.txn.engine.registry.resolve_or_unknown(&operation.name);
            labels.push((name, ctx.add_child_step(Stage::Model, operation, handler, false)?));
        }
        let partitions = std::mem::take(&mut self.partitions);
        if !partitions.is_empty() {
            ctx.add_handler_step(Stage::Model, Box::new(ParallelBoot { partitions }), false)?;
        }
        ctx.complete_step(move |rctx, _| {
            gather_failures(rctx, &labels);
            Ok(())
        });
        Ok(StepResult::Ok)
    }
}

/// Runs the partitions on worker threads and merges what they produced.
struct ParallelBoot {
    partitions: Vec<Partition>,
}

impl StepHandler for ParallelBoot {
    fn execute(
        &mut self,
        ctx: &mut OperationContext<'_>,
        _: &Operation,
    ) -> Result<StepResult, HandlerError> {
        let partitions = std::mem::take(&mut self.partitions);
        let workers = ctx.config().boot_workers.clamp(1, partitions.len().max(1));
        let seed = ctx.txn.seed(ctx.step, ctx.response_id());
        info!(
            "booting {} partitions on {workers} workers",
            partitions.len()
        );
        let results = run_partitions(&seed, partitions, workers);
        let mut labels = Labels::new();
        for (partition_labels, result) in results {
            absorb(ctx.txn, result);
            labels.extend(partition_labels);
        }
        ctx.complete_step(move |rctx, _| {
            gather_failures(rctx, &labels);
            Ok(())
        });
        Ok(StepResult::Ok)
    }
}

fn run_partitions(
    seed: &WorkerSeed,
    partitions: Vec<Partition>,
    workers: usize,
) -> Vec<(Labels, WorkerResult)> {
    let total = partitions.len();
    let queue: Mutex<VecDeque<(usize, Partition)>> =
        Mutex::new(partitions.into_iter().enumerate().collect());
    let done: Mutex<Vec<(usize, (Labels, WorkerResult))>> =
        Mutex::new(Vec::with_capacity(total));
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let next = queue.lock().pop_front();
                let Some((index, (prefix, operations))) = next else {
                    break;
                };
                let result = run_worker(seed, prefix, operations);
                done.lock().push((index, result));
            });
        }
    });
    let mut done = done.into_inner();
    done.sort_by_key(|(index, _)| *index);
    done.into_iter().map(|(_, result)| result).collect()
}

fn run_worker(
    seed: &WorkerSeed,
    prefix: PathAddress,
    operations: Vec<Operation>,
) -> (Labels, WorkerResult) {
    debug!("boot worker running {} operations under {prefix}", operations.len());
    let mut txn = Transaction::worker(seed, prefix);
    let mut labels = Labels::new();
    for operation in operations {
        let name = label(&operation);
        let handler = seed.engine.registry.resolve_or_unknown(&operation.name);
        let spec = NewStep {
            stage: Stage::Model,
            operation: Arc::new(operation),
            parent: Some(seed.step),
            response: None,
            priority: false,
        };
        match txn.push_step(spec, handler) {
            Ok((_, response)) => labels.push((name, response)),
            Err(e) => {
                txn.state.fault.get_or_insert_with(|| e.to_string());
                txn.force_rollback();
                break;
            }
        }
    }
    scheduler::run(&mut txn);
    (labels, txn.into_worker_result())
}

/// Graft a partition's stores under its prefix and adopt its steps.
fn absorb(txn: &mut Transaction, result: WorkerResult) {
    let WorkerResult {
        prefix,
        parts,
        queues,
        state,
    } = result;
    let handle = &txn.engine.snapshots;
    if let Some(resources) = parts.resources {
        txn.snapshot.resources_mut(handle).graft(&prefix, &resources);
    }
    if let Some(registrations) = parts.registrations {
        txn.snapshot
            .registrations_mut(handle)
            .graft(&prefix, &registrations);
    }
    if let Some(capabilities) = parts.capabilities {
        txn.snapshot
            .capabilities_mut(handle)
            .graft(&prefix, &capabilities);
    }
    txn.queues.append(queues);
    txn.state.absorb(state);
}
