//! Step records and the queues they wait in.
//!
//! Records live in an arena keyed by [`StepId`]. Each records two links: the
//! `parent` that added it and the `predecessor` that ran immediately before
//! it. Rollback follows predecessors, so it unwinds in exact reverse execution
//! order regardless of nesting. Ids come from one allocator per engine, which
//! keeps them unique across the worker transactions of a parallel boot.

use crate::context::ResultContext;
use crate::handler::{HandlerError, StepHandler};
use crate::lifecycle::{ResultAction, Stage};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_model::{Operation, ServiceName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StepId(pub(crate) u64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step-{}", self.0)
    }
}

/// Identifies a response accumulator. Steps added for the same operation share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResponseId(pub(crate) u64);

#[derive(Debug, Clone, Default)]
pub(crate) struct IdAllocator {
    next: Arc<AtomicU64>,
}

impl IdAllocator {
    fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn step(&self) -> StepId {
        StepId(self.next())
    }

    pub(crate) fn response(&self) -> ResponseId {
        ResponseId(self.next())
    }
}

/// Invoked once during finalization with the transaction's final action.
pub(crate) type ResultHandler =
    Box<dyn FnOnce(&mut ResultContext<'_>, ResultAction) -> Result<(), HandlerError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum WriteKind {
    Resources,
    Registrations,
    Capabilities,
    Services,
}

pub(crate) struct StepRecord {
    pub(crate) operation: Arc<Operation>,
    pub(crate) stage: Stage,
    pub(crate) parent: Option<StepId>,
    pub(crate) predecessor: Option<StepId>,
    pub(crate) response: ResponseId,
    /// The first step of an operation owns its response slot.
    pub(crate) owns_response: bool,
    pub(crate) result_handler: Option<ResultHandler>,
    pub(crate) services_added: Vec<ServiceName>,
    pub(crate) authorized: BTreeSet<WriteKind>,
    pub(crate) wrote: bool,
    pub(crate) executed: bool,
    pub(crate) failed: bool,
}

impl StepRecord {
    pub(crate) fn new(
        operation: Arc<Operation>,
        stage: Stage,
        parent: Option<StepId>,
        response: ResponseId,
        owns_response: bool,
    ) -> Self {
        Self {
            operation,
            stage,
            parent,
            predecessor: None,
            response,
            owns_response,
            result_handler: None,
            services_added: Vec::new(),
            authorized: BTreeSet::new(),
            wrote: false,
            executed: false,
            failed: false,
        }
    }
}

pub(crate) struct PendingStep {
    pub(crate) id: StepId,
    pub(crate) handler: Box<dyn StepHandler>,
}

/// The VERIFY queue, which parallel boot workers push into concurrently.
#[derive(Default)]
pub(crate) struct VerifyQueue {
    steps: Mutex<VecDeque<PendingStep>>,
}

impl VerifyQueue {
    pub(crate) fn push(&self, step: PendingStep, priority: bool) {
        let mut steps = self.steps.lock();
        if priority {
            steps.push_front(step);
        } else {
            steps.push_back(step);
        }
    }

    pub(crate) fn pop(&self) -> Option<PendingStep> {
        self.steps.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.steps.lock().len()
    }
}

/// FIFO queues for the stages a single thread owns.
#[derive(Default)]
pub(crate) struct StageQueues {
    pub(crate) model: VecDeque<PendingStep>,
    pub(crate) runtime: VecDeque<PendingStep>,
    pub(crate) domain: VecDeque<PendingStep>,
}

impl StageQueues {
    /// The local queue for `stage`. VERIFY and DONE have none.
    pub(crate) fn queue_mut(&mut self, stage: Stage) -> Option<&mut VecDeque<PendingStep>> {
        match stage {
            Stage::Model => Some(&mut self.model),
            Stage::Runtime => Some(&mut self.runtime),
            Stage::Domain => Some(&mut self.domain),
            Stage::Verify | Stage::Done => None,
        }
    }

    pub(crate) fn append(&mut self, mut other: StageQueues) {
        self.model.append(&mut other.model);
        self.runtime.append(&mut other.runtime);
        self.domain.append(&mut other.domain);
    }
}
