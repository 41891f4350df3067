//! Upgradeable shared/exclusive lock over the snapshot and service container.
//!
//! Many transactions may hold the lock shared, or exactly one may hold it
//! exclusive. A holder may re-acquire freely and a sole shared holder may
//! upgrade. Before blocking, the waits-for graph is walked from the current
//! holders; a path back to the requester fails fast with [`LockError::Deadlock`].
//! New shared holds wait behind a queued exclusive request.

use crate::concurrency::CancellationToken;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Identifies one transaction for locking and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("{txn} timed out after {waited_ms}ms waiting for the {mode} lock")]
    Timeout {
        txn: TxnId,
        mode: LockMode,
        waited_ms: u64,
    },
    #[error("{txn} would deadlock waiting for the {mode} lock held by {holder}")]
    Deadlock {
        txn: TxnId,
        mode: LockMode,
        holder: TxnId,
    },
    #[error("{0} was cancelled while waiting for a lock")]
    Cancelled(TxnId),
}

const WAIT_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct LockState {
    exclusive: Option<TxnId>,
    shared: BTreeSet<TxnId>,
    waiting: BTreeMap<TxnId, LockMode>,
}

impl LockState {
    /// The transactions that prevent `txn` from taking `mode` right now.
    /// A queued exclusive request blocks new shared holders.
    fn blockers(&self, txn: TxnId, mode: LockMode) -> Vec<TxnId> {
        match (self.exclusive, mode) {
            (Some(holder), _) if holder == txn => Vec::new(),
            (Some(holder), _) => vec![holder],
            (None, LockMode::Shared) if self.shared.contains(&txn) => Vec::new(),
            (None, LockMode::Shared) => self
                .waiting
                .iter()
                .filter(|(t, m)| **t != txn && **m == LockMode::Exclusive)
                .map(|(t, _)| *t)
                .collect(),
            (None, LockMode::Exclusive) => {
                self.shared.iter().copied().filter(|t| *t != txn).collect()
            }
        }
    }

    fn try_grant(&mut self, txn: TxnId, mode: LockMode) -> bool {
        if !self.blockers(txn, mode).is_empty() {
            return false;
        }
        match mode {
            LockMode::Shared => {
                if self.exclusive != Some(txn) {
                    self.shared.insert(txn);
                }
            }
            LockMode::Exclusive => {
                self.shared.remove(&txn);
                self.exclusive = Some(txn);
            }
        }
        true
    }

    /// A holder blocking `txn` that is itself, transitively, waiting on `txn`.
    fn deadlock_holder(&self, txn: TxnId, mode: LockMode) -> Option<TxnId> {
        for holder in self.blockers(txn, mode) {
            let mut seen = BTreeSet::new();
            let mut stack = vec![holder];
            while let Some(current) = stack.pop() {
                if !seen.insert(current) {
                    continue;
                }
                let Some(&waiting_mode) = self.waiting.get(&current) else {
                    continue;
                };
                for next in self.blockers(current, waiting_mode) {
                    if next == txn {
                        return Some(holder);
                    }
                    stack.push(next);
                }
            }
        }
        None
    }

    fn mode_of(&self, txn: TxnId) -> Option<LockMode> {
        if self.exclusive == Some(txn) {
            Some(LockMode::Exclusive)
        } else if self.shared.contains(&txn) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct LockCoordinator {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_exclusive(
        &self,
        txn: TxnId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), LockError> {
        self.acquire(txn, LockMode::Exclusive, timeout, cancel)
    }

    pub fn acquire_shared(
        &self,
        txn: TxnId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), LockError> {
        self.acquire(txn, LockMode::Shared, timeout, cancel)
    }

    pub fn acquire(
        &self,
        txn: TxnId,
        mode: LockMode,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), LockError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.state.lock();
        loop {
            if state.try_grant(txn, mode) {
                state.waiting.remove(&txn);
                debug!("{txn} acquired {mode} lock");
                return Ok(());
            }
            let error = if let Some(holder) = state.deadlock_holder(txn, mode) {
                Some(LockError::Deadlock { txn, mode, holder })
            } else if cancel.is_cancelled() {
                Some(LockError::Cancelled(txn))
            } else if Instant::now() >= deadline {
                Some(LockError::Timeout {
                    txn,
                    mode,
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            } else {
                None
            };
            if let Some(error) = error {
                state.waiting.remove(&txn);
                self.cond.notify_all();
                warn!("{error}");
                return Err(error);
            }
            state.waiting.insert(txn, mode);
            let slice = deadline
                .saturating_duration_since(Instant::now())
                .min(WAIT_SLICE);
            self.cond.wait_for(&mut state, slice);
        }
    }

    /// Drop every hold and pending wait of `txn`.
    pub fn release(&self, txn: TxnId) {
        let mut state = self.state.lock();
        let held = state.mode_of(txn);
        if state.exclusive == Some(txn) {
            state.exclusive = None;
        }
        state.shared.remove(&txn);
        state.waiting.remove(&txn);
        self.cond.notify_all();
        if let Some(mode) = held {
            debug!("{txn} released {mode} lock");
        }
    }

    pub fn held_by(&self, txn: TxnId) -> Option<LockMode> {
        self.state.lock().mode_of(txn)
    }

    pub fn is_waiting(&self, txn: TxnId) -> bool {
        self.state.lock().waiting.contains_key(&txn)
    }

    pub fn exclusive_holder(&self) -> Option<TxnId> {
        self.state.lock().exclusive
    }
}
