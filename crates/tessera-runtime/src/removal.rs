use crate::container::RemovalListener;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_model::ServiceName;

#[derive(Default)]
struct Inner {
    outstanding: Mutex<BTreeSet<ServiceName>>,
    cond: Condvar,
}

/// Tracks a batch of asynchronous removals so a caller can wait for all of them.
#[derive(Clone, Default)]
pub struct RemovalTracker {
    inner: Arc<Inner>,
}

impl RemovalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `name` outstanding and return the listener that completes it.
    pub fn begin(&self, name: &ServiceName) -> RemovalListener {
        self.inner.outstanding.lock().insert(name.clone());
        let inner = Arc::clone(&self.inner);
        Box::new(move |removed: &ServiceName| {
            inner.outstanding.lock().remove(removed);
            inner.cond.notify_all();
        })
    }

    /// Give up on `name`, e.g. when the container refused the removal.
    pub fn abandon(&self, name: &ServiceName) {
        self.inner.outstanding.lock().remove(name);
        self.inner.cond.notify_all();
    }

    pub fn outstanding(&self) -> Vec<ServiceName> {
        self.inner.outstanding.lock().iter().cloned().collect()
    }

    /// Wait for every outstanding removal. On timeout returns the ones still pending.
    pub fn await_all(&self, timeout: Duration) -> Result<(), Vec<ServiceName>> {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.inner.outstanding.lock();
        while !outstanding.is_empty() {
            if self
                .inner
                .cond
                .wait_until(&mut outstanding, deadline)
                .timed_out()
            {
                break;
            }
        }
        if outstanding.is_empty() {
            Ok(())
        } else {
            Err(outstanding.iter().cloned().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ServiceContainer, ServiceSpec};
    use crate::mock::MockContainer;

    #[test]
    fn empty_tracker_is_done() {
        assert!(RemovalTracker::new()
            .await_all(Duration::from_millis(1))
            .is_ok());
    }

    #[test]
    fn waits_for_async_removals() {
        let c = MockContainer::new().with_delay(Duration::from_millis(10));
        let tracker = RemovalTracker::new();
        for name in ["a", "b"] {
            c.add_service(ServiceSpec::new(name)).unwrap();
        }
        assert!(c.wait_quiescent(Duration::from_secs(5)));
        for name in ["a", "b"] {
            let name = ServiceName::new(name);
            c.remove_service(&name, tracker.begin(&name)).unwrap();
        }
        assert!(tracker.await_all(Duration::from_secs(5)).is_ok());
        assert!(c.services().is_empty());
    }

    #[test]
    fn timeout_reports_stragglers() {
        let c = MockContainer::new();
        c.add_service(ServiceSpec::new("a")).unwrap();
        assert!(c.wait_quiescent(Duration::from_secs(5)));
        c.hang_on_remove("a");
        let tracker = RemovalTracker::new();
        let name = ServiceName::new("a");
        c.remove_service(&name, tracker.begin(&name)).unwrap();
        assert_eq!(
            tracker.await_all(Duration::from_millis(20)),
            Err(vec![name.clone()])
        );
        c.release(&name);
        assert!(tracker.await_all(Duration::from_secs(5)).is_ok());
    }
}
