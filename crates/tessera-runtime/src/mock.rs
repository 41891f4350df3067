use crate::container::{RemovalListener, ServiceContainer, ServiceSpec, ServiceState};
use crate::local::missing_dependency;
use crate::RuntimeError;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_model::ServiceName;
use tracing::debug;

#[derive(Default)]
struct MockState {
    services: BTreeMap<ServiceName, ServiceState>,
    pending: usize,
    hang_on_start: BTreeSet<ServiceName>,
    hang_on_remove: BTreeSet<ServiceName>,
    fail_on_start: BTreeSet<ServiceName>,
    hung_starts: BTreeSet<ServiceName>,
    hung_removals: BTreeMap<ServiceName, RemovalListener>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<MockState>,
    cond: Condvar,
}

/// A container whose transitions complete on background threads.
pub struct MockContainer {
    shared: Arc<Shared>,
    delay: Duration,
}

impl Default for MockContainer {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            delay: Duration::from_millis(5),
        }
    }
}

impl MockContainer {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Services with this name stay `Starting` until [`release`](Self::release).
    pub fn hang_on_start(&self, name: impl Into<ServiceName>) {
        self.shared.state.lock().hang_on_start.insert(name.into());
    }

    /// Removals of this service never complete until [`release`](Self::release).
    pub fn hang_on_remove(&self, name: impl Into<ServiceName>) {
        self.shared.state.lock().hang_on_remove.insert(name.into());
    }

    pub fn fail_on_start(&self, name: impl Into<ServiceName>) {
        self.shared.state.lock().fail_on_start.insert(name.into());
    }

    /// Complete a hung transition for `name`.
    pub fn release(&self, name: &ServiceName) {
        let listener = {
            let mut state = self.shared.state.lock();
            state.hang_on_start.remove(name);
            state.hang_on_remove.remove(name);
            if state.hung_starts.remove(name) {
                state.services.insert(name.clone(), ServiceState::Up);
                state.pending -= 1;
            }
            let listener = state.hung_removals.remove(name);
            if listener.is_some() {
                state.services.remove(name);
                state.pending -= 1;
            }
            self.shared.cond.notify_all();
            listener
        };
        if let Some(listener) = listener {
            listener(name);
        }
    }

    fn spawn_start(&self, spec: ServiceSpec) {
        let shared = Arc::clone(&self.shared);
        let delay = self.delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let mut state = shared.state.lock();
            if state.services.get(&spec.name) == Some(&ServiceState::Starting) {
                let settled = if state.fail_on_start.contains(&spec.name) {
                    ServiceState::Failed("start failed".to_owned())
                } else {
                    match missing_dependency(&state.services, &spec) {
                        Some(reason) => ServiceState::Failed(reason),
                        None => ServiceState::Up,
                    }
                };
                debug!("mock service {} -> {settled:?}", spec.name);
                state.services.insert(spec.name, settled);
            }
            state.pending -= 1;
            shared.cond.notify_all();
        });
    }

    fn spawn_remove(&self, name: ServiceName, listener: RemovalListener) {
        let shared = Arc::clone(&self.shared);
        let delay = self.delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            {
                let mut state = shared.state.lock();
                state.services.remove(&name);
                state.pending -= 1;
                shared.cond.notify_all();
            }
            debug!("mock service {name} removed");
            listener(&name);
        });
    }
}

impl ServiceContainer for MockContainer {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn add_service(&self, spec: ServiceSpec) -> Result<(), RuntimeError> {
        let mut state = self.shared.state.lock();
        match state.services.get(&spec.name) {
            Some(ServiceState::Removing) => {
                return Err(RuntimeError::RemovalInProgress(spec.name.into_inner()))
            }
            Some(_) => return Err(RuntimeError::DuplicateService(spec.name.into_inner())),
            None => {}
        }
        state
            .services
            .insert(spec.name.clone(), ServiceState::Starting);
        state.pending += 1;
        if state.hang_on_start.contains(&spec.name) {
            state.hung_starts.insert(spec.name);
            return Ok(());
        }
        drop(state);
        self.spawn_start(spec);
        Ok(())
    }

    fn remove_service(
        &self,
        name: &ServiceName,
        listener: RemovalListener,
    ) -> Result<(), RuntimeError> {
        let mut state = self.shared.state.lock();
        match state.services.get(name) {
            None => {
                drop(state);
                listener(name);
                return Ok(());
            }
            Some(ServiceState::Removing) => {
                return Err(RuntimeError::RemovalInProgress(name.to_string()))
            }
            Some(_) => {}
        }
        if state.hung_starts.remove(name) {
            state.pending -= 1;
        }
        state.services.insert(name.clone(), ServiceState::Removing);
        state.pending += 1;
        if state.hang_on_remove.contains(name) {
            state.hung_removals.insert(name.clone(), listener);
            return Ok(());
        }
        drop(state);
        self.spawn_remove(name.clone(), listener);
        Ok(())
    }

    fn service_state(&self, name: &ServiceName) -> Option<ServiceState> {
        self.shared.state.lock().services.get(name).cloned()
    }

    fn services(&self) -> Vec<ServiceName> {
        self.shared.state.lock().services.keys().cloned().collect()
    }

    fn is_quiescent(&self) -> bool {
        self.shared.state.lock().pending == 0
    }

    fn wait_quiescent(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.pending > 0 {
            if self
                .shared
                .cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.pending == 0;
            }
        }
        true
    }
}
