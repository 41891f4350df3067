use crate::container::{RemovalListener, ServiceContainer, ServiceSpec, ServiceState};
use crate::RuntimeError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tessera_model::ServiceName;
use tracing::debug;

/// A container that settles every transition before returning.
#[derive(Default)]
pub struct LocalContainer {
    services: Mutex<BTreeMap<ServiceName, ServiceState>>,
}

impl LocalContainer {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The reason `spec` cannot start, given the current service states.
pub(crate) fn missing_dependency(
    services: &BTreeMap<ServiceName, ServiceState>,
    spec: &ServiceSpec,
) -> Option<String> {
    spec.dependencies
        .iter()
        .find(|dep| services.get(*dep) != Some(&ServiceState::Up))
        .map(|dep| format!("missing dependency '{dep}'"))
}

impl ServiceContainer for LocalContainer {
    fn name(&self) -> &'static str {
        "local"
    }

    fn add_service(&self, spec: ServiceSpec) -> Result<(), RuntimeError> {
        let mut services = self.services.lock();
        if services.contains_key(&spec.name) {
            return Err(RuntimeError::DuplicateService(spec.name.into_inner()));
        }
        let state = match missing_dependency(&services, &spec) {
            Some(reason) => ServiceState::Failed(reason),
            None => ServiceState::Up,
        };
        debug!("service {} -> {state:?}", spec.name);
        services.insert(spec.name, state);
        Ok(())
    }

    fn remove_service(
        &self,
        name: &ServiceName,
        listener: RemovalListener,
    ) -> Result<(), RuntimeError> {
        let removed = self.services.lock().remove(name);
        if removed.is_some() {
            debug!("service {name} removed");
        }
        listener(name);
        Ok(())
    }

    fn service_state(&self, name: &ServiceName) -> Option<ServiceState> {
        self.services.lock().get(name).cloned()
    }

    fn services(&self) -> Vec<ServiceName> {
        self.services.lock().keys().cloned().collect()
    }

    fn is_quiescent(&self) -> bool {
        true
    }

    fn wait_quiescent(&self, _timeout: Duration) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn add_settles_immediately() {
        let c = LocalContainer::new();
        c.add_service(ServiceSpec::new("org.tessera.db")).unwrap();
        assert_eq!(
            c.service_state(&ServiceName::new("org.tessera.db")),
            Some(ServiceState::Up)
        );
        assert!(c.is_quiescent());
    }

    #[test]
    fn missing_dependency_fails_service() {
        let c = LocalContainer::new();
        c.add_service(ServiceSpec::new("web").with_dependency("db"))
            .unwrap();
        let failed = c.failed_services();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].1.contains("db"));
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let c = LocalContainer::new();
        c.add_service(ServiceSpec::new("db")).unwrap();
        assert!(matches!(
            c.add_service(ServiceSpec::new("db")),
            Err(RuntimeError::DuplicateService(_))
        ));
    }

    #[test]
    fn remove_runs_listener() {
        let c = LocalContainer::new();
        c.add_service(ServiceSpec::new("db")).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        c.remove_service(
            &ServiceName::new("db"),
            Box::new(move |_| flag.store(true, Ordering::SeqCst)),
        )
        .unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert!(c.services().is_empty());
    }
}
