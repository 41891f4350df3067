use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tessera_model::ServiceName;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Up,
    Failed(String),
    Removing,
}

impl ServiceState {
    pub fn is_settled(&self) -> bool {
        matches!(self, ServiceState::Up | ServiceState::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: ServiceName,
    pub dependencies: Vec<ServiceName>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<ServiceName>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_dependency(mut self, dependency: impl Into<ServiceName>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

/// Called once the container has fully removed a service.
pub type RemovalListener = Box<dyn FnOnce(&ServiceName) + Send>;

/// A registry of installed services whose transitions may complete asynchronously.
pub trait ServiceContainer: Send + Sync {
    fn name(&self) -> &str;

    /// Begin installing a service. A service whose dependencies are not up
    /// settles as `Failed`; that is reported by the state, not by this call.
    fn add_service(&self, spec: ServiceSpec) -> Result<(), RuntimeError>;

    /// Begin removing a service. `listener` runs when removal completes, or
    /// immediately if the service is not installed.
    fn remove_service(
        &self,
        name: &ServiceName,
        listener: RemovalListener,
    ) -> Result<(), RuntimeError>;

    fn service_state(&self, name: &ServiceName) -> Option<ServiceState>;

    fn services(&self) -> Vec<ServiceName>;

    /// True when no transition is in flight.
    fn is_quiescent(&self) -> bool;

    /// Block until quiescent or `timeout` elapses. Returns whether quiescence was reached.
    fn wait_quiescent(&self, timeout: Duration) -> bool;

    fn failed_services(&self) -> Vec<(ServiceName, String)> {
        self.services()
            .into_iter()
            .filter_map(|name| match self.service_state(&name) {
                Some(ServiceState::Failed(reason)) => Some((name, reason)),
                _ => None,
            })
            .collect()
    }
}

pub fn select_container(name: &str) -> Result<Arc<dyn ServiceContainer>, RuntimeError> {
    match name {
        "local" => Ok(Arc::new(crate::local::LocalContainer::new())),
        "mock" => Ok(Arc::new(crate::mock::MockContainer::new())),
        other => Err(RuntimeError::ContainerUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_containers() {
        assert_eq!(select_container("local").unwrap().name(), "local");
        assert_eq!(select_container("mock").unwrap().name(), "mock");
    }

    #[test]
    fn select_invalid_container_fails() {
        assert!(matches!(
            select_container("nonexistent"),
            Err(RuntimeError::ContainerUnavailable(_))
        ));
    }

    #[test]
    fn settled_states() {
        assert!(ServiceState::Up.is_settled());
        assert!(ServiceState::Failed("x".to_owned()).is_settled());
        assert!(!ServiceState::Starting.is_settled());
        assert!(!ServiceState::Removing.is_settled());
    }
}
