//! Builtin management operations and the registry that resolves names to handlers.

mod add;
mod composite;
mod read;
mod register;
mod remove;
mod write_attribute;

pub use add::AddHandler;
pub use composite::CompositeHandler;
pub use read::ReadResourceHandler;
pub use register::RegisterResourceHandler;
pub use remove::RemoveHandler;
pub use write_attribute::WriteAttributeHandler;

use crate::context::OperationContext;
use crate::handler::{HandlerError, StepHandler, StepResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tessera_model::{Operation, OperationName, PathAddress, ServiceName};
use tessera_runtime::ServiceSpec;
use tessera_store::{CapabilityContext, CapabilityRegistry, RegistrationTree, ResourceRegistration};

pub const ADD: &str = "add";
pub const REMOVE: &str = "remove";
pub const WRITE_ATTRIBUTE: &str = "write-attribute";
pub const READ_RESOURCE: &str = "read-resource";
pub const REGISTER_RESOURCE: &str = "register-resource";
pub const COMPOSITE: &str = "composite";

type HandlerFactory = Arc<dyn Fn() -> Box<dyn StepHandler> + Send + Sync>;

/// Operation name to a factory producing a fresh handler per execution.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    factories: BTreeMap<OperationName, HandlerFactory>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ADD, || Box::new(AddHandler));
        registry.register(REMOVE, || Box::new(RemoveHandler));
        registry.register(WRITE_ATTRIBUTE, || Box::new(WriteAttributeHandler));
        registry.register(READ_RESOURCE, || Box::new(ReadResourceHandler));
        registry.register(REGISTER_RESOURCE, || Box::new(RegisterResourceHandler));
        registry.register(COMPOSITE, || Box::new(CompositeHandler));
        registry
    }

    /// Register or replace the handler for `name`.
    pub fn register<F>(&mut self, name: impl Into<OperationName>, factory: F)
    where
        F: Fn() -> Box<dyn StepHandler> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn resolve(&self, name: &OperationName) -> Option<Box<dyn StepHandler>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &OperationName) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &OperationName> {
        self.factories.keys()
    }

    /// The handler for `name`, or one that fails the step as unknown.
    pub(crate) fn resolve_or_unknown(&self, name: &OperationName) -> Box<dyn StepHandler> {
        self.resolve(name).unwrap_or_else(|| Box::new(UnknownOperation))
    }
}

/// Fails with a client error naming the unresolved operation.
pub(crate) struct UnknownOperation;

impl StepHandler for UnknownOperation {
    fn execute(
        &mut self,
        _: &mut OperationContext<'_>,
        operation: &Operation,
    ) -> Result<StepResult, HandlerError> {
        Err(HandlerError::client(format!(
            "unknown operation '{}'",
            operation.name
        )))
    }
}

fn definition_for(
    registrations: &RegistrationTree,
    address: &PathAddress,
) -> Result<ResourceRegistration, HandlerError> {
    registrations
        .resolve(address)
        .cloned()
        .ok_or_else(|| HandlerError::client(format!("no resource definition matches {address}")))
}

/// Name of the service installed for a resource: its capability, else its address.
fn service_name(registration: &ResourceRegistration, address: &PathAddress) -> ServiceName {
    registration.capability_for(address).map_or_else(
        || ServiceName::new(address.to_string()),
        |capability| ServiceName::from(&capability),
    )
}

/// Key naming the dependent side of the requirements a resource declares.
fn dependent_name(registration: &ResourceRegistration, address: &PathAddress) -> String {
    registration
        .capability_for(address)
        .map_or_else(|| address.to_string(), |capability| capability.to_string())
}

/// The service a resource installs, depending on the services of the
/// capabilities its attribute values refer to.
fn service_spec(
    registration: &ResourceRegistration,
    address: &PathAddress,
    model: &serde_json::Map<String, serde_json::Value>,
    registrations: &RegistrationTree,
    capabilities: &CapabilityRegistry,
) -> ServiceSpec {
    let context = CapabilityContext::for_address(address);
    let mut spec = ServiceSpec::new(service_name(registration, address));
    for (attribute, value) in model {
        let Some(required) = value
            .as_str()
            .and_then(|value| registration.requirement_for(attribute, value))
        else {
            continue;
        };
        let installs_service = capabilities
            .providers(&required, &context)
            .any(|point| {
                registrations
                    .resolve(&point.address)
                    .is_some_and(|provider| provider.service)
            });
        if installs_service {
            spec = spec.with_dependency(ServiceName::from(&required));
        }
    }
    spec
}
