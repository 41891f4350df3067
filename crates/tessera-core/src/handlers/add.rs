use super::{definition_for, dependent_name, service_spec};
use crate::collaborators::Notification;
use crate::context::OperationContext;
use crate::handler::{HandlerError, StepHandler, StepResult};
use crate::lifecycle::Stage;
use tessera_model::Operation;
use tessera_store::{CapabilityContext, CapabilityId, RegistrationPoint, RequirementKey, Resource};

/// Creates a resource from the operation parameters, registers what its
/// definition declares, and installs its service in RUNTIME.
pub struct AddHandler;

impl StepHandler for AddHandler {
    fn execute(
        &mut self,
        ctx: &mut OperationContext<'_>,
        operation: &Operation,
    ) -> Result<StepResult, HandlerError> {
        let address = &operation.address;
        let registration = definition_for(&ctx.read_registrations(), address)?;
        let model = operation.parameters.clone();
        ctx.resources_mut()?
            .create(address, Resource::with_model(model.clone()))?;

        let context = CapabilityContext::for_address(address);
        if let Some(name) = registration.capability_for(address) {
            ctx.register_capability(
                CapabilityId::new(name, context.clone()),
                RegistrationPoint::resource(address.clone()),
            )?;
        }
        let dependent = dependent_name(&registration, address);
        for (attribute, value) in &model {
            let Some(required) = value
                .as_str()
                .and_then(|value| registration.requirement_for(attribute, value))
            else {
                continue;
            };
            ctx.register_requirement(
                RequirementKey::new(required, dependent.clone(), context.clone()),
                RegistrationPoint::attribute(address.clone(), attribute),
            )?;
        }
        ctx.emit(Notification::new("resource-added", address.clone()));

        if registration.service {
            let address = address.clone();
            ctx.add_step(Stage::Runtime, move |ctx, _| {
                // Resolved at RUNTIME to see providers added later in MODEL.
                let spec = service_spec(
                    &registration,
                    &address,
                    &model,
                    &ctx.read_registrations(),
                    &ctx.read_capabilities(),
                );
                ctx.add_service(spec)?;
                Ok(StepResult::Ok)
            })?;
        }
        Ok(StepResult::Ok)
    }
}
