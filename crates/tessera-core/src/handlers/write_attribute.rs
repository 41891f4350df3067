use crate::collaborators::Notification;
use crate::context::OperationContext;
use crate::handler::{HandlerError, StepHandler, StepResult};
use serde_json::{json, Value};
use tessera_model::Operation;
use tessera_store::{CapabilityContext, RegistrationPoint, RequirementKey, RestartLevel};

/// Sets (or with a null `value`, clears) one attribute, moving any
/// requirement the attribute carries to the new capability.
pub struct WriteAttributeHandler;

impl StepHandler for WriteAttributeHandler {
    fn execute(
        &mut self,
        ctx: &mut OperationContext<'_>,
        operation: &Operation,
    ) -> Result<StepResult, HandlerError> {
        let address = &operation.address;
        let name = operation
            .param_str("name")
            .ok_or_else(|| HandlerError::client("missing parameter 'name'"))?
            .to_owned();
        let value = operation.param("value").cloned().unwrap_or(Value::Null);
        if !ctx.read_resources().contains(address) {
            return Err(HandlerError::client(format!(
                "resource not found: {address}"
            )));
        }
        let registration = ctx.read_registrations().resolve(address).cloned();

        let previous = ctx
            .resources_mut()?
            .get_mut(address)
            .and_then(|resource| resource.set(&name, value.clone()));

        if let Some(registration) = registration {
            let context = CapabilityContext::for_address(address);
            let dependent = super::dependent_name(&registration, address);
            let point = RegistrationPoint::attribute(address.clone(), &name);
            let old = previous
                .as_ref()
                .and_then(Value::as_str)
                .and_then(|v| registration.requirement_for(&name, v));
            let new = value
                .as_str()
                .and_then(|v| registration.requirement_for(&name, v));
            if old != new {
                if let Some(old) = old {
                    ctx.remove_requirement(
                        &RequirementKey::new(old, dependent.clone(), context.clone()),
                        &point,
                    )?;
                }
                if let Some(new) = new {
                    ctx.register_requirement(RequirementKey::new(new, dependent, context), point)?;
                }
            }
            match registration.restart_level(&name) {
                RestartLevel::Reload => ctx.require_reload(),
                RestartLevel::Restart => ctx.require_restart(),
                RestartLevel::None => {}
            }
        }

        ctx.emit(
            Notification::new("attribute-value-written", address.clone()).with_data(json!({
                "name": name,
                "old-value": previous.unwrap_or(Value::Null),
                "new-value": value,
            })),
        );
        Ok(StepResult::Ok)
    }
}
