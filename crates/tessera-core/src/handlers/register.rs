use crate::context::OperationContext;
use crate::handler::{HandlerError, StepHandler, StepResult};
use serde_json::Value;
use tessera_model::Operation;
use tessera_store::ResourceRegistration;

/// Registers a resource definition at the operation's address pattern.
///
/// The definition is read from the `registration` parameter when present,
/// otherwise from the parameters themselves:
///
/// ```json
/// { "capability": "org.tessera.datasource", "dynamic": true, "service": true,
///   "requirements": { "driver": "org.tessera.driver" } }
/// ```
pub struct RegisterResourceHandler;

impl StepHandler for RegisterResourceHandler {
    fn execute(
        &mut self,
        ctx: &mut OperationContext<'_>,
        operation: &Operation,
    ) -> Result<StepResult, HandlerError> {
        let mut definition = match operation.param("registration") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(HandlerError::client(
                    "parameter 'registration' must be an object",
                ))
            }
            None => operation.parameters.clone(),
        };
        definition.insert(
            "pattern".to_owned(),
            Value::String(operation.address.to_string()),
        );
        let registration: ResourceRegistration = serde_json::from_value(Value::Object(definition))
            .map_err(|e| HandlerError::client(format!("invalid resource definition: {e}")))?;
        ctx.registrations_mut()?.register(registration)?;
        Ok(StepResult::Ok)
    }
}
