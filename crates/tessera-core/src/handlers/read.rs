use crate::context::OperationContext;
use crate::handler::{HandlerError, StepHandler, StepResult};
use tessera_model::Operation;

/// Reports a resource's model. `recursive` includes descendants.
pub struct ReadResourceHandler;

impl StepHandler for ReadResourceHandler {
    fn execute(
        &mut self,
        ctx: &mut OperationContext<'_>,
        operation: &Operation,
    ) -> Result<StepResult, HandlerError> {
        let recursive = operation.param_bool("recursive").unwrap_or(false);
        let value = ctx
            .read_resources()
            .to_json(&operation.address, recursive)
            .ok_or_else(|| {
                HandlerError::client(format!("resource not found: {}", operation.address))
            })?;
        ctx.set_result(value);
        Ok(StepResult::Ok)
    }
}
