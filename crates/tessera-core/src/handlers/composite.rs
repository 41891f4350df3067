use crate::context::OperationContext;
use crate::handler::{HandlerError, StepHandler, StepResult};
use crate::lifecycle::{ResultAction, Stage};
use serde_json::{Map, Value};
use tessera_model::Operation;

/// Runs the operations in `steps` as one transaction, ahead of anything
/// else queued for MODEL, and reports each under `step-N`.
pub struct CompositeHandler;

impl StepHandler for CompositeHandler {
    fn execute(
        &mut self,
        ctx: &mut OperationContext<'_>,
        operation: &Operation,
    ) -> Result<StepResult, HandlerError> {
        let steps = operation
            .param("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| HandlerError::client("composite requires a 'steps' array"))?;
        let children = steps
            .iter()
            .map(|step| serde_json::from_value::<Operation>(step.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HandlerError::client(format!("invalid composite step: {e}")))?;

        // Pushed to the front in reverse so they run in declaration order.
        let mut responses = Vec::with_capacity(children.len());
        for child in children.into_iter().rev() {
            let handler = ctx.resolve_handler(&child.name);
            let handler = handler.unwrap_or_else(|| Box::new(super::UnknownOperation));
            responses.push(ctx.add_child_step(Stage::Model, child, handler, true)?);
        }
        responses.reverse();

        ctx.complete_step(move |rctx, action| {
            let mut result = Map::new();
            let mut failures = Map::new();
            for (index, id) in responses.iter().enumerate() {
                let key = format!("step-{}", index + 1);
                let Some(mut response) = rctx.response(*id).cloned() else {
                    continue;
                };
                response.rolled_back = action == ResultAction::Rollback;
                if let Some(failure) = &response.failure_description {
                    failures.insert(key.clone(), failure.clone());
                }
                let value = serde_json::to_value(&response)
                    .map_err(|e| HandlerError::fault(e.to_string()))?;
                result.insert(key, value);
            }
            let response = rctx.response_mut();
            response.result = Value::Object(result);
            if !failures.is_empty() {
                response.fail(Value::Object(failures));
            }
            Ok(())
        });
        Ok(StepResult::Ok)
    }
}
