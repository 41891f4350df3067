use super::{definition_for, service_spec};
use crate::collaborators::Notification;
use crate::context::OperationContext;
use crate::handler::{HandlerError, StepHandler, StepResult};
use crate::lifecycle::{ResultAction, Stage};
use tessera_model::Operation;
use tracing::warn;

/// Removes a childless resource and everything registered at its address,
/// then removes its service in RUNTIME. Rollback reinstalls the service.
pub struct RemoveHandler;

impl StepHandler for RemoveHandler {
    fn execute(
        &mut self,
        ctx: &mut OperationContext<'_>,
        operation: &Operation,
    ) -> Result<StepResult, HandlerError> {
        let address = operation.address.clone();
        let registration = definition_for(&ctx.read_registrations(), &address)?;
        // Captured before removal, for reinstalling on rollback.
        let spec = registration.service.then(|| {
            let model = ctx
                .read_resources()
                .get(&address)
                .map(|resource| resource.model.clone())
                .unwrap_or_default();
            service_spec(
                &registration,
                &address,
                &model,
                &ctx.read_registrations(),
                &ctx.read_capabilities(),
            )
        });

        ctx.resources_mut()?.remove(&address)?;
        ctx.remove_capabilities_at(&address)?;
        ctx.emit(Notification::new("resource-removed", address.clone()));

        let Some(spec) = spec else {
            return Ok(StepResult::Ok);
        };
        ctx.add_step(Stage::Runtime, move |ctx, _| {
            if ctx.container().service_state(&spec.name).is_none() {
                return Ok(StepResult::Ok);
            }
            ctx.remove_service(&spec.name)?;
            let spec = spec.clone();
            ctx.complete_step(move |rctx, action| {
                if action != ResultAction::Rollback {
                    return Ok(());
                }
                let container = rctx.container();
                if !container.wait_quiescent(rctx.config().removal_timeout()) {
                    warn!("reinstalling {} before its removal settled", spec.name);
                }
                container.add_service(spec)?;
                Ok(())
            });
            Ok(StepResult::Ok)
        })?;
        Ok(StepResult::Ok)
    }
}
