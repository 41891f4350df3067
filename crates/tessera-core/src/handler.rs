use crate::context::OperationContext;
use crate::lock::LockError;
use serde_json::Value;
use tessera_model::Operation;
use tessera_runtime::RuntimeError;
use tessera_store::StoreError;
use thiserror::Error;

/// What a handler reports back for its step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Ok,
    /// The step failed; the stage policy decides whether to roll back.
    Fail(Value),
    /// The step failed, but in RUNTIME or VERIFY the failure does not trigger
    /// rollback. Honored once per transaction; a second deferral counts as a
    /// plain failure.
    FailDeferRollback(Value),
}

impl StepResult {
    pub fn fail(description: impl Into<String>) -> Self {
        StepResult::Fail(Value::String(description.into()))
    }

    pub fn fail_defer(description: impl Into<String>) -> Self {
        StepResult::FailDeferRollback(Value::String(description.into()))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    /// Bad input. Sets the failure description and follows the stage policy.
    #[error("{}", describe(.0))]
    Client(Value),
    #[error("unexpected fault: {0}")]
    Fault(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("operation cancelled")]
    Cancelled,
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl HandlerError {
    pub fn client(message: impl Into<String>) -> Self {
        HandlerError::Client(Value::String(message.into()))
    }

    pub fn fault(message: impl Into<String>) -> Self {
        HandlerError::Fault(message.into())
    }

    pub fn description(&self) -> Value {
        match self {
            HandlerError::Client(value) => value.clone(),
            other => Value::String(other.to_string()),
        }
    }
}

impl From<LockError> for HandlerError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { .. } => HandlerError::Timeout(e.to_string()),
            LockError::Deadlock { .. } => HandlerError::client(e.to_string()),
            LockError::Cancelled(_) => HandlerError::Cancelled,
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        if e.is_client_error() {
            HandlerError::client(e.to_string())
        } else {
            HandlerError::Fault(e.to_string())
        }
    }
}

impl From<RuntimeError> for HandlerError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::ContainerUnavailable(_) => HandlerError::Fault(e.to_string()),
            _ => HandlerError::client(e.to_string()),
        }
    }
}

/// The unit of work behind a step.
pub trait StepHandler: Send {
    fn execute(
        &mut self,
        ctx: &mut OperationContext<'_>,
        operation: &Operation,
    ) -> Result<StepResult, HandlerError>;
}

pub(crate) struct FnHandler<F>(pub(crate) F);

impl<F> StepHandler for FnHandler<F>
where
    F: FnMut(&mut OperationContext<'_>, &Operation) -> Result<StepResult, HandlerError> + Send,
{
    fn execute(
        &mut self,
        ctx: &mut OperationContext<'_>,
        operation: &Operation,
    ) -> Result<StepResult, HandlerError> {
        (self.0)(ctx, operation)
    }
}
