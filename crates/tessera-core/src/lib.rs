//! Staged transactional execution kernel for Tessera.
//!
//! This crate runs operations against the copy-on-write stores of
//! `tessera-store` and the service container of `tessera-runtime`. Every
//! operation becomes a transaction whose steps execute through the fixed
//! MODEL, RUNTIME, VERIFY, DOMAIN stage sequence. Writers serialize on the
//! `LockCoordinator`; the capability validator gates the MODEL exit and the
//! stability gate gates entry into VERIFY. Finalization walks the executed
//! steps in reverse, then publishes or discards the snapshot as one unit.

pub mod active;
pub mod boot;
pub mod collaborators;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod engine;
pub mod handler;
pub mod handlers;
pub mod lifecycle;
pub mod lock;
mod rollback;
mod scheduler;
mod stability;
pub mod step;
mod transaction;
pub mod validator;

pub use active::{ActiveOperation, OperationId};
pub use boot::operations_from_tree;
pub use collaborators::{
    AccessAction, AllowAll, AuditLog, AuditRecord, Authorizer, Notification, NotificationSink,
    NullNotificationSink, TracingAuditLog,
};
pub use concurrency::{install_signal_handler, shutdown_requested, CancellationToken};
pub use config::KernelConfig;
pub use context::{OperationContext, ResultContext};
pub use engine::{Engine, EngineBuilder};
pub use handler::{HandlerError, StepHandler, StepResult};
pub use handlers::OperationRegistry;
pub use lifecycle::{
    validate_stage_transition, ProcessState, ProcessStatus, ResultAction, RunningState, Stage,
};
pub use lock::{LockCoordinator, LockError, LockMode, TxnId};
pub use step::{ResponseId, StepId};
pub use validator::{CapabilityValidator, Unsatisfied};

use tessera_model::Response;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("model error: {0}")]
    Model(#[from] tessera_model::ModelError),
    #[error("store error: {0}")]
    Store(#[from] tessera_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] tessera_runtime::RuntimeError),
    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("unexpected handler fault: {message}")]
    HandlerFault {
        message: String,
        response: Box<Response>,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// The finalized response carried by a handler fault.
    pub fn response(&self) -> Option<&Response> {
        match self {
            CoreError::HandlerFault { response, .. } => Some(response),
            _ => None,
        }
    }
}
