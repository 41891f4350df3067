//! Service runtime layer for the Tessera execution kernel.
//!
//! Operations in the RUNTIME stage install and remove services through a
//! pluggable `ServiceContainer`. `LocalContainer` applies changes synchronously;
//! `MockContainer` applies them on background threads and can be told to hang,
//! which is what the stability and removal timeouts are tested against.
//! `RemovalTracker` lets rollback wait for a batch of asynchronous removals.

pub mod container;
pub mod local;
pub mod mock;
pub mod removal;

pub use container::{
    select_container, RemovalListener, ServiceContainer, ServiceSpec, ServiceState,
};
pub use local::LocalContainer;
pub use mock::MockContainer;
pub use removal::RemovalTracker;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container '{0}' is not available")]
    ContainerUnavailable(String),
    #[error("service '{0}' is already installed")]
    DuplicateService(String),
    #[error("service '{0}' is not installed")]
    ServiceNotFound(String),
    #[error("service '{0}' is still being removed")]
    RemovalInProgress(String),
}
