//! Copy-on-write stores for the Tessera execution kernel.
//!
//! This crate provides the three independently mutable stores an operation
//! transaction reads and writes: the `ResourceTree` (configuration model), the
//! `RegistrationTree` (resource definitions keyed by address pattern), and the
//! `CapabilityRegistry` (capabilities and the requirements declared on them).
//! `Snapshot` bundles them immutably, `SnapshotHandle` publishes a new bundle
//! with a single compare-and-swap, and `TransactionSnapshot` clones a store on
//! its first write within a transaction. `persist` writes committed trees to disk.

pub mod capability;
pub mod persist;
pub mod registration;
pub mod resource;
pub mod snapshot;

pub use capability::{
    CapabilityContext, CapabilityId, CapabilityRegistry, RegistrationPoint, RequirementKey,
};
pub use persist::{
    ConfigurationPersister, JsonFilePersister, NullPersister, PersistenceResource,
    CONFIG_FORMAT_VERSION,
};
pub use registration::{RegistrationTree, ResourceRegistration, RestartLevel};
pub use resource::{Resource, ResourceTree};
pub use snapshot::{Modified, ModifiedParts, Snapshot, SnapshotHandle, TransactionSnapshot};

use std::path::Path;
use tessera_model::PathAddress;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("resource not found: {0}")]
    ResourceNotFound(PathAddress),
    #[error("duplicate resource: {0}")]
    DuplicateResource(PathAddress),
    #[error("parent of {0} does not exist")]
    ParentNotFound(PathAddress),
    #[error("resource {0} has children")]
    HasChildren(PathAddress),
    #[error("the root resource cannot be created or removed")]
    RootImmutable,
    #[error("a resource definition is already registered at {0}")]
    DuplicateRegistration(PathAddress),
    #[error("stale snapshot publish: expected version {expected}, found {found}")]
    StalePublish { expected: u64, found: u64 },
    #[error("integrity check failed for '{path}': expected {expected}, got {actual}")]
    IntegrityFailure {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("configuration format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
}

impl StoreError {
    /// Errors caused by the caller's input rather than by the store itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::ResourceNotFound(_)
                | StoreError::DuplicateResource(_)
                | StoreError::ParentNotFound(_)
                | StoreError::HasChildren(_)
                | StoreError::RootImmutable
                | StoreError::DuplicateRegistration(_)
        )
    }
}
