//! Value types shared by every Tessera layer.
//!
//! This crate defines the vocabulary of the management kernel: hierarchical
//! resource addresses (`PathAddress`), the immutable `Operation` input with its
//! cross-cutting `OperationHeaders`, the stable `Response` contract produced for
//! every executed operation, and string newtypes for operation, capability, and
//! service names. Model values are plain `serde_json::Value` trees.

pub mod address;
pub mod operation;
pub mod response;
pub mod types;

pub use address::{PathAddress, PathElement, WILDCARD};
pub use operation::{CallerType, Operation, OperationHeaders};
pub use response::{Outcome, Response, ResponseHeaders};
pub use types::{CapabilityName, OperationName, ServiceName};

use thiserror::Error;

/// A detyped model value: attributes, parameters, and results.
pub type ModelNode = serde_json::Value;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid address '{input}': {reason}")]
    InvalidAddress { input: String, reason: String },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
