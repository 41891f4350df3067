use crate::address::PathAddress;
use crate::types::OperationName;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Who submitted an operation. Internal callers bypass nothing in the kernel
/// itself but are reported to authorization and audit collaborators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallerType {
    #[default]
    User,
    Internal,
}

const fn default_true() -> bool {
    true
}

/// Cross-cutting operation flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OperationHeaders {
    /// Roll back the whole transaction when a RUNTIME or VERIFY step fails.
    #[serde(default = "default_true")]
    pub rollback_on_runtime_failure: bool,
    #[serde(default)]
    pub caller_type: CallerType,
    /// Routing id used by multi-process coordinating controllers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_uuid: Option<String>,
    /// Per-operation override of the blocking timeout, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_timeout: Option<u64>,
}

impl Default for OperationHeaders {
    fn default() -> Self {
        Self {
            rollback_on_runtime_failure: true,
            caller_type: CallerType::User,
            domain_uuid: None,
            blocking_timeout: None,
        }
    }
}

impl OperationHeaders {
    pub fn blocking_timeout(&self) -> Option<Duration> {
        self.blocking_timeout.map(Duration::from_secs)
    }
}

/// An immutable request: name, target address, parameters, and headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "operation")]
    pub name: OperationName,
    #[serde(default)]
    pub address: PathAddress,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub headers: OperationHeaders,
}

impl Operation {
    pub fn new(name: impl Into<OperationName>, address: PathAddress) -> Self {
        Self {
            name: name.into(),
            address,
            parameters: Map::new(),
            headers: OperationHeaders::default(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_owned(), value.into());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: OperationHeaders) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn rollback_on_runtime_failure(mut self, enabled: bool) -> Self {
        self.headers.rollback_on_runtime_failure = enabled;
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.parameters.get(key).and_then(Value::as_bool)
    }
}
