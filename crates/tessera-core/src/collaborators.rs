//! External collaborators consulted by the kernel: authorization, audit, notifications.

use crate::lock::TxnId;
use serde::Serialize;
use serde_json::Value;
use tessera_model::{CallerType, Operation, OperationName, Outcome, PathAddress};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessAction {
    Read,
    WriteModel,
    WriteRuntime,
}

pub trait Authorizer: Send + Sync {
    /// `Err` carries the denial reason.
    fn authorize(
        &self,
        operation: &Operation,
        address: &PathAddress,
        action: AccessAction,
    ) -> Result<(), String>;
}

#[derive(Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(
        &self,
        _operation: &Operation,
        _address: &PathAddress,
        _action: AccessAction,
    ) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub txn: TxnId,
    pub operation: OperationName,
    pub address: PathAddress,
    pub caller: CallerType,
    pub outcome: Outcome,
}

pub trait AuditLog: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Emits audit records as `info!` events on the `tessera::audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, record: &AuditRecord) {
        info!(
            target: "tessera::audit",
            txn = %record.txn,
            caller = ?record.caller,
            "{} {} -> {}",
            record.operation,
            record.address,
            record.outcome
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub address: PathAddress,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Notification {
    pub fn new(kind: impl Into<String>, address: PathAddress) -> Self {
        Self {
            kind: kind.into(),
            address,
            data: Value::Null,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

pub trait NotificationSink: Send + Sync {
    fn emit(&self, notification: &Notification);
}

#[derive(Debug, Default)]
pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn emit(&self, _notification: &Notification) {}
}
