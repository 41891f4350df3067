use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tessera_core::handlers::RemoveHandler;
use tessera_core::{
    AccessAction, AuditLog, AuditRecord, Authorizer, Engine, KernelConfig, Notification,
    NotificationSink, RunningState, Stage, StepHandler, StepResult,
};
use tessera_model::{Operation, Outcome, PathAddress, ServiceName};
use tessera_runtime::ServiceState;

fn addr(s: &str) -> PathAddress {
    PathAddress::parse(s).unwrap()
}

fn engine() -> Engine {
    let engine = Engine::new(KernelConfig::default()).unwrap();
    define(&engine);
    engine
}

/// `/subsystem=web` with `listener=*` children that install services
/// depending on a `socket` capability.
fn define(engine: &Engine) {
    let definitions = [
        Operation::new("register-resource", addr("/subsystem=web")),
        Operation::new("register-resource", addr("/socket=*")).with_param(
            "registration",
            json!({ "capability": "org.tessera.socket", "dynamic": true, "service": true }),
        ),
        Operation::new("register-resource", addr("/subsystem=web/listener=*")).with_param(
            "registration",
            json!({
                "capability": "org.tessera.listener",
                "dynamic": true,
                "service": true,
                "requirements": { "socket": "org.tessera.socket" },
                "attributes": { "max-connections": "reload", "protocol": "restart" },
            }),
        ),
    ];
    for definition in definitions {
        let response = engine.execute(definition).unwrap();
        assert!(response.is_success(), "{response:?}");
    }
}

fn add(address: &str) -> Operation {
    Operation::new("add", addr(address))
}

#[test]
fn add_then_read_recursive() {
    let engine = engine();
    assert!(engine.execute(add("/subsystem=web")).unwrap().is_success());
    assert!(engine.execute(add("/socket=http")).unwrap().is_success());
    let response = engine
        .execute(add("/subsystem=web/listener=default").with_param("socket", "http"))
        .unwrap();
    assert!(response.is_success(), "{response:?}");

    let response = engine
        .execute(
            Operation::new("read-resource", addr("/subsystem=web")).with_param("recursive", true),
        )
        .unwrap();
    assert_eq!(response.result["listener"]["default"]["socket"], "http");
    assert_eq!(
        engine.read_resource(&addr("/subsystem=web/listener=default"), false),
        Some(json!({ "socket": "http" }))
    );
}

#[test]
fn add_installs_services_with_dependencies() {
    let engine = engine();
    engine.execute(add("/subsystem=web")).unwrap();
    engine.execute(add("/socket=http")).unwrap();
    engine
        .execute(add("/subsystem=web/listener=default").with_param("socket", "http"))
        .unwrap();
    let container = engine.container();
    assert_eq!(
        container.service_state(&ServiceName::new("org.tessera.socket.http")),
        Some(ServiceState::Up)
    );
    assert_eq!(
        container.service_state(&ServiceName::new("org.tessera.listener.default")),
        Some(ServiceState::Up)
    );
}

#[test]
fn add_failures_are_client_errors() {
    let engine = engine();
    let response = engine.execute(add("/undefined=x")).unwrap();
    assert!(response.rolled_back);
    assert!(response
        .failure_message()
        .unwrap()
        .contains("no resource definition matches"));

    // Parent missing.
    let response = engine.execute(add("/subsystem=web/listener=a")).unwrap();
    assert!(response.rolled_back);

    engine.execute(add("/subsystem=web")).unwrap();
    let response = engine.execute(add("/subsystem=web")).unwrap();
    assert!(response.rolled_back);
    assert_eq!(response.outcome, Outcome::Failed);
}

#[test]
fn unknown_operation_rolls_back() {
    let engine = engine();
    let response = engine
        .execute(Operation::new("reboot-now", PathAddress::root()))
        .unwrap();
    assert!(response.rolled_back);
    assert_eq!(
        response.failure_message().unwrap(),
        "unknown operation 'reboot-now'"
    );
}

#[test]
fn remove_requires_a_childless_resource() {
    let engine = engine();
    engine.execute(add("/subsystem=web")).unwrap();
    engine.execute(add("/socket=http")).unwrap();
    engine
        .execute(add("/subsystem=web/listener=default").with_param("socket", "http"))
        .unwrap();

    let response = engine
        .execute(Operation::new("remove", addr("/subsystem=web")))
        .unwrap();
    assert!(response.rolled_back);
    assert!(engine.read_resource(&addr("/subsystem=web"), false).is_some());

    let response = engine
        .execute(Operation::new("remove", addr("/subsystem=web/listener=default")))
        .unwrap();
    assert!(response.is_success(), "{response:?}");
    assert!(engine
        .container()
        .service_state(&ServiceName::new("org.tessera.listener.default"))
        .is_none());
}

#[test]
fn removing_a_required_capability_fails() {
    let engine = engine();
    engine.execute(add("/subsystem=web")).unwrap();
    engine.execute(add("/socket=http")).unwrap();
    engine
        .execute(add("/subsystem=web/listener=default").with_param("socket", "http"))
        .unwrap();
    let response = engine
        .execute(Operation::new("remove", addr("/socket=http")))
        .unwrap();
    assert!(response.rolled_back);
    assert!(engine.read_resource(&addr("/socket=http"), false).is_some());
}

#[test]
fn rolled_back_removal_reinstalls_the_service() {
    let engine = engine();
    engine.execute(add("/socket=http")).unwrap();
    let name = ServiceName::new("org.tessera.socket.http");
    assert_eq!(engine.container().service_state(&name), Some(ServiceState::Up));

    let response = engine
        .execute_with(Operation::new("remove", addr("/socket=http")), |ctx, op| {
            let result = RemoveHandler.execute(ctx, op)?;
            ctx.add_step(Stage::Verify, |_, _| Ok(StepResult::fail("verification failed")))?;
            Ok(result)
        })
        .unwrap();
    assert!(response.rolled_back);
    assert_eq!(engine.container().service_state(&name), Some(ServiceState::Up));
    assert!(engine.read_resource(&addr("/socket=http"), false).is_some());
}

#[test]
fn write_attribute_swaps_requirements() {
    let engine = engine();
    engine.execute(add("/subsystem=web")).unwrap();
    engine.execute(add("/socket=http")).unwrap();
    engine.execute(add("/socket=https")).unwrap();
    engine
        .execute(add("/subsystem=web/listener=default").with_param("socket", "http"))
        .unwrap();

    let write = Operation::new("write-attribute", addr("/subsystem=web/listener=default"))
        .with_param("name", "socket")
        .with_param("value", "https");
    assert!(engine.execute(write).unwrap().is_success());

    // The old socket is no longer required, the new one is.
    assert!(engine
        .execute(Operation::new("remove", addr("/socket=http")))
        .unwrap()
        .is_success());
    assert!(engine
        .execute(Operation::new("remove", addr("/socket=https")))
        .unwrap()
        .rolled_back);
}

#[test]
fn write_attribute_sets_reload_and_restart_flags() {
    let engine = engine();
    engine.execute(add("/subsystem=web")).unwrap();
    engine.execute(add("/socket=http")).unwrap();
    engine
        .execute(add("/subsystem=web/listener=default").with_param("socket", "http"))
        .unwrap();

    let response = engine
        .execute(
            Operation::new("write-attribute", addr("/subsystem=web/listener=default"))
                .with_param("name", "max-connections")
                .with_param("value", 100),
        )
        .unwrap();
    assert!(response.response_headers.requires_reload);
    assert!(!response.response_headers.requires_restart);
    assert_eq!(engine.process_state().state, RunningState::ReloadRequired);

    // Rolled back: the restart flag this transaction set is reverted.
    let composite = Operation::new("composite", PathAddress::root()).with_param(
        "steps",
        json!([
            {
                "operation": "write-attribute",
                "address": "/subsystem=web/listener=default",
                "parameters": { "name": "protocol", "value": "h2" },
            },
            { "operation": "add", "address": "/undefined=x" },
        ]),
    );
    let response = engine.execute(composite).unwrap();
    assert!(response.rolled_back);
    assert!(!response.response_headers.requires_restart);
    assert_eq!(engine.process_state().state, RunningState::ReloadRequired);
}

#[test]
fn write_attribute_null_undefines() {
    let engine = engine();
    engine.execute(add("/socket=http").with_param("port", 80)).unwrap();
    let response = engine
        .execute(
            Operation::new("write-attribute", addr("/socket=http"))
                .with_param("name", "port")
                .with_param("value", Value::Null),
        )
        .unwrap();
    assert!(response.is_success());
    assert_eq!(
        engine.read_resource(&addr("/socket=http"), false),
        Some(json!({}))
    );
}

#[test]
fn composite_reports_each_step_in_order() {
    let engine = engine();
    let composite = Operation::new("composite", PathAddress::root()).with_param(
        "steps",
        json!([
            { "operation": "add", "address": "/subsystem=web" },
            { "operation": "add", "address": "/socket=http" },
            { "operation": "read-resource", "address": "/subsystem=web" },
        ]),
    );
    let response = engine.execute(composite).unwrap();
    assert!(response.is_success(), "{response:?}");
    let result = response.result.as_object().unwrap();
    assert_eq!(result.len(), 3);
    assert_eq!(result["step-1"]["outcome"], "success");
    assert_eq!(result["step-3"]["result"], json!({}));
}

#[test]
fn composite_failure_marks_every_step_rolled_back() {
    let engine = engine();
    let composite = Operation::new("composite", PathAddress::root()).with_param(
        "steps",
        json!([
            { "operation": "add", "address": "/subsystem=web" },
            { "operation": "add", "address": "/subsystem=web" },
        ]),
    );
    let response = engine.execute(composite).unwrap();
    assert!(response.rolled_back);
    assert_eq!(response.result["step-1"]["rolled-back"], true);
    assert_eq!(response.result["step-2"]["rolled-back"], true);
    let failures = response.failure_description.unwrap();
    assert!(failures.get("step-1").is_none());
    assert!(failures.get("step-2").is_some());
    assert!(engine.read_resource(&addr("/subsystem=web"), false).is_none());
}

#[test]
fn composite_rejects_malformed_steps() {
    let engine = engine();
    let response = engine
        .execute(Operation::new("composite", PathAddress::root()).with_param("steps", 3))
        .unwrap();
    assert!(response.rolled_back);
    assert!(response.failure_message().unwrap().contains("'steps' array"));
}

#[derive(Default)]
struct Recorder {
    notifications: Mutex<Vec<String>>,
    audit: Mutex<Vec<AuditRecord>>,
}

impl NotificationSink for Recorder {
    fn emit(&self, notification: &Notification) {
        self.notifications.lock().push(notification.kind.clone());
    }
}

impl AuditLog for Recorder {
    fn record(&self, record: &AuditRecord) {
        self.audit.lock().push(record.clone());
    }
}

#[test]
fn notifications_and_audit_flush_only_on_keep() {
    let recorder = Arc::new(Recorder::default());
    let engine = Engine::builder(KernelConfig::default())
        .notification_sink(Arc::clone(&recorder) as Arc<dyn NotificationSink>)
        .audit_log(Arc::clone(&recorder) as Arc<dyn AuditLog>)
        .build()
        .unwrap();
    define(&engine);
    recorder.audit.lock().clear();

    engine.execute(add("/socket=http")).unwrap();
    assert_eq!(*recorder.notifications.lock(), vec!["resource-added".to_owned()]);
    let audit = recorder.audit.lock().clone();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].operation, "add");
    assert_eq!(audit[0].address, addr("/socket=http"));

    let response = engine.execute(add("/socket=http")).unwrap();
    assert!(response.rolled_back);
    assert_eq!(recorder.notifications.lock().len(), 1);
    assert_eq!(recorder.audit.lock().len(), 1);
}

struct ReadOnly;

impl Authorizer for ReadOnly {
    fn authorize(
        &self,
        _: &Operation,
        _: &PathAddress,
        action: AccessAction,
    ) -> Result<(), String> {
        match action {
            AccessAction::Read => Ok(()),
            _ => Err("read-only caller".to_owned()),
        }
    }
}

#[test]
fn denied_write_is_a_client_failure() {
    let engine = Engine::builder(KernelConfig::default())
        .authorizer(Arc::new(ReadOnly))
        .build()
        .unwrap();
    let response = engine
        .execute(Operation::new("register-resource", addr("/socket=*")))
        .unwrap();
    assert!(response.rolled_back);
    let message = response.failure_message().unwrap();
    assert!(message.contains("not authorized"));
    assert!(message.contains("read-only caller"));
}
