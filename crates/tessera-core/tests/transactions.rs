use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tessera_core::{
    CoreError, Engine, HandlerError, KernelConfig, OperationContext, ResultAction, RunningState,
    Stage, StepResult,
};
use tessera_model::{Operation, Outcome, PathAddress, Response, ServiceName};
use tessera_runtime::{MockContainer, ServiceContainer, ServiceSpec};
use tessera_store::{
    ConfigurationPersister, PersistenceResource, Resource, ResourceTree, StoreError,
};

fn addr(s: &str) -> PathAddress {
    PathAddress::parse(s).unwrap()
}

fn op(name: &str, address: &str) -> Operation {
    Operation::new(name, addr(address))
}

#[derive(Default)]
struct Counters {
    stored: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

/// Counts every persistence call without writing anything.
#[derive(Default)]
struct CountingPersister {
    counters: Arc<Counters>,
}

struct CountingWrite {
    counters: Arc<Counters>,
}

impl PersistenceResource for CountingWrite {
    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
    }
}

impl ConfigurationPersister for CountingPersister {
    fn store(&self, _: &ResourceTree) -> Result<Box<dyn PersistenceResource>, StoreError> {
        self.counters.stored.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingWrite {
            counters: Arc::clone(&self.counters),
        }))
    }

    fn load(&self) -> Result<Option<ResourceTree>, StoreError> {
        Ok(None)
    }
}

fn counting_engine() -> (Engine, Arc<Counters>) {
    let persister = CountingPersister::default();
    let counters = Arc::clone(&persister.counters);
    let engine = Engine::builder(KernelConfig::default())
        .persister(Arc::new(persister))
        .build()
        .unwrap();
    (engine, counters)
}

fn mock_engine(timeout: Duration) -> (Engine, Arc<MockContainer>) {
    let container = Arc::new(MockContainer::new().with_delay(Duration::from_millis(2)));
    let engine = Engine::builder(KernelConfig::default().with_blocking_timeout(timeout))
        .container(Arc::clone(&container) as Arc<dyn ServiceContainer>)
        .build()
        .unwrap();
    (engine, container)
}

fn create(
    address: &'static str,
) -> impl FnMut(&mut OperationContext<'_>, &Operation) -> Result<StepResult, HandlerError> + Send + 'static
{
    move |ctx, _| {
        ctx.resources_mut()?.create(&addr(address), Resource::new())?;
        Ok(StepResult::Ok)
    }
}

// Model-stage failures

#[test]
fn model_failure_rolls_back_without_persisting() {
    let (engine, counters) = counting_engine();
    let response = engine
        .execute_with(op("custom", "/a=1"), |ctx, _| {
            ctx.resources_mut()?.create(&addr("/a=1"), Resource::new())?;
            Ok(StepResult::fail("bad input"))
        })
        .unwrap();
    assert_eq!(response.outcome, Outcome::Failed);
    assert!(response.rolled_back);
    assert_eq!(response.failure_message().unwrap(), "bad input");
    assert!(engine.read_resource(&addr("/a=1"), false).is_none());
    assert_eq!(counters.stored.load(Ordering::SeqCst), 0);
    assert_eq!(counters.committed.load(Ordering::SeqCst), 0);
}

#[test]
fn model_client_error_ignores_runtime_policy() {
    let (engine, counters) = counting_engine();
    let operation = op("custom", "/a=1").rollback_on_runtime_failure(false);
    let response = engine
        .execute_with(operation, |ctx, _| {
            ctx.resources_mut()?.create(&addr("/a=1"), Resource::new())?;
            Err(HandlerError::client("rejected"))
        })
        .unwrap();
    assert!(response.rolled_back);
    assert!(engine.read_resource(&addr("/a=1"), false).is_none());
    assert_eq!(counters.committed.load(Ordering::SeqCst), 0);
}

#[test]
fn successful_write_commits_once() {
    let (engine, counters) = counting_engine();
    let response = engine.execute_with(op("custom", "/a=1"), create("/a=1")).unwrap();
    assert!(response.is_success());
    assert!(!response.rolled_back);
    assert!(engine.read_resource(&addr("/a=1"), false).is_some());
    assert_eq!(counters.stored.load(Ordering::SeqCst), 1);
    assert_eq!(counters.committed.load(Ordering::SeqCst), 1);
    assert_eq!(counters.rolled_back.load(Ordering::SeqCst), 0);
    assert_eq!(engine.snapshot().version(), 1);
}

#[test]
fn read_only_transaction_does_not_persist() {
    let (engine, counters) = counting_engine();
    let response = engine
        .execute(op("read-resource", "/").with_param("recursive", true))
        .unwrap();
    assert!(response.is_success());
    assert_eq!(counters.stored.load(Ordering::SeqCst), 0);
    assert_eq!(engine.snapshot().version(), 0);
}

// Runtime-stage failures

#[test]
fn runtime_failure_without_policy_keeps_model() {
    let (engine, counters) = counting_engine();
    let operation = op("custom", "/a=1").rollback_on_runtime_failure(false);
    let response = engine
        .execute_with(operation, |ctx, _| {
            ctx.resources_mut()?.create(&addr("/a=1"), Resource::new())?;
            ctx.add_step(Stage::Runtime, |_, _| Ok(StepResult::fail("service broke")))?;
            Ok(StepResult::Ok)
        })
        .unwrap();
    assert_eq!(response.outcome, Outcome::Failed);
    assert!(!response.rolled_back);
    assert_eq!(response.failure_message().unwrap(), "service broke");
    assert!(engine.read_resource(&addr("/a=1"), false).is_some());
    assert_eq!(counters.committed.load(Ordering::SeqCst), 1);
}

#[test]
fn runtime_failure_with_policy_rolls_back() {
    let (engine, _) = counting_engine();
    let response = engine
        .execute_with(op("custom", "/a=1"), |ctx, _| {
            ctx.resources_mut()?.create(&addr("/a=1"), Resource::new())?;
            ctx.add_step(Stage::Runtime, |_, _| Ok(StepResult::fail("service broke")))?;
            Ok(StepResult::Ok)
        })
        .unwrap();
    assert!(response.rolled_back);
    assert!(engine.read_resource(&addr("/a=1"), false).is_none());
}

// Rollback order

#[test]
fn rollback_walks_steps_in_reverse_execution_order() {
    let (engine, _) = counting_engine();
    let calls: Arc<Mutex<Vec<(String, ResultAction)>>> = Arc::default();
    let log = Arc::clone(&calls);
    let response = engine
        .execute_with(op("custom", "/"), move |ctx, _| {
            let a = Arc::clone(&log);
            ctx.complete_step(move |_, action| {
                a.lock().push(("A".to_owned(), action));
                Ok(())
            });
            let log = Arc::clone(&log);
            ctx.add_step(Stage::Model, move |ctx, _| {
                let b = Arc::clone(&log);
                ctx.complete_step(move |_, action| {
                    b.lock().push(("B".to_owned(), action));
                    Ok(())
                });
                let log = Arc::clone(&log);
                ctx.add_step(Stage::Model, move |ctx, _| {
                    let c = Arc::clone(&log);
                    ctx.complete_step(move |_, action| {
                        c.lock().push(("C".to_owned(), action));
                        Ok(())
                    });
                    Ok(StepResult::fail("C failed"))
                })?;
                Ok(StepResult::Ok)
            })?;
            Ok(StepResult::Ok)
        })
        .unwrap();
    assert!(response.rolled_back);
    let calls = calls.lock().clone();
    assert_eq!(
        calls,
        vec![
            ("C".to_owned(), ResultAction::Rollback),
            ("B".to_owned(), ResultAction::Rollback),
            ("A".to_owned(), ResultAction::Rollback),
        ]
    );
}

#[test]
fn result_handlers_see_keep_on_success() {
    let (engine, _) = counting_engine();
    let seen: Arc<Mutex<Vec<ResultAction>>> = Arc::default();
    let log = Arc::clone(&seen);
    engine
        .execute_with(op("custom", "/"), move |ctx, _| {
            let log = Arc::clone(&log);
            ctx.complete_step(move |_, action| {
                log.lock().push(action);
                Ok(())
            });
            Ok(StepResult::Ok)
        })
        .unwrap();
    assert_eq!(*seen.lock(), vec![ResultAction::Keep]);
}

#[test]
fn failing_result_handler_does_not_stop_the_walk() {
    let (engine, _) = counting_engine();
    let outer_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&outer_ran);
    let result = engine.execute_with(op("custom", "/"), move |ctx, _| {
        let flag = Arc::clone(&flag);
        ctx.complete_step(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        ctx.add_step(Stage::Model, |ctx, _| {
            ctx.complete_step(|_, _| Err(HandlerError::fault("cleanup exploded")));
            Ok(StepResult::Ok)
        })?;
        Ok(StepResult::Ok)
    });
    assert!(outer_ran.load(Ordering::SeqCst));
    match result {
        Err(CoreError::HandlerFault { message, .. }) => {
            assert!(message.contains("cleanup exploded"));
        }
        other => panic!("expected a handler fault, got {other:?}"),
    }
}

// Cancellation

#[test]
fn cancellation_between_steps_skips_the_rest() {
    let (engine, _) = counting_engine();
    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let b_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&b_ran);

    let worker = engine.clone();
    let handle = thread::spawn(move || {
        worker.execute_with(op("custom", "/a=1"), move |ctx, _| {
            ctx.resources_mut()?.create(&addr("/a=1"), Resource::new())?;
            let flag = Arc::clone(&flag);
            ctx.add_step(Stage::Model, move |_, _| {
                flag.store(true, Ordering::SeqCst);
                Ok(StepResult::Ok)
            })?;
            started_tx.send(ctx.txn_id()).unwrap();
            resume_rx.recv().unwrap();
            Ok(StepResult::Ok)
        })
    });

    let txn = started_rx.recv().unwrap();
    let active = engine.active_operations();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].txn, txn);
    assert!(engine.cancel(txn));
    resume_tx.send(()).unwrap();

    let response = handle.join().unwrap().unwrap();
    assert_eq!(response.outcome, Outcome::Cancelled);
    assert!(response.rolled_back);
    assert!(!b_ran.load(Ordering::SeqCst));
    assert!(engine.read_resource(&addr("/a=1"), false).is_none());
    assert!(engine.active_operations().is_empty());
    assert!(!engine.cancel(txn));
}

// Stability gate

#[test]
fn quiescence_timeout_rolls_back_and_marks_restart_required() {
    let (engine, container) = mock_engine(Duration::from_millis(200));
    container.hang_on_start("svc");
    let response = engine
        .execute_with(op("custom", "/a=1"), |ctx, _| {
            ctx.resources_mut()?.create(&addr("/a=1"), Resource::new())?;
            ctx.add_step(Stage::Runtime, |ctx, _| {
                ctx.add_service(ServiceSpec::new("svc"))?;
                Ok(StepResult::Ok)
            })?;
            Ok(StepResult::Ok)
        })
        .unwrap();
    assert!(response.rolled_back);
    assert_eq!(response.outcome, Outcome::Failed);
    assert!(response
        .failure_message()
        .unwrap()
        .contains("stabilize"));
    assert!(engine.read_resource(&addr("/a=1"), false).is_none());

    let status = engine.process_state();
    assert!(status.unstable);
    assert_eq!(status.state, RunningState::RestartRequired);

    // A later successful transaction leaves the flag set.
    let response = engine.execute_with(op("custom", "/b=1"), create("/b=1")).unwrap();
    assert!(response.is_success());
    assert!(engine.process_state().unstable);
}

#[test]
fn rollback_removes_services_added_by_the_transaction() {
    let (engine, container) = mock_engine(Duration::from_secs(5));
    let response = engine
        .execute_with(op("custom", "/"), |ctx, _| {
            ctx.add_step(Stage::Runtime, |ctx, _| {
                ctx.add_service(ServiceSpec::new("web"))?;
                Ok(StepResult::Ok)
            })?;
            ctx.add_step(Stage::Verify, |_, _| Ok(StepResult::fail("health check failed")))?;
            Ok(StepResult::Ok)
        })
        .unwrap();
    assert!(response.rolled_back);
    assert_eq!(response.failure_message().unwrap(), "health check failed");
    assert!(container.wait_quiescent(Duration::from_secs(5)));
    assert!(container.service_state(&ServiceName::new("web")).is_none());
}

#[test]
fn stuck_removal_keeps_restart_required_after_rollback() {
    let container = Arc::new(MockContainer::new().with_delay(Duration::from_millis(2)));
    container.hang_on_remove("svc");
    let config = KernelConfig::default()
        .with_blocking_timeout(Duration::from_secs(5))
        .with_removal_timeout(Duration::from_millis(100));
    let engine = Engine::builder(config)
        .container(Arc::clone(&container) as Arc<dyn ServiceContainer>)
        .build()
        .unwrap();

    let response = engine
        .execute_with(op("custom", "/"), |ctx, _| {
            ctx.require_restart();
            ctx.add_step(Stage::Runtime, |ctx, _| {
                ctx.add_service(ServiceSpec::new("svc"))?;
                Ok(StepResult::Ok)
            })?;
            ctx.add_step(Stage::Verify, |_, _| Ok(StepResult::fail("health check failed")))?;
            Ok(StepResult::Ok)
        })
        .unwrap();
    assert!(response.rolled_back);
    assert!(response
        .response_headers
        .warnings
        .iter()
        .any(|w| w.contains("services could not be removed: svc")));
    assert!(container.service_state(&ServiceName::new("svc")).is_some());

    let status = engine.process_state();
    assert_eq!(status.state, RunningState::RestartRequired);
    assert!(!status.unstable);
}

#[test]
fn failed_service_start_is_attributed_and_rolls_back() {
    let (engine, container) = mock_engine(Duration::from_secs(5));
    container.fail_on_start("db");
    let response = engine
        .execute_with(op("custom", "/"), |ctx, _| {
            ctx.add_step(Stage::Runtime, |ctx, _| {
                ctx.add_service(ServiceSpec::new("db"))?;
                Ok(StepResult::Ok)
            })?;
            Ok(StepResult::Ok)
        })
        .unwrap();
    assert!(response.rolled_back);
    assert!(response.failure_message().unwrap().contains("service 'db' failed to start"));
}

// Deferred rollback

fn deferring(
    engine: &Engine,
    mut steps: Vec<(Stage, StepResult)>,
    rollback_on_runtime_failure: bool,
) -> Response {
    let operation = op("custom", "/a=1").rollback_on_runtime_failure(rollback_on_runtime_failure);
    engine
        .execute_with(operation, move |ctx, _| {
            ctx.resources_mut()?.create(&addr("/a=1"), Resource::new())?;
            for (stage, result) in steps.drain(..) {
                let mut result = Some(result);
                ctx.add_step(stage, move |_, _| Ok(result.take().unwrap_or(StepResult::Ok)))?;
            }
            Ok(StepResult::Ok)
        })
        .unwrap()
}

#[test]
fn single_runtime_deferral_keeps_the_transaction() {
    let (engine, _) = counting_engine();
    let response = deferring(
        &engine,
        vec![(Stage::Runtime, StepResult::fail_defer("verifying later"))],
        true,
    );
    assert!(!response.rolled_back);
    assert_eq!(response.failure_message().unwrap(), "verifying later");
    assert!(engine.read_resource(&addr("/a=1"), false).is_some());
}

#[test]
fn plain_failure_after_deferral_wins() {
    let (engine, _) = counting_engine();
    let response = deferring(
        &engine,
        vec![
            (Stage::Runtime, StepResult::fail_defer("verifying later")),
            (Stage::Verify, StepResult::fail("verification failed")),
        ],
        true,
    );
    assert!(response.rolled_back);
    assert!(engine.read_resource(&addr("/a=1"), false).is_none());
}

#[test]
fn second_deferral_is_a_plain_failure() {
    let (engine, _) = counting_engine();
    let response = deferring(
        &engine,
        vec![
            (Stage::Runtime, StepResult::fail_defer("first")),
            (Stage::Runtime, StepResult::fail_defer("second")),
        ],
        true,
    );
    assert!(response.rolled_back);
    assert_eq!(response.failure_message().unwrap(), "first");
}

#[test]
fn model_deferral_is_not_honoured() {
    let (engine, _) = counting_engine();
    let response = deferring(
        &engine,
        vec![(Stage::Model, StepResult::fail_defer("too early"))],
        true,
    );
    assert!(response.rolled_back);
}

#[test]
fn deferral_does_not_override_rollback_only() {
    let (engine, _) = counting_engine();
    let response = engine
        .execute_with(op("custom", "/a=1"), |ctx, _| {
            ctx.resources_mut()?.create(&addr("/a=1"), Resource::new())?;
            ctx.set_rollback_only();
            ctx.add_step(Stage::Runtime, |_, _| Ok(StepResult::fail_defer("later")))?;
            Ok(StepResult::Ok)
        })
        .unwrap();
    assert!(response.rolled_back);
    assert_eq!(response.failure_message().unwrap(), "operation rolled back");
}

// Faults

#[test]
fn handler_fault_is_returned_with_the_finalized_response() {
    let (engine, _) = counting_engine();
    let result = engine.execute_with(op("custom", "/a=1"), |ctx, _| {
        ctx.resources_mut()?.create(&addr("/a=1"), Resource::new())?;
        Err(HandlerError::fault("disk on fire"))
    });
    let Err(CoreError::HandlerFault { message, response }) = result else {
        panic!("expected a handler fault");
    };
    assert_eq!(message, "disk on fire");
    assert!(response.rolled_back);
    assert!(engine.read_resource(&addr("/a=1"), false).is_none());
}

#[test]
fn handler_panic_is_a_fault() {
    let (engine, _) = counting_engine();
    let result = engine.execute_with(op("custom", "/"), |_, _| -> Result<StepResult, HandlerError> {
        panic!("handler bug")
    });
    let err = result.unwrap_err();
    assert!(err.to_string().contains("handler bug"));
    assert!(err.response().unwrap().rolled_back);
}

#[test]
fn steps_cannot_target_an_earlier_stage() {
    let (engine, _) = counting_engine();
    let result = engine.execute_with(op("custom", "/"), |ctx, _| {
        ctx.add_step(Stage::Runtime, |ctx, _| {
            ctx.add_step(Stage::Model, |_, _| Ok(StepResult::Ok))?;
            Ok(StepResult::Ok)
        })?;
        Ok(StepResult::Ok)
    });
    assert!(matches!(result, Err(CoreError::HandlerFault { .. })));
}

#[test]
fn domain_stage_requires_coordinating_controller() {
    let (engine, _) = counting_engine();
    let result = engine.execute_with(op("custom", "/"), |ctx, _| {
        ctx.add_step(Stage::Domain, |_, _| Ok(StepResult::Ok))?;
        Ok(StepResult::Ok)
    });
    assert!(result.is_err());

    let engine = Engine::new(KernelConfig::default().with_coordinating_controller(true)).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let response = engine
        .execute_with(op("custom", "/"), move |ctx, _| {
            let flag = Arc::clone(&flag);
            ctx.add_step(Stage::Domain, move |ctx, _| {
                assert_eq!(ctx.stage(), Stage::Domain);
                flag.store(true, Ordering::SeqCst);
                Ok(StepResult::Ok)
            })?;
            Ok(StepResult::Ok)
        })
        .unwrap();
    assert!(response.is_success());
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn warnings_are_deduplicated() {
    let (engine, _) = counting_engine();
    let response = engine
        .execute_with(op("custom", "/"), |ctx, _| {
            ctx.add_warning("slow disk");
            ctx.add_step(Stage::Runtime, |ctx, _| {
                ctx.add_warning("slow disk");
                ctx.add_warning("low memory");
                Ok(StepResult::Ok)
            })?;
            ctx.set_result(json!({"ok": true}));
            Ok(StepResult::Ok)
        })
        .unwrap();
    assert_eq!(
        response.response_headers.warnings,
        vec!["slow disk".to_owned(), "low memory".to_owned()]
    );
    assert_eq!(response.result, json!({"ok": true}));
    let serialized = serde_json::to_value(&response).unwrap();
    assert_eq!(serialized["outcome"], Value::from("success"));
    assert_eq!(serialized["rolled-back"], Value::from(false));
}
