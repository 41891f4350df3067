//! CLI subprocess integration tests.
//!
//! These tests invoke the `tessera` binary against a temporary store and
//! check exit codes, stdout, and that commits survive a restart.

use std::path::Path;
use std::process::{Command, Output};

fn tessera(store: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tessera"))
        .arg("--store")
        .arg(store)
        .args(args)
        .output()
        .unwrap()
}

fn write_config(store: &Path) {
    std::fs::write(
        store.join("tessera.toml"),
        r#"boot_workers = 2

[[resources]]
pattern = "/subsystem=web"
capability = "org.tessera.web"

[[resources]]
pattern = "/subsystem=web/listener=*"
capability = "org.tessera.web.listener"
dynamic = true
service = true

[resources.attributes]
port = "reload"
"#,
    )
    .unwrap();
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn cli_version_exits_zero() {
    let output = Command::new(env!("CARGO_BIN_EXE_tessera"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("tessera"));
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_tessera"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("exec"));
    assert!(out.contains("status"));
}

#[test]
fn status_of_empty_store_is_running() {
    let store = tempfile::tempdir().unwrap();
    let output = tessera(store.path(), &["--json", "status"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["state"], "running");
    assert_eq!(report["resources"], 0);
}

#[test]
fn committed_operations_survive_restart() {
    let store = tempfile::tempdir().unwrap();
    write_config(store.path());

    let ops = store.path().join("ops.json");
    std::fs::write(
        &ops,
        r#"[
            {"operation": "add", "address": "/subsystem=web"},
            {"operation": "add", "address": "/subsystem=web/listener=http", "parameters": {"port": 8080}}
        ]"#,
    )
    .unwrap();
    let output = tessera(store.path(), &["exec", &ops.to_string_lossy()]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let output = tessera(
        store.path(),
        &["read", "/subsystem=web", "--recursive"],
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let model: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(model["listener"]["http"]["port"], 8080);

    let output = tessera(store.path(), &["--json", "history"]);
    let history: Vec<String> = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(history.len(), 2);
}

#[test]
fn failed_operation_exits_non_zero_and_changes_nothing() {
    let store = tempfile::tempdir().unwrap();
    write_config(store.path());

    let output = tessera(
        store.path(),
        &["--json", "op", "add", "/subsystem=web/listener=http"],
    );
    assert_eq!(output.status.code(), Some(1));
    let response: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(response["outcome"], "failed");
    assert_eq!(response["rolled-back"], true);

    let output = tessera(store.path(), &["read", "/subsystem=web/listener=http"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("resource not found"));
}

#[test]
fn write_attribute_reports_reload_required() {
    let store = tempfile::tempdir().unwrap();
    write_config(store.path());
    assert!(tessera(store.path(), &["op", "add", "/subsystem=web"])
        .status
        .success());
    assert!(tessera(
        store.path(),
        &["op", "add", "/subsystem=web/listener=http", "-p", "port=80"]
    )
    .status
    .success());

    let output = tessera(
        store.path(),
        &[
            "--json",
            "op",
            "write-attribute",
            "/subsystem=web/listener=http",
            "-p",
            "name=port",
            "-p",
            "value=8443",
        ],
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let response: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(response["response-headers"]["requires-reload"], true);
}

#[test]
fn invalid_config_exits_with_config_error() {
    let store = tempfile::tempdir().unwrap();
    std::fs::write(store.path().join("tessera.toml"), "boot_workers = \"many\"\n").unwrap();
    let output = tessera(store.path(), &["status"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("configuration error"));
}

#[test]
fn malformed_parameter_is_rejected() {
    let store = tempfile::tempdir().unwrap();
    let output = tessera(store.path(), &["op", "add", "/subsystem=web", "-p", "port"]);
    assert_eq!(output.status.code(), Some(2));
}
