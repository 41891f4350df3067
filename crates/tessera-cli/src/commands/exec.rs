use super::{execute, exit_code, json_pretty, print_response, EXIT_FAILURE, EXIT_SUCCESS};
use serde_json::{json, Value};
use std::path::Path;
use tessera_core::Engine;
use tessera_model::Operation;
use tracing::warn;

/// Parse a file holding one operation object or an array of them.
pub fn parse_operations(content: &str) -> Result<Vec<Operation>, String> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| format!("invalid operation file: {e}"))?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item).map_err(|e| format!("invalid operation #{}: {e}", i + 1))
        })
        .collect()
}

pub fn run(engine: &Engine, file: &Path, keep_going: bool, json: bool) -> Result<u8, String> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    let operations = parse_operations(&content)?;
    run_operations(
        engine,
        operations,
        keep_going,
        json,
        tessera_core::shutdown_requested,
    )
}

/// Execute `operations` in order, checking `interrupted` before each one.
fn run_operations(
    engine: &Engine,
    operations: Vec<Operation>,
    keep_going: bool,
    json: bool,
    interrupted: impl Fn() -> bool,
) -> Result<u8, String> {
    let total = operations.len();
    let mut code = EXIT_SUCCESS;
    let mut report = Vec::with_capacity(total);
    for (index, operation) in operations.into_iter().enumerate() {
        if interrupted() {
            warn!("interrupted, skipping {} remaining operations", total - index);
            code = EXIT_FAILURE;
            break;
        }
        let label = format!("{} {}", operation.name, operation.address);
        let response = execute(engine, operation)?;
        let failed = exit_code(&response) == EXIT_FAILURE;
        if json {
            report.push(json!({ "operation": label, "response": response }));
        } else {
            println!("== {label}");
            print_response(&response, false)?;
        }
        if failed {
            code = EXIT_FAILURE;
            if !keep_going {
                warn!("stopping after failed operation {label}");
                break;
            }
        }
    }
    if json {
        println!("{}", json_pretty(&report)?);
    }
    Ok(code)
}
