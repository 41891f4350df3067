pub mod completions;
pub mod exec;
pub mod history;
pub mod op;
pub mod read;
pub mod status;

use std::path::Path;
use std::sync::Arc;
use tessera_core::handlers::REGISTER_RESOURCE;
use tessera_core::{install_signal_handler, operations_from_tree, Engine, KernelConfig};
use tessera_model::{Operation, Response};
use tessera_store::{ConfigurationPersister, JsonFilePersister, ResourceRegistration};
use tracing::{debug, error, info};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub const CONFIG_FILE: &str = "tessera.toml";

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// `register-resource` operations for the definitions in `tessera.toml`.
pub fn definition_ops(resources: &[ResourceRegistration]) -> Result<Vec<Operation>, String> {
    resources
        .iter()
        .map(|registration| {
            let value = serde_json::to_value(registration)
                .map_err(|e| format!("configuration error: {e}"))?;
            Ok(Operation::new(REGISTER_RESOURCE, registration.pattern.clone())
                .with_param("registration", value))
        })
        .collect()
}

/// Load the kernel config, boot the persisted model, and wire Ctrl-C to cancellation.
pub fn open_engine(store: &Path) -> Result<Engine, String> {
    let config = KernelConfig::load_or_default(&store.join(CONFIG_FILE))
        .map_err(|e| e.to_string())?;
    let persister = JsonFilePersister::open(store).map_err(|e| format!("store error: {e}"))?;
    let saved = persister.load().map_err(|e| format!("store error: {e}"))?;

    let mut operations = definition_ops(&config.resources)?;
    if let Some(tree) = &saved {
        operations.extend(operations_from_tree(tree));
    }
    let engine = Engine::builder(config)
        .persister(Arc::new(persister))
        .build()
        .map_err(|e| e.to_string())?;

    let handle = engine.clone();
    install_signal_handler(move || {
        let cancelled = handle.cancel_all();
        debug!("cancelled {cancelled} in-flight operations");
    });

    info!("booting {} operations from {}", operations.len(), store.display());
    let response = engine.boot(operations).map_err(|e| e.to_string())?;
    if response.is_failed() {
        return Err(format!(
            "boot failed: {}",
            response.failure_message().unwrap_or_default()
        ));
    }
    Ok(engine)
}

/// Execute `operation`, returning the finalized response even after a handler fault.
pub fn execute(engine: &Engine, operation: Operation) -> Result<Response, String> {
    match engine.execute(operation) {
        Ok(response) => Ok(response),
        Err(e) => match e.response() {
            Some(response) => {
                error!("{e}");
                Ok(response.clone())
            }
            None => Err(e.to_string()),
        },
    }
}

pub fn print_response(response: &Response, json: bool) -> Result<(), String> {
    if json {
        println!("{}", json_pretty(response)?);
        return Ok(());
    }
    println!("outcome:      {}", response.outcome);
    println!("rolled-back:  {}", response.rolled_back);
    if let Some(message) = response.failure_message() {
        println!("failure:      {message}");
    }
    let headers = &response.response_headers;
    if headers.requires_reload {
        println!("process:      reload required");
    }
    if headers.requires_restart {
        println!("process:      restart required");
    }
    for warning in &headers.warnings {
        println!("warning:      {warning}");
    }
    if !response.result.is_null() {
        println!("{}", json_pretty(&response.result)?);
    }
    Ok(())
}

pub fn exit_code(response: &Response) -> u8 {
    if response.is_failed() {
        EXIT_FAILURE
    } else {
        EXIT_SUCCESS
    }
}
