use super::{execute, exit_code, print_response};
use serde_json::Value;
use tessera_core::Engine;
use tessera_model::{Operation, PathAddress};

pub struct OpOptions {
    pub rollback_on_failure: bool,
    pub timeout: Option<u64>,
}

/// Split `key=value`; the value is JSON when it parses, else a plain string.
pub fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid operation parameter '{raw}': expected key=value"))?;
    if key.is_empty() {
        return Err(format!("invalid operation parameter '{raw}': empty key"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}

pub fn build_operation(
    name: &str,
    address: &str,
    params: &[String],
    options: &OpOptions,
) -> Result<Operation, String> {
    let address =
        PathAddress::parse(address).map_err(|e| format!("invalid operation address: {e}"))?;
    let mut operation = Operation::new(name, address)
        .rollback_on_runtime_failure(options.rollback_on_failure);
    operation.headers.blocking_timeout = options.timeout;
    for raw in params {
        let (key, value) = parse_param(raw)?;
        operation.parameters.insert(key, value);
    }
    Ok(operation)
}

pub fn run(
    engine: &Engine,
    name: &str,
    address: &str,
    params: &[String],
    options: &OpOptions,
    json: bool,
) -> Result<u8, String> {
    let operation = build_operation(name, address, params, options)?;
    let response = execute(engine, operation)?;
    print_response(&response, json)?;
    Ok(exit_code(&response))
}
