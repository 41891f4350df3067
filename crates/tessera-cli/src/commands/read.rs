use super::{json_pretty, EXIT_SUCCESS};
use tessera_core::Engine;
use tessera_model::PathAddress;

pub fn run(engine: &Engine, address: &str, recursive: bool) -> Result<u8, String> {
    let address =
        PathAddress::parse(address).map_err(|e| format!("invalid operation address: {e}"))?;
    let value = engine
        .read_resource(&address, recursive)
        .ok_or_else(|| format!("resource not found: {address}"))?;
    println!("{}", json_pretty(&value)?);
    Ok(EXIT_SUCCESS)
}
