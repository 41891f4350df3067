use super::{json_pretty, EXIT_SUCCESS};
use std::path::Path;
use tessera_store::JsonFilePersister;

pub fn run(store: &Path, json: bool) -> Result<u8, String> {
    let persister = JsonFilePersister::open(store).map_err(|e| format!("store error: {e}"))?;
    let entries = persister
        .history()
        .map_err(|e| format!("store error: {e}"))?;
    if json {
        let names: Vec<String> = entries.iter().map(|p| p.display().to_string()).collect();
        println!("{}", json_pretty(&names)?);
    } else if entries.is_empty() {
        println!("no committed configurations");
    } else {
        for entry in &entries {
            println!("{}", entry.display());
        }
    }
    Ok(EXIT_SUCCESS)
}
