use super::{json_pretty, EXIT_SUCCESS};
use serde_json::json;
use tessera_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    let status = engine.process_state();
    let snapshot = engine.snapshot();
    let container = engine.container();
    let resources = snapshot.resources().len().saturating_sub(1);
    let services = container.services().len();
    if json {
        let report = json!({
            "state": status.state,
            "unstable": status.unstable,
            "version": snapshot.version(),
            "resources": resources,
            "container": container.name(),
            "services": services,
        });
        println!("{}", json_pretty(&report)?);
    } else {
        println!("state:      {}", status.state);
        println!("unstable:   {}", status.unstable);
        println!("version:    {}", snapshot.version());
        println!("resources:  {resources}");
        println!("container:  {}", container.name());
        println!("services:   {services}");
    }
    Ok(EXIT_SUCCESS)
}
