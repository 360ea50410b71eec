use anyhow::{Result, bail};
use connect_core::{CallRequest, Core};
use serde_json::json;
use tracing::debug;

pub async fn run(core: &Core) -> Result<()> {
    let response = core.call(CallRequest::new("searchDevices", json!({}))).await;
    if !response.success {
        bail!("enumerate failed: {}", response.payload["error"]);
    }

    let devices = response.payload.as_array().cloned().unwrap_or_default();
    debug!(count = devices.len(), "enumerated devices");
    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }
    for device in devices {
        println!("{}", serde_json::to_string(&device)?);
    }
    Ok(())
}
