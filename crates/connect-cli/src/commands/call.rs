use anyhow::{Result, bail};
use connect_core::{CallRequest, Core};
use serde_json::json;
use tracing::debug;

use crate::cli::CallArgs;
use crate::ui::spawn_terminal_prompter;

pub async fn run(core: &Core, args: CallArgs) -> Result<()> {
    let prompter = spawn_terminal_prompter(core.clone());
    let payload = args.params.unwrap_or_else(|| json!({}));
    debug!(method = %args.method, "calling");

    let response = core.call(CallRequest::new(args.method.clone(), payload)).await;
    prompter.abort();

    println!("{}", serde_json::to_string_pretty(&response.payload)?);
    if let Some(code) = response.error_code() {
        bail!("{} failed with code {code}", args.method);
    }
    Ok(())
}
