pub mod call;
pub mod enumerate;
pub mod serve;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use connect_core::{ConnectSettings, Core, FileConfigSource};
use connect_transport::{JsonCodec, SchemaSet, UdpTransport};
use tracing::debug;

use crate::cli::ConnectionArgs;
use crate::config::load_settings;

pub fn build_core(args: &ConnectionArgs) -> Result<Core> {
    let settings = load_settings(args.config.as_deref())?;
    build_core_with(args, settings)
}

fn build_core_with(args: &ConnectionArgs, settings: ConnectSettings) -> Result<Core> {
    if args.schema.is_empty() {
        bail!("at least one --schema file is required");
    }
    let mut schemas = SchemaSet::new();
    for path in &args.schema {
        schemas
            .load_file(path)
            .with_context(|| format!("failed to load schema {}", path.display()))?;
    }

    debug!(emulators = ?args.emulators, schemas = args.schema.len(), "building transport");
    let codec = Arc::new(JsonCodec::new(schemas));
    let transport = Arc::new(UdpTransport::new(args.emulators.clone(), codec));

    let mut builder = Core::builder(transport).settings(settings);
    if let Some(path) = &args.remote_config {
        builder = builder.remote_source(Arc::new(FileConfigSource::new(path)));
    }
    Ok(builder.build())
}
