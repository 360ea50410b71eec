use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ConnectResult;
use crate::method::{CommonParams, Method, MethodContext};

/// Enumerates the transport and lists what is connected.
pub struct SearchDevices {
    params: CommonParams,
}

impl SearchDevices {
    pub fn create(payload: Value) -> ConnectResult<Box<dyn Method>> {
        Ok(Box::new(Self {
            params: CommonParams::from_payload(&payload)?,
        }))
    }
}

#[async_trait]
impl Method for SearchDevices {
    fn name(&self) -> &'static str {
        "searchDevices"
    }

    fn params(&self) -> &CommonParams {
        &self.params
    }

    fn use_device(&self) -> bool {
        false
    }

    async fn run(&mut self, ctx: &MethodContext) -> ConnectResult<Value> {
        let devices = ctx.devices.refresh().await?;
        let summaries: Vec<_> = devices.iter().map(|device| device.summary()).collect();
        Ok(json!(summaries))
    }
}
