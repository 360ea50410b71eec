use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ConnectResult;
use crate::method::{CommonParams, Method, MethodContext};

pub struct DeviceLock {
    params: CommonParams,
}

impl DeviceLock {
    pub fn create(payload: Value) -> ConnectResult<Box<dyn Method>> {
        Ok(Box::new(Self {
            params: CommonParams::from_payload(&payload)?,
        }))
    }
}

#[async_trait]
impl Method for DeviceLock {
    fn name(&self) -> &'static str {
        "deviceLock"
    }

    fn params(&self) -> &CommonParams {
        &self.params
    }

    fn use_device_passphrase_state(&self) -> bool {
        false
    }

    async fn run(&mut self, ctx: &MethodContext) -> ConnectResult<Value> {
        ctx.device()?
            .typed_call("LockDevice", &["Success"], json!({}))
            .await?;
        Ok(json!({ "message": "Device locked" }))
    }
}
