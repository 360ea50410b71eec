use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ConnectError, ConnectResult};
use crate::features::DeviceMode;
use crate::method::{CommonParams, Method, MethodContext};
use crate::methods::ANY_MODE;

pub struct GetFeatures {
    params: CommonParams,
}

impl GetFeatures {
    pub fn create(payload: Value) -> ConnectResult<Box<dyn Method>> {
        Ok(Box::new(Self {
            params: CommonParams::from_payload(&payload)?,
        }))
    }
}

#[async_trait]
impl Method for GetFeatures {
    fn name(&self) -> &'static str {
        "getFeatures"
    }

    fn params(&self) -> &CommonParams {
        &self.params
    }

    fn use_device_passphrase_state(&self) -> bool {
        false
    }

    fn allow_device_mode(&self) -> &[DeviceMode] {
        ANY_MODE
    }

    fn skip_force_update_check(&self) -> bool {
        true
    }

    async fn run(&mut self, ctx: &MethodContext) -> ConnectResult<Value> {
        // The handshake that opened this run already refreshed them.
        let features = ctx
            .device()?
            .features()
            .ok_or_else(|| ConnectError::runtime("device features unavailable"))?;
        Ok(features.to_value())
    }
}
