use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::{ConnectError, ConnectResult};
use crate::features::DeviceMode;
use crate::method::{CommonParams, Method, MethodContext};
use crate::methods::ANY_MODE;

/// Firmware status of the device against the published releases.
pub struct CheckFirmwareRelease {
    params: CommonParams,
}

impl CheckFirmwareRelease {
    pub fn create(payload: Value) -> ConnectResult<Box<dyn Method>> {
        Ok(Box::new(Self {
            params: CommonParams::from_payload(&payload)?,
        }))
    }
}

#[async_trait]
impl Method for CheckFirmwareRelease {
    fn name(&self) -> &'static str {
        "checkFirmwareRelease"
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
        let features = ctx
            .device()?
            .features()
            .ok_or_else(|| ConnectError::runtime("device features unavailable"))?;
        let config = ctx.remote.check_and_reload().await;
        let device_type = features.device_type();
        Ok(json!({
            "status": config.firmware_status(&features),
            "release": config.latest_firmware(device_type),
            "bleRelease": config.latest_ble(device_type),
            "current": features.version_triplet(),
        }))
    }
}
