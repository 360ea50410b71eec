use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ConnectResult;
use crate::method::{CommonParams, Method, MethodContext};

/// Returns the passphrase state of the wallet the device has open, or
/// `null` when passphrase protection is off.
pub struct GetPassphraseState {
    params: CommonParams,
}

impl GetPassphraseState {
    pub fn create(payload: Value) -> ConnectResult<Box<dyn Method>> {
        Ok(Box::new(Self {
            params: CommonParams::from_payload(&payload)?,
        }))
    }
}

#[async_trait]
impl Method for GetPassphraseState {
    fn name(&self) -> &'static str {
        "getPassphraseState"
    }

    fn params(&self) -> &CommonParams {
        &self.params
    }

    fn use_device_passphrase_state(&self) -> bool {
        false
    }

    async fn run(&mut self, ctx: &MethodContext) -> ConnectResult<Value> {
        let device = ctx.device()?;
        let enabled = device
            .features()
            .is_some_and(|features| features.passphrase_enabled());
        if !enabled {
            return Ok(Value::Null);
        }
        let probe = device.passphrase_state_probe().await?;
        Ok(json!(probe.passphrase_state))
    }
}
