use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{ConnectError, ConnectResult, HardwareErrorCode};
use crate::method::{CommonParams, Method, MethodContext, parse_payload};
use crate::methods::typed_call::CallSpec;

#[derive(Debug, Deserialize)]
struct BatchPayload {
    calls: Vec<CallSpec>,
}

/// Runs several raw calls back to back as one background task, reporting
/// each response as progress.
pub struct BatchCall {
    params: CommonParams,
    calls: Vec<CallSpec>,
}

impl BatchCall {
    pub fn create(payload: Value) -> ConnectResult<Box<dyn Method>> {
        let BatchPayload { calls } = parse_payload(&payload)?;
        if calls.is_empty() {
            return Err(ConnectError::invalid_parameter("calls must not be empty"));
        }
        Ok(Box::new(Self {
            params: CommonParams::from_payload(&payload)?,
            calls,
        }))
    }
}

#[async_trait]
impl Method for BatchCall {
    fn name(&self) -> &'static str {
        "batchCall"
    }

    fn params(&self) -> &CommonParams {
        &self.params
    }

    fn is_callback_task(&self) -> bool {
        true
    }

    async fn run(&mut self, ctx: &MethodContext) -> ConnectResult<Value> {
        let device = ctx.device()?;
        let connect_id = device.connect_id();
        let total = self.calls.len();
        let mut responses = Vec::with_capacity(total);
        for (index, call) in self.calls.iter().enumerate() {
            ctx.signal.check(HardwareErrorCode::PollingStop)?;
            if !ctx.queue.has_pending_callback_task(&connect_id) {
                debug!(connect_id = %connect_id, index, "batch cancelled");
                return Err(ConnectError::new(HardwareErrorCode::PollingStop));
            }
            let response = call.send(device).await?;
            ctx.progress(json!({ "index": index, "total": total, "response": response }));
            responses.push(response);
        }
        Ok(Value::Array(responses))
    }
}
