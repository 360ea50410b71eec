use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::device::Device;
use crate::error::ConnectResult;
use crate::method::{CommonParams, Method, MethodContext, parse_payload};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ResponseTypes {
    One(String),
    Many(Vec<String>),
}

impl Default for ResponseTypes {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl ResponseTypes {
    fn as_slice(&self) -> Vec<&str> {
        match self {
            Self::One(name) => vec![name.as_str()],
            Self::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// One raw protocol exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CallSpec {
    pub message_type: String,
    #[serde(default)]
    pub response_type: ResponseTypes,
    #[serde(default)]
    pub message: Value,
}

impl CallSpec {
    pub(crate) async fn send(&self, device: &Device) -> ConnectResult<Value> {
        let accept = self.response_type.as_slice();
        let payload = if self.message.is_null() {
            json!({})
        } else {
            self.message.clone()
        };
        let response = device
            .typed_call(&self.message_type, &accept, payload)
            .await?;
        Ok(json!({ "type": response.name, "message": response.body }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypedCallPayload {
    #[serde(flatten)]
    call: CallSpec,
    #[serde(default)]
    chain_id: Option<u64>,
}

/// Raw passthrough to the device protocol.
pub struct TypedCall {
    params: CommonParams,
    call: CallSpec,
    chain_id: Option<u64>,
}

impl TypedCall {
    pub fn create(payload: Value) -> ConnectResult<Box<dyn Method>> {
        let TypedCallPayload { call, chain_id } = parse_payload(&payload)?;
        Ok(Box::new(Self {
            params: CommonParams::from_payload(&payload)?,
            call,
            chain_id,
        }))
    }
}

#[async_trait]
impl Method for TypedCall {
    fn name(&self) -> &'static str {
        "typedCall"
    }

    fn params(&self) -> &CommonParams {
        &self.params
    }

    fn relax_safety_checks(&self) -> Option<u64> {
        self.chain_id
    }

    async fn run(&mut self, ctx: &MethodContext) -> ConnectResult<Value> {
        self.call.send(ctx.device()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HardwareErrorCode;

    #[test]
    fn response_type_accepts_string_or_list() {
        let spec: CallSpec = serde_json::from_value(json!({
            "messageType": "GetAddress",
            "responseType": "Address",
        }))
        .unwrap();
        assert_eq!(spec.response_type.as_slice(), vec!["Address"]);

        let spec: CallSpec = serde_json::from_value(json!({
            "messageType": "SignTx",
            "responseType": ["TxRequest", "Success"],
            "message": { "inputs_count": 1 }
        }))
        .unwrap();
        assert_eq!(spec.response_type.as_slice(), vec!["TxRequest", "Success"]);
    }

    #[test]
    fn missing_message_type_is_invalid() {
        let err = TypedCall::create(json!({ "message": {} })).err().unwrap();
        assert!(err.is(HardwareErrorCode::CallMethodInvalidParameter));
    }
}
