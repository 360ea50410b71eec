use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::Device;
use crate::device_list::DeviceList;
use crate::error::{ConnectError, ConnectResult, HardwareErrorCode};
use crate::events::{EventBus, Notification};
use crate::features::DeviceMode;
use crate::methods;
use crate::policy::MethodVersionRanges;
use crate::queue::{AbortSignal, RequestQueue};
use crate::remote::RemoteConfigStore;
use crate::settings::ConnectSettings;

/// Payload fields understood by every method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommonParams {
    pub connect_id: Option<String>,
    pub device_id: Option<String>,
    pub keep_session: Option<bool>,
    pub use_empty_passphrase: bool,
    pub passphrase_state: Option<String>,
    pub init_session: bool,
    pub retry_count: Option<u32>,
    pub poll_interval_time: Option<u64>,
    pub timeout: Option<u64>,
    pub skip_passphrase_check: bool,
}

impl CommonParams {
    pub fn from_payload(payload: &Value) -> ConnectResult<Self> {
        if payload.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(payload.clone())
            .map_err(|e| ConnectError::invalid_parameter(format!("invalid common params: {e}")))
    }
}

/// Reads the method-specific part of a payload.
pub fn parse_payload<T: serde::de::DeserializeOwned>(payload: &Value) -> ConnectResult<T> {
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload.clone()
    };
    serde_json::from_value(payload).map_err(|e| ConnectError::invalid_parameter(e.to_string()))
}

/// Everything a method body may touch while it runs.
pub struct MethodContext {
    pub request_id: u64,
    pub device: Option<Arc<Device>>,
    pub devices: Arc<DeviceList>,
    pub events: EventBus,
    pub signal: AbortSignal,
    pub settings: Arc<ConnectSettings>,
    pub remote: Arc<RemoteConfigStore>,
    pub queue: Arc<RequestQueue>,
}

impl MethodContext {
    pub fn device(&self) -> ConnectResult<&Arc<Device>> {
        self.device
            .as_ref()
            .ok_or_else(|| ConnectError::new(HardwareErrorCode::DeviceNotFound))
    }

    pub fn progress(&self, progress: Value) {
        self.events.emit(Notification::CallProgress {
            id: self.request_id,
            progress,
        });
    }
}

/// One callable API operation.
///
/// Construction parses and validates the payload; the orchestrator reads
/// the declarative hooks to decide how the device is prepared before
/// [`Method::run`].
#[async_trait]
pub trait Method: Send + Sync {
    fn name(&self) -> &'static str;

    fn params(&self) -> &CommonParams;

    fn use_device(&self) -> bool {
        true
    }

    /// Method reads wallet data, so the passphrase state matters.
    fn use_device_passphrase_state(&self) -> bool {
        true
    }

    fn allow_device_mode(&self) -> &[DeviceMode] {
        &[]
    }

    fn require_device_mode(&self) -> &[DeviceMode] {
        &[]
    }

    fn version_ranges(&self) -> MethodVersionRanges {
        MethodVersionRanges::new()
    }

    fn skip_force_update_check(&self) -> bool {
        false
    }

    fn is_firmware_update(&self) -> bool {
        false
    }

    /// Long-running background loop; release waits for it.
    fn is_callback_task(&self) -> bool {
        false
    }

    /// Chain id for which strict safety checks may be relaxed temporarily.
    fn relax_safety_checks(&self) -> Option<u64> {
        None
    }

    fn check_device_id(&self) -> bool {
        true
    }

    async fn run(&mut self, ctx: &MethodContext) -> ConnectResult<Value>;

    fn dispose(&mut self) {}
}

pub type MethodFactory = fn(Value) -> ConnectResult<Box<dyn Method>>;

/// Name to constructor table.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    factories: HashMap<String, MethodFactory>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        methods::register_builtin(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &str, factory: MethodFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(&self, name: &str, payload: Value) -> ConnectResult<Box<dyn Method>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            ConnectError::with_message(
                HardwareErrorCode::CallMethodError,
                format!("Method not found: {name}"),
            )
        })?;
        factory(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn common_params_are_camel_case() {
        let params = CommonParams::from_payload(&json!({
            "connectId": "dev-1",
            "keepSession": true,
            "passphraseState": "state",
            "retryCount": 2,
            "path": "m/44'/0'/0'"
        }))
        .unwrap();
        assert_eq!(params.connect_id.as_deref(), Some("dev-1"));
        assert_eq!(params.keep_session, Some(true));
        assert_eq!(params.retry_count, Some(2));
        assert!(!params.use_empty_passphrase);
        assert_eq!(CommonParams::from_payload(&Value::Null).unwrap(), CommonParams::default());
    }

    #[test]
    fn unknown_method_is_rejected() {
        let registry = MethodRegistry::with_builtin();
        assert!(registry.names().contains(&"getFeatures".to_string()));
        let err = registry.create("signTheMoon", json!({})).err().unwrap();
        assert!(err.is(HardwareErrorCode::CallMethodError));
    }

    #[test]
    fn bad_common_params_are_invalid_parameter() {
        let err = CommonParams::from_payload(&json!({ "retryCount": "many" })).unwrap_err();
        assert!(err.is(HardwareErrorCode::CallMethodInvalidParameter));
    }
}
