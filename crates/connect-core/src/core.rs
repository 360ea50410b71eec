use std::sync::Arc;
use std::time::Duration;

use connect_transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceContext, RunOptions};
use crate::device_list::DeviceList;
use crate::error::{ConnectError, ConnectResult, HardwareErrorCode};
use crate::events::{DeviceSummary, EventBus, Notification, UiResponse};
use crate::method::{CommonParams, Method, MethodContext, MethodRegistry};
use crate::policy::{check_device_mode, check_passphrase_enabled, check_version_range};
use crate::prompts::PromptHub;
use crate::queue::{AbortSignal, RequestHandle, RequestQueue};
use crate::remote::{ConfigSource, FirmwareStatus, RemoteConfigStore, StaticConfigSource};
use crate::session::{MemorySessionStore, SessionStore};
use crate::settings::ConnectSettings;

/// EVM test networks on which strict safety checks are relaxed for the
/// current session.
const RELAXED_SAFETY_CHAIN_IDS: &[u64] = &[3, 4, 5, 42, 97, 80001];

/// Inbound call envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub payload: Value,
}

impl CallRequest {
    pub fn new(method: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            method: method.into(),
            payload,
        }
    }
}

/// Outbound envelope: the result, or `{error, code, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub id: Option<u64>,
    pub success: bool,
    pub payload: Value,
}

impl CallResponse {
    pub fn from_result(id: Option<u64>, result: ConnectResult<Value>) -> Self {
        match result {
            Ok(payload) => Self {
                id,
                success: true,
                payload,
            },
            Err(error) => Self {
                id,
                success: false,
                payload: json!({
                    "error": error.message,
                    "code": error.code.as_u32(),
                    "params": error.params,
                }),
            },
        }
    }

    pub fn error_code(&self) -> Option<u32> {
        if self.success {
            return None;
        }
        self.payload
            .get("code")
            .and_then(Value::as_u64)
            .map(|code| code as u32)
    }
}

pub struct CoreBuilder {
    transport: Arc<dyn Transport>,
    settings: ConnectSettings,
    registry: MethodRegistry,
    sessions: Arc<dyn SessionStore>,
    remote_source: Arc<dyn ConfigSource>,
}

impl CoreBuilder {
    pub fn settings(mut self, settings: ConnectSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(mut self, registry: MethodRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn remote_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.remote_source = source;
        self
    }

    pub fn build(self) -> Core {
        let events = EventBus::new();
        let prompts = Arc::new(PromptHub::new(events.clone()));
        let queue = Arc::new(RequestQueue::new());
        let device_ctx = Arc::new(DeviceContext {
            transport: self.transport,
            prompter: prompts.clone(),
            sessions: self.sessions,
            queue: queue.clone(),
            events: events.clone(),
            initialize_timeout: self.settings.initialize_timeout(),
        });
        let remote = Arc::new(RemoteConfigStore::new(
            self.remote_source,
            self.settings.remote_refresh(),
        ));
        Core {
            inner: Arc::new(CoreInner {
                settings: Arc::new(self.settings),
                registry: self.registry,
                devices: Arc::new(DeviceList::new(device_ctx)),
                prompts,
                remote,
                events,
                queue,
                admission: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

struct CoreInner {
    settings: Arc<ConnectSettings>,
    registry: MethodRegistry,
    devices: Arc<DeviceList>,
    prompts: Arc<PromptHub>,
    remote: Arc<RemoteConfigStore>,
    events: EventBus,
    queue: Arc<RequestQueue>,
    admission: tokio::sync::Mutex<()>,
}

/// Call orchestrator. Clones share the same devices, queue and events.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    pub fn builder(transport: Arc<dyn Transport>) -> CoreBuilder {
        CoreBuilder {
            transport,
            settings: ConnectSettings::default(),
            registry: MethodRegistry::with_builtin(),
            sessions: Arc::new(MemorySessionStore::new()),
            remote_source: Arc::new(StaticConfigSource::default()),
        }
    }

    pub fn settings(&self) -> &ConnectSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.events.subscribe()
    }

    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.inner
            .devices
            .all()
            .iter()
            .map(|device| device.summary())
            .collect()
    }

    /// Feeds a host answer to the pending prompt it belongs to.
    pub fn handle_ui_response(&self, response: UiResponse) -> bool {
        self.inner.prompts.resolve(response)
    }

    pub async fn call(&self, request: CallRequest) -> CallResponse {
        let result = self.call_api(&request.method, request.payload).await;
        if let Err(error) = &result {
            debug!(method = %request.method, code = error.code.as_u32(), "call failed: {error}");
        }
        CallResponse::from_result(request.id, result)
    }

    async fn call_api(&self, name: &str, payload: Value) -> ConnectResult<Value> {
        let mut method = self.inner.registry.create(name, payload)?;

        if !method.use_device() {
            let ctx = self.method_context(0, None, AbortSignal::never());
            let result = method.run(&ctx).await;
            method.dispose();
            return result;
        }

        let (handle, deferred) = {
            let _admission = self.inner.admission.lock().await;
            self.inner
                .queue
                .create_task(name, method.params().connect_id.as_deref())
        };
        let mut connect_id = method.params().connect_id.clone();

        let result = self
            .execute(method.as_mut(), &handle, &mut connect_id)
            .await;

        self.finalize(method.as_mut(), handle.id, connect_id, result);
        deferred
            .await
            .unwrap_or_else(|_| Err(ConnectError::runtime("request was dropped")))
    }

    /// Runs after every queued call, whatever its outcome. A request already
    /// settled by an interrupt keeps its first result.
    fn finalize(
        &self,
        method: &mut dyn Method,
        request_id: u64,
        connect_id: Option<String>,
        result: ConnectResult<Value>,
    ) {
        method.dispose();
        match result {
            Ok(value) => self.inner.queue.resolve_request(request_id, value),
            Err(error) => self.inner.queue.reject_request(request_id, error),
        }
        if let Some(connect_id) = &connect_id {
            self.inner.prompts.cancel(connect_id);
        }
        self.inner
            .events
            .emit(Notification::ClosePromptWindow { connect_id });
    }

    fn method_context(
        &self,
        request_id: u64,
        device: Option<Arc<Device>>,
        signal: AbortSignal,
    ) -> MethodContext {
        MethodContext {
            request_id,
            device,
            devices: self.inner.devices.clone(),
            events: self.inner.events.clone(),
            signal,
            settings: self.inner.settings.clone(),
            remote: self.inner.remote.clone(),
            queue: self.inner.queue.clone(),
        }
    }

    async fn execute(
        &self,
        method: &mut dyn Method,
        handle: &RequestHandle,
        bound_connect_id: &mut Option<String>,
    ) -> ConnectResult<Value> {
        let params = method.params().clone();
        let device = self
            .ensure_connected(&params, method.is_firmware_update(), &handle.signal)
            .await?;
        let connect_id = device.connect_id();
        self.inner.queue.set_connect_id(handle.id, &connect_id);
        *bound_connect_id = Some(connect_id.clone());

        if self.inner.queue.has_pending_callback_task(&connect_id) {
            debug!(connect_id = %connect_id, "waiting for pending callback task");
        }
        tokio::select! {
            _ = self.inner.queue.wait_for_pending_callback_tasks(&connect_id) => {}
            _ = handle.signal.aborted() => {
                return Err(ConnectError::new(HardwareErrorCode::ActionCancelled));
            }
        }

        let ctx = self.method_context(handle.id, Some(device.clone()), handle.signal.clone());
        let options = RunOptions {
            keep_session: params.keep_session,
            init_session: params.init_session,
            passphrase_state: params.passphrase_state.clone(),
            use_empty_passphrase: params.use_empty_passphrase,
            signal: Some(handle.signal.clone()),
        };
        let body = async {
            self.gate(&*method, &device, &params).await?;
            let _callback = method
                .is_callback_task()
                .then(|| self.inner.queue.register_pending_callback_task(&connect_id));
            method.run(&ctx).await
        };
        device
            .run(options, Some(body))
            .await?
            .ok_or_else(|| ConnectError::new(HardwareErrorCode::CallMethodNotResponse))
    }

    /// Polls enumeration until the requested device shows up.
    ///
    /// The interval grows by half after every miss; bridge failures and
    /// cancellation end the loop at once.
    async fn ensure_connected(
        &self,
        params: &CommonParams,
        firmware_update: bool,
        signal: &AbortSignal,
    ) -> ConnectResult<Arc<Device>> {
        let settings = &self.inner.settings;
        let retries = params.retry_count.unwrap_or(settings.retry_count);
        let mut interval =
            Duration::from_millis(params.poll_interval_time.unwrap_or(settings.poll_interval_time_ms));
        let attempt_timeout = Duration::from_millis(params.timeout.unwrap_or(settings.timeout_ms));

        for attempt in 0..=retries {
            signal.check(HardwareErrorCode::PollingStop)?;
            match timeout(attempt_timeout, self.inner.devices.refresh()).await {
                Ok(Ok(devices)) => {
                    if let Some(device) = self.pick_device(devices, params, firmware_update).await? {
                        return Ok(device);
                    }
                    debug!(attempt, "requested device not connected yet");
                }
                Ok(Err(error)) if is_bridge_unavailable(&error) => return Err(error),
                Ok(Err(error)) => warn!(attempt, "enumeration failed: {error}"),
                Err(_) => warn!(attempt, "enumeration timed out"),
            }
            if attempt < retries {
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = signal.aborted() => return Err(ConnectError::new(HardwareErrorCode::PollingStop)),
                }
                interval = interval.mul_f64(1.5);
            }
        }
        Err(ConnectError::new(HardwareErrorCode::DeviceNotFound))
    }

    async fn pick_device(
        &self,
        devices: Vec<Arc<Device>>,
        params: &CommonParams,
        firmware_update: bool,
    ) -> ConnectResult<Option<Arc<Device>>> {
        if let Some(connect_id) = &params.connect_id {
            return Ok(devices.into_iter().find(|d| d.connect_id() == *connect_id));
        }
        if let Some(device_id) = &params.device_id {
            return Ok(devices
                .into_iter()
                .find(|d| d.device_id().as_deref() == Some(device_id.as_str())));
        }
        match devices.len() {
            0 => Ok(None),
            1 => Ok(devices.into_iter().next()),
            _ if self.inner.settings.select_device_prompt => {
                let summaries = devices.iter().map(|device| device.summary()).collect();
                let chosen = self.inner.prompts.select_device(summaries).await.ok_or_else(
                    || ConnectError::new(HardwareErrorCode::ActionCancelled),
                )?;
                Ok(devices.into_iter().find(|d| d.connect_id() == chosen))
            }
            _ => {
                let code = if firmware_update {
                    HardwareErrorCode::FirmwareUpdateSelectDevice
                } else {
                    HardwareErrorCode::SelectDevice
                };
                let connect_ids: Vec<String> = devices.iter().map(|d| d.connect_id()).collect();
                Err(ConnectError::new(code).params(json!({ "devices": connect_ids })))
            }
        }
    }

    /// Compatibility and safety checks between handshake and method body.
    async fn gate(
        &self,
        method: &dyn Method,
        device: &Device,
        params: &CommonParams,
    ) -> ConnectResult<()> {
        let features = device
            .features()
            .ok_or_else(|| ConnectError::new(HardwareErrorCode::DeviceInitializeFailed))?;
        let config = self.inner.remote.check_and_reload().await;
        let device_type = features.device_type();

        if config.is_defective(&features) {
            return Err(ConnectError::new(HardwareErrorCode::DefectiveFirmware).params(json!({
                "serialNo": features.onekey_serial_no,
            })));
        }
        let status = config.firmware_status(&features);
        let latest = config.latest_firmware(device_type);
        if status == FirmwareStatus::Required && !method.skip_force_update_check() {
            return Err(ConnectError::new(HardwareErrorCode::NewFirmwareForceUpdate).params(json!({
                "current": features.firmware_version().map(|v| v.to_string()),
                "require": latest.map(|release| release.version.clone()),
            })));
        }
        self.inner.events.emit(Notification::FirmwareRelease {
            device: device.summary(),
            status,
            release: latest.map(|release| json!(release)),
        });

        let latest_version = latest.and_then(|release| release.parsed_version());
        check_version_range(&features, &method.version_ranges(), latest_version.as_ref())?;
        check_device_mode(
            &features,
            method.allow_device_mode(),
            method.require_device_mode(),
        )?;

        if method.check_device_id()
            && let Some(expected) = &params.device_id
            && features.device_id.as_deref() != Some(expected.as_str())
        {
            return Err(ConnectError::new(HardwareErrorCode::DeviceCheckDeviceIdError));
        }

        if method.use_device_passphrase_state() {
            check_passphrase_enabled(
                &features,
                true,
                params.passphrase_state.as_deref(),
                params.use_empty_passphrase,
            )?;
            if features.passphrase_enabled() && !params.skip_passphrase_check {
                device
                    .check_passphrase_state_safety(params.passphrase_state.as_deref())
                    .await?;
            }
        }

        if let Some(chain_id) = method.relax_safety_checks()
            && RELAXED_SAFETY_CHAIN_IDS.contains(&chain_id)
            && features.safety_checks.as_deref() == Some("Strict")
        {
            info!(connect_id = %device.connect_id(), chain_id, "relaxing safety checks");
            device
                .typed_call(
                    "ApplySettings",
                    &["Success"],
                    json!({ "safety_checks": "PromptTemporarily" }),
                )
                .await?;
        }
        Ok(())
    }

    /// Cancels work for one connection, or for everything when `None`.
    ///
    /// Devices are interrupted before request tokens trip so a call blocked
    /// on the transport unwinds instead of waiting for its answer.
    pub async fn cancel(&self, connect_id: Option<&str>) {
        let inner = &self.inner;
        match connect_id {
            Some(connect_id) => {
                info!(connect_id, "cancel requested");
                if let Some(device) = inner.devices.find(connect_id) {
                    device.interrupt_from_user().await;
                }
                inner.queue.abort_requests_by_connect_id(connect_id);
                inner.prompts.cancel(connect_id);
                inner.queue.cancel_callback_tasks(Some(connect_id));
            }
            None => {
                info!("cancel requested for all devices");
                for device in inner.devices.devices_with_access() {
                    if device.is_running() {
                        device.interrupt_from_user().await;
                    }
                }
                inner.queue.abort_all_requests();
                inner.prompts.cancel_all();
                inner.queue.cancel_callback_tasks(None);
            }
        }
    }

    pub async fn dispose(&self) {
        self.cancel(None).await;
        self.inner.devices.clear();
    }
}

fn is_bridge_unavailable(error: &ConnectError) -> bool {
    matches!(
        error.code,
        HardwareErrorCode::BridgeNotInstalled
            | HardwareErrorCode::BridgeTimeoutError
            | HardwareErrorCode::BridgeNeedsPermission
    )
}
