use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine;
use connect_transport::{
    AcquireInput, Descriptor, Message, Transport, TransportError, TransportKind, TransportResult,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::events::DeviceSummary;

pub fn summary(connect_id: &str) -> DeviceSummary {
    DeviceSummary {
        connect_id: connect_id.into(),
        device_id: None,
        path: connect_id.into(),
        name: None,
        transport: TransportKind::Usb,
        features: None,
    }
}

pub fn pro_features(device_id: &str) -> Value {
    json!({
        "vendor": "onekey.so",
        "major_version": 4,
        "minor_version": 10,
        "patch_version": 0,
        "initialized": true,
        "unlocked": true,
        "passphrase_protection": false,
        "device_id": device_id,
        "model": "T",
        "onekey_device_type": "PRO",
        "onekey_firmware_version": "4.10.0",
        "onekey_ble_version": "2.3.0",
        "onekey_boot_version": "2.5.0",
        "onekey_serial_no": "PRA1000001",
        "safety_checks": "Strict"
    })
}

/// Scripted device behind [`MockTransport`].
///
/// Messages without a script get a plausible default answer; scripted
/// answers are consumed in order per request name.
pub struct MockDevice {
    pub path: String,
    features: Mutex<Value>,
    scripts: Mutex<HashMap<String, VecDeque<TransportResult<Message>>>>,
    transitions: Mutex<HashMap<String, Value>>,
    blocked: Mutex<HashMap<String, Arc<Notify>>>,
    passphrase_state: Mutex<Option<String>>,
    sent: Mutex<Vec<Message>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockDevice {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.into(),
            features: Mutex::new(pro_features(&format!("{path}-id"))),
            scripts: Mutex::new(HashMap::new()),
            transitions: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashMap::new()),
            passphrase_state: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn features(self, patch: Value) -> Self {
        self.patch_features(patch);
        self
    }

    pub fn patch_features(&self, patch: Value) {
        let mut features = self.features.lock();
        if let (Some(target), Some(patch)) = (features.as_object_mut(), patch.as_object()) {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn script(self, name: &str, responses: Vec<TransportResult<Message>>) -> Self {
        self.scripts
            .lock()
            .entry(name.to_string())
            .or_default()
            .extend(responses);
        self
    }

    pub fn push(&self, name: &str, response: TransportResult<Message>) {
        self.scripts
            .lock()
            .entry(name.to_string())
            .or_default()
            .push_back(response);
    }

    /// After answering `name`, the device reports `features` patched in.
    pub fn transition(self, name: &str, patch: Value) -> Self {
        self.transitions.lock().insert(name.to_string(), patch);
        self
    }

    /// Holds `name` until the returned notify fires or the transport cancels.
    pub fn block(&self, name: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.blocked.lock().insert(name.to_string(), notify.clone());
        notify
    }

    pub fn set_passphrase_state(&self, state: Option<&str>) {
        *self.passphrase_state.lock() = state.map(str::to_string);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    fn default_response(&self, message: &Message) -> TransportResult<Message> {
        let response = match message.name.as_str() {
            "Initialize" | "GetFeatures" => Message::new("Features", self.features.lock().clone()),
            "GetPassphraseState" => Message::new(
                "PassphraseState",
                json!({
                    "passphrase_state": self.passphrase_state.lock().clone(),
                    "session_id": format!("{}-session", self.path),
                    "unlocked_attach_pin": false
                }),
            ),
            "Cancel" => Message::new(
                "Failure",
                json!({ "code": "Failure_ActionCancelled", "message": "Cancelled" }),
            ),
            "EmmcFileWrite" => self.write_file(message)?,
            _ => Message::new("Success", json!({})),
        };
        Ok(response)
    }

    fn write_file(&self, message: &Message) -> TransportResult<Message> {
        let file = message.body.get("file").cloned().unwrap_or_default();
        let path = file["path"].as_str().unwrap_or_default().to_string();
        let data = base64::engine::general_purpose::STANDARD
            .decode(file["data"].as_str().unwrap_or_default())
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let offset = file["offset"].as_u64().unwrap_or(0) as usize;
        let mut files = self.files.lock();
        let content = files.entry(path.clone()).or_default();
        if message.field_bool("overwrite") == Some(true) {
            content.clear();
        }
        content.truncate(offset);
        content.extend_from_slice(&data);
        Ok(Message::new(
            "EmmcFile",
            json!({ "path": path, "len": file["len"], "offset": offset, "processed_byte": data.len() }),
        ))
    }

    fn respond(&self, message: &Message) -> TransportResult<Message> {
        self.sent.lock().push(message.clone());
        let scripted = self
            .scripts
            .lock()
            .get_mut(&message.name)
            .and_then(VecDeque::pop_front);
        let response = match scripted {
            Some(response) => response,
            None => self.default_response(message),
        };
        if let Some(patch) = self.transitions.lock().get(&message.name).cloned() {
            self.patch_features(patch);
        }
        response
    }
}

#[derive(Default)]
struct TransportState {
    sessions: HashMap<String, String>,
    acquired: Vec<String>,
    released: Vec<String>,
    posted: Vec<Message>,
    enumerate_errors: VecDeque<TransportError>,
    acquire_errors: VecDeque<TransportError>,
}

pub struct MockTransport {
    kind: TransportKind,
    devices: Mutex<Vec<Arc<MockDevice>>>,
    state: Mutex<TransportState>,
    next_session: AtomicU64,
    enumerations: AtomicUsize,
    cancels: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            devices: Mutex::new(Vec::new()),
            state: Mutex::new(TransportState::default()),
            next_session: AtomicU64::new(1),
            enumerations: AtomicUsize::new(0),
            cancels: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_device(device: MockDevice) -> Arc<Self> {
        let transport = Self::new(TransportKind::Usb);
        transport.add(device);
        transport
    }

    pub fn add(&self, device: MockDevice) -> Arc<MockDevice> {
        let device = Arc::new(device);
        self.devices.lock().push(device.clone());
        device
    }

    pub fn remove(&self, path: &str) {
        self.devices.lock().retain(|device| device.path != path);
    }

    pub fn device(&self, path: &str) -> Arc<MockDevice> {
        self.find(path).expect("mock device")
    }

    fn find(&self, path: &str) -> Option<Arc<MockDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|device| device.path == path)
            .cloned()
    }

    pub fn fail_enumerate(&self, error: TransportError, times: usize) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.enumerate_errors.push_back(error.clone());
        }
    }

    pub fn fail_acquire(&self, error: TransportError) {
        self.state.lock().acquire_errors.push_back(error);
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    pub fn calls(&self, path: &str) -> Vec<String> {
        self.sent(path).into_iter().map(|m| m.name).collect()
    }

    pub fn sent(&self, path: &str) -> Vec<Message> {
        self.find(path)
            .map(|device| device.sent.lock().clone())
            .unwrap_or_default()
    }

    pub fn acquired(&self) -> Vec<String> {
        self.state.lock().acquired.clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.state.lock().released.clone()
    }

    pub fn posted(&self) -> Vec<String> {
        self.state
            .lock()
            .posted
            .iter()
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn live_session(&self, path: &str) -> Option<String> {
        self.state.lock().sessions.get(path).cloned()
    }

    fn cancel_notify(&self, path: &str) -> Arc<Notify> {
        self.cancels.lock().entry(path.to_string()).or_default().clone()
    }

    fn path_for_session(&self, session: &str) -> TransportResult<String> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|(_, live)| live.as_str() == session)
            .map(|(path, _)| path.clone())
            .ok_or(TransportError::SessionNotFound)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn enumerate(&self) -> TransportResult<Vec<Descriptor>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(error) = state.enumerate_errors.pop_front() {
            return Err(error);
        }
        let devices = self.devices.lock();
        Ok(devices
            .iter()
            .map(|device| {
                let mut descriptor = Descriptor::new(device.path.clone(), self.kind);
                descriptor.session = state.sessions.get(&device.path).cloned();
                descriptor
            })
            .collect())
    }

    async fn acquire(&self, input: AcquireInput) -> TransportResult<String> {
        let mut state = self.state.lock();
        if let Some(error) = state.acquire_errors.pop_front() {
            return Err(error);
        }
        if self.find(&input.path).is_none() {
            return Err(TransportError::DeviceNotFound(input.path));
        }
        let session = self.next_session.fetch_add(1, Ordering::SeqCst).to_string();
        state.sessions.insert(input.path.clone(), session.clone());
        state.acquired.push(input.path);
        Ok(session)
    }

    async fn release(&self, session: &str, _on_close: bool) -> TransportResult<()> {
        let path = self.path_for_session(session)?;
        let mut state = self.state.lock();
        state.sessions.remove(&path);
        state.released.push(path);
        Ok(())
    }

    async fn call(&self, session: &str, message: Message) -> TransportResult<Message> {
        let path = self.path_for_session(session)?;
        let device = self
            .find(&path)
            .ok_or_else(|| TransportError::DeviceNotFound(path.clone()))?;
        let gate = device.blocked.lock().remove(&message.name);
        if let Some(gate) = gate {
            let cancel = self.cancel_notify(&path);
            device.sent.lock().push(message.clone());
            tokio::select! {
                _ = gate.notified() => {}
                _ = cancel.notified() => return Err(TransportError::Cancelled),
            }
            device.sent.lock().pop();
        }
        device.respond(&message)
    }

    async fn post(&self, session: &str, message: Message) -> TransportResult<()> {
        self.path_for_session(session)?;
        self.state.lock().posted.push(message);
        Ok(())
    }

    async fn cancel(&self, session: &str) -> TransportResult<()> {
        let path = self.path_for_session(session)?;
        self.cancel_notify(&path).notify_waiters();
        Ok(())
    }
}
