use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use connect_transport::{Message, Transport};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{ConnectError, ConnectResult, HardwareErrorCode};
use crate::events::DeviceSummary;
use crate::features::{Features, fix_features};
use crate::prompts::{DevicePrompter, PassphraseAnswer, PinAnswer};
use crate::queue::AbortSignal;

pub const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

const IDLE: u8 = 0;
const ON_TRANSPORT: u8 = 1;
const ON_PROMPT: u8 = 2;

/// Maps a device `Failure` message to the error taxonomy.
pub fn map_failure(message: &Message) -> ConnectError {
    let code = message.field_str("code").unwrap_or_default();
    let text = message.field_str("message").unwrap_or_default();
    let lower = text.to_ascii_lowercase();

    if lower.contains("device disconnected") {
        return ConnectError::with_message(HardwareErrorCode::BridgeDeviceDisconnected, text);
    }
    match code {
        "Failure_ActionCancelled" => ConnectError::new(HardwareErrorCode::ActionCancelled),
        "Failure_PinInvalid" | "Failure_PinMismatch" => {
            ConnectError::new(HardwareErrorCode::PinInvalid)
        }
        "Failure_PinCancelled" => ConnectError::new(HardwareErrorCode::PinCancelled),
        "Failure_UnexpectedPassphrase" => ConnectError::new(HardwareErrorCode::UnexpectPassphrase),
        "Failure_FirmwareError" if text.is_empty() => {
            ConnectError::new(HardwareErrorCode::FirmwareError)
        }
        "Failure_DataError" if lower.contains("blindsign enabled") => {
            ConnectError::new(HardwareErrorCode::BlindSignDisabled)
        }
        "Failure_UnexpectedMessage" if lower.contains("not in signing mode") => {
            ConnectError::new(HardwareErrorCode::NotInSigningMode)
        }
        "Failure_ProcessError"
            if lower.contains("firmware verification failed") || lower.contains("verify failed") =>
        {
            ConnectError::with_message(HardwareErrorCode::FirmwareVerificationFailed, text)
        }
        _ => {
            let message = if text.is_empty() { code } else { text };
            ConnectError::runtime(message).params(json!({ "failureCode": code }))
        }
    }
}

/// Typed message exchange for one acquired transport session.
///
/// Interactive sub-protocols (button, PIN, passphrase) are resolved inside
/// [`DeviceCommands::typed_call`], so callers only see the final response.
pub struct DeviceCommands {
    transport: Arc<dyn Transport>,
    session: String,
    prompter: Arc<dyn DevicePrompter>,
    summary: RwLock<DeviceSummary>,
    preset_passphrase: Mutex<Option<String>>,
    signal: RwLock<AbortSignal>,
    disposed: AtomicBool,
    interrupt_reason: Mutex<Option<HardwareErrorCode>>,
    phase: AtomicU8,
    in_flight: tokio::sync::Mutex<()>,
}

impl DeviceCommands {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: String,
        prompter: Arc<dyn DevicePrompter>,
        summary: DeviceSummary,
    ) -> Self {
        Self {
            transport,
            session,
            prompter,
            summary: RwLock::new(summary),
            preset_passphrase: Mutex::new(None),
            signal: RwLock::new(AbortSignal::never()),
            disposed: AtomicBool::new(false),
            interrupt_reason: Mutex::new(None),
            phase: AtomicU8::new(IDLE),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Waiting on a PIN or passphrase answer from the host.
    pub fn is_prompting(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == ON_PROMPT
    }

    pub fn set_summary(&self, summary: DeviceSummary) {
        *self.summary.write() = summary;
    }

    /// Answer passphrase requests with `passphrase` instead of prompting.
    pub fn set_preset_passphrase(&self, passphrase: Option<String>) {
        *self.preset_passphrase.lock() = passphrase;
    }

    /// Binds the cancellation token of the request currently using the device.
    pub fn set_abort_signal(&self, signal: AbortSignal) {
        *self.signal.write() = signal;
    }

    fn abort_signal(&self) -> AbortSignal {
        self.signal.read().clone()
    }

    pub async fn typed_call(
        &self,
        request: &str,
        accept: &[&str],
        payload: Value,
    ) -> ConnectResult<Message> {
        self.abort_signal()
            .check(HardwareErrorCode::ActionCancelled)?;
        if self.is_disposed() {
            let code = (*self.interrupt_reason.lock())
                .unwrap_or(HardwareErrorCode::DeviceInterruptedFromOutside);
            return Err(ConnectError::new(code));
        }
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Err(ConnectError::with_message(
                HardwareErrorCode::DeviceBusy,
                "another call is in flight on this device",
            ));
        };

        let response = self.common_call(request, payload).await;
        self.phase.store(IDLE, Ordering::SeqCst);
        let response = response?;

        if accept.is_empty() || accept.contains(&response.name.as_str()) {
            return Ok(response);
        }
        if response
            .field_str("message")
            .is_some_and(|m| m.to_ascii_lowercase().contains("device disconnected"))
        {
            return Err(ConnectError::new(HardwareErrorCode::BridgeDeviceDisconnected));
        }
        Err(ConnectError::with_message(
            HardwareErrorCode::ResponseUnexpectTypeError,
            format!(
                "Response of unexpected type: {}. Should be {}",
                response.name,
                accept.join("|")
            ),
        ))
    }

    async fn call(&self, name: &str, payload: Value) -> ConnectResult<Message> {
        debug!(session = %self.session, message = name, "device call");
        self.phase.store(ON_TRANSPORT, Ordering::SeqCst);
        let response = self
            .transport
            .call(&self.session, Message::new(name, payload))
            .await?;
        debug!(session = %self.session, response = %response.name, "device response");
        Ok(response)
    }

    async fn common_call(&self, name: &str, payload: Value) -> ConnectResult<Message> {
        let mut response = self.call(name, payload).await?;
        loop {
            response = match response.name.as_str() {
                "Failure" => return Err(map_failure(&response)),
                "Features" => {
                    let features = Features::from_value(&response.body).ok_or_else(|| {
                        ConnectError::runtime("device returned malformed features")
                    })?;
                    let fixed = fix_features(features);
                    return Ok(Message::new("Features", fixed.to_value()));
                }
                "ButtonRequest" => {
                    let code = response.field_str("code").map(str::to_string);
                    let summary = self.summary.read().clone();
                    self.prompter.button(&summary, code.as_deref());
                    self.call("ButtonAck", json!({})).await?
                }
                "PinMatrixRequest" => {
                    let kind = response
                        .field_str("type")
                        .unwrap_or("PinMatrixRequestType_Current")
                        .to_string();
                    let summary = self.summary.read().clone();
                    self.phase.store(ON_PROMPT, Ordering::SeqCst);
                    let signal = self.abort_signal();
                    let answer = tokio::select! {
                        _ = signal.aborted() => Err(ConnectError::new(HardwareErrorCode::ActionCancelled)),
                        answer = self.prompter.request_pin(&summary, &kind) => answer,
                    };
                    match answer {
                        Ok(PinAnswer::OnDevice) => {
                            self.call("BixinPinInputOnDevice", json!({})).await?
                        }
                        Ok(PinAnswer::Pin(pin)) => {
                            self.call("PinMatrixAck", json!({ "pin": pin })).await?
                        }
                        Err(error) => self.cancel_on_device(error).await?,
                    }
                }
                "PassphraseRequest" => {
                    let exists_attach_pin_user = response
                        .field_bool("exists_attach_pin_user")
                        .unwrap_or(false);
                    let preset = self.preset_passphrase.lock().clone();
                    let answer = match preset {
                        Some(value) => Ok(PassphraseAnswer {
                            value,
                            ..Default::default()
                        }),
                        None => {
                            let summary = self.summary.read().clone();
                            self.phase.store(ON_PROMPT, Ordering::SeqCst);
                            let signal = self.abort_signal();
                            tokio::select! {
                                _ = signal.aborted() => Err(ConnectError::new(HardwareErrorCode::ActionCancelled)),
                                answer = self.prompter.request_passphrase(&summary, exists_attach_pin_user) => answer,
                            }
                        }
                    };
                    match answer {
                        Ok(answer) if answer.attach_pin_on_device => {
                            self.call("PassphraseAck", json!({ "on_device_attach_pin": true }))
                                .await?
                        }
                        Ok(answer) if answer.on_device => {
                            let summary = self.summary.read().clone();
                            self.prompter.passphrase_on_device(&summary);
                            self.call("PassphraseAck", json!({ "on_device": true })).await?
                        }
                        Ok(answer) => {
                            self.call("PassphraseAck", json!({ "passphrase": answer.value }))
                                .await?
                        }
                        Err(error) => self.cancel_on_device(error).await?,
                    }
                }
                _ => return Ok(response),
            };
        }
    }

    /// Tells the device the prompt was abandoned. The device answers with a
    /// `Failure`, which the caller's loop maps; if even that exchange fails,
    /// the prompt error is reported.
    async fn cancel_on_device(&self, prompt_error: ConnectError) -> ConnectResult<Message> {
        debug!(session = %self.session, "prompt abandoned: {prompt_error}");
        match self.call("Cancel", json!({})).await {
            Ok(response) => Ok(response),
            Err(error) => {
                warn!(session = %self.session, "device cancel failed: {error}");
                Err(prompt_error)
            }
        }
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// Disposes and aborts whatever the transport is doing for this session,
    /// then waits (bounded) for the in-flight call to unwind. Later calls
    /// fail with `reason`.
    pub async fn cancel(&self, reason: HardwareErrorCode) {
        {
            let mut current = self.interrupt_reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.phase.load(Ordering::SeqCst) != ON_TRANSPORT {
            return;
        }
        let abort = async {
            if let Err(error) = self
                .transport
                .post(&self.session, Message::empty("Cancel"))
                .await
            {
                warn!(session = %self.session, "posting cancel failed: {error}");
            }
            if let Err(error) = self.transport.cancel(&self.session).await {
                warn!(session = %self.session, "transport cancel failed: {error}");
            }
            let _ = self.in_flight.lock().await;
        };
        if timeout(CANCEL_TIMEOUT, abort).await.is_err() {
            warn!(session = %self.session, "cancel timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::prompts::PromptHub;
    use crate::queue::RequestQueue;
    use crate::testing::{MockDevice, MockTransport, summary};
    use connect_transport::AcquireInput;

    async fn commands(
        transport: Arc<MockTransport>,
        prompter: Arc<dyn DevicePrompter>,
    ) -> DeviceCommands {
        let session = transport
            .acquire(AcquireInput {
                path: "dev-1".into(),
                previous_session: None,
                id: None,
            })
            .await
            .unwrap();
        DeviceCommands::new(transport, session, prompter, summary("dev-1"))
    }

    #[test]
    fn failure_taxonomy() {
        let failure = |code: &str, text: &str| {
            map_failure(&Message::new(
                "Failure",
                json!({ "code": code, "message": text }),
            ))
        };
        assert!(failure("Failure_ActionCancelled", "").is(HardwareErrorCode::ActionCancelled));
        assert!(failure("Failure_PinInvalid", "").is(HardwareErrorCode::PinInvalid));
        assert!(failure("Failure_PinCancelled", "").is(HardwareErrorCode::PinCancelled));
        assert!(
            failure("Failure_DataError", "Please confirm the BlindSign enabled")
                .is(HardwareErrorCode::BlindSignDisabled)
        );
        assert!(
            failure("Failure_UnexpectedMessage", "Not in Signing mode")
                .is(HardwareErrorCode::NotInSigningMode)
        );
        assert!(
            failure("Failure_ProcessError", "Firmware verification failed")
                .is(HardwareErrorCode::FirmwareVerificationFailed)
        );
        assert!(
            failure("Failure_Busy", "Device disconnected during action")
                .is(HardwareErrorCode::BridgeDeviceDisconnected)
        );
        let other = failure("Failure_Other", "boom");
        assert!(other.is(HardwareErrorCode::RuntimeError));
        assert_eq!(other.message, "boom");
    }

    #[tokio::test]
    async fn button_requests_are_acknowledged() {
        let device = MockDevice::new("dev-1").script(
            "GetAddress",
            vec![Ok(Message::new(
                "ButtonRequest",
                json!({ "code": "ButtonRequest_Address" }),
            ))],
        );
        device.push("ButtonAck", Ok(Message::new("Address", json!({ "address": "x" }))));
        let transport = MockTransport::with_device(device);
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let commands = commands(transport.clone(), Arc::new(PromptHub::new(bus))).await;

        let response = commands
            .typed_call("GetAddress", &["Address"], json!({}))
            .await
            .unwrap();
        assert_eq!(response.field_str("address"), Some("x"));
        assert_eq!(transport.calls("dev-1"), vec!["GetAddress", "ButtonAck"]);
        assert!(matches!(
            events.recv().await.unwrap(),
            crate::events::Notification::RequestButton { .. }
        ));
    }

    #[tokio::test]
    async fn pin_entry_on_device_uses_sentinel_message() {
        let device = MockDevice::new("dev-1").script(
            "GetAddress",
            vec![Ok(Message::new(
                "PinMatrixRequest",
                json!({ "type": "PinMatrixRequestType_Current" }),
            ))],
        );
        device.push("BixinPinInputOnDevice", Ok(Message::new("Address", json!({}))));
        let transport = MockTransport::with_device(device);
        let hub = Arc::new(PromptHub::new(EventBus::new()));
        let commands = Arc::new(commands(transport.clone(), hub.clone()).await);

        let call = {
            let commands = commands.clone();
            tokio::spawn(async move { commands.typed_call("GetAddress", &["Address"], json!({})).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while !hub.has_pending("dev-1") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("pin prompt was not raised");
        hub.resolve(crate::events::UiResponse::ReceivePin {
            connect_id: Some("dev-1".into()),
            pin: crate::prompts::PIN_ON_DEVICE.into(),
        });
        call.await.unwrap().unwrap();
        assert_eq!(
            transport.calls("dev-1"),
            vec!["GetAddress", "BixinPinInputOnDevice"]
        );
    }

    #[tokio::test]
    async fn preset_passphrase_skips_prompt() {
        let device = MockDevice::new("dev-1").script(
            "GetAddress",
            vec![Ok(Message::new("PassphraseRequest", json!({})))],
        );
        device.push("PassphraseAck", Ok(Message::new("Address", json!({}))));
        let transport = MockTransport::with_device(device);
        let commands = commands(transport.clone(), Arc::new(PromptHub::new(EventBus::new()))).await;
        commands.set_preset_passphrase(Some(String::new()));

        commands
            .typed_call("GetAddress", &["Address"], json!({}))
            .await
            .unwrap();
        let sent = transport.sent("dev-1");
        assert_eq!(sent[1].body, json!({ "passphrase": "" }));
    }

    #[tokio::test]
    async fn unexpected_response_type() {
        let device = MockDevice::new("dev-1")
            .script("GetAddress", vec![Ok(Message::new("Success", json!({})))]);
        let transport = MockTransport::with_device(device);
        let commands = commands(transport, Arc::new(PromptHub::new(EventBus::new()))).await;
        let err = commands
            .typed_call("GetAddress", &["Address"], json!({}))
            .await
            .unwrap_err();
        assert!(err.is(HardwareErrorCode::ResponseUnexpectTypeError));
    }

    #[tokio::test]
    async fn tripped_signal_wins_over_disposal() {
        let transport = MockTransport::with_device(MockDevice::new("dev-1"));
        let commands = commands(transport.clone(), Arc::new(PromptHub::new(EventBus::new()))).await;
        let queue = RequestQueue::new();
        let (handle, _deferred) = queue.create_task("getAddress", Some("dev-1"));
        commands.set_abort_signal(handle.signal.clone());

        commands.dispose();
        let err = commands
            .typed_call("GetAddress", &["Address"], json!({}))
            .await
            .err()
            .unwrap();
        assert!(err.is(HardwareErrorCode::DeviceInterruptedFromOutside));

        queue.abort_request(handle.id);
        let err = commands
            .typed_call("GetAddress", &["Address"], json!({}))
            .await
            .err()
            .unwrap();
        assert!(err.is(HardwareErrorCode::ActionCancelled));
        assert!(transport.calls("dev-1").is_empty());
    }

    #[tokio::test]
    async fn disposed_commands_fail_fast() {
        let transport = MockTransport::with_device(MockDevice::new("dev-1"));
        let commands = commands(transport.clone(), Arc::new(PromptHub::new(EventBus::new()))).await;
        commands
            .cancel(HardwareErrorCode::DeviceInterruptedFromUser)
            .await;
        assert!(commands.is_disposed());
        let err = commands
            .typed_call("GetFeatures", &["Features"], json!({}))
            .await
            .err()
            .unwrap();
        assert!(err.is(HardwareErrorCode::DeviceInterruptedFromUser));
        assert!(transport.calls("dev-1").is_empty());
    }
}
