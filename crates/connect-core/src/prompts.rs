use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ConnectError, ConnectResult, HardwareErrorCode};
use crate::events::{DeviceSummary, EventBus, Notification, UiResponse};

/// PIN value meaning "let the user type the PIN on the device itself".
pub const PIN_ON_DEVICE: &str = "@@ONEKEY_INPUT_PIN_IN_DEVICE";

const SELECT_DEVICE_KEY: &str = "@select-device";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinAnswer {
    Pin(String),
    OnDevice,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassphraseAnswer {
    pub value: String,
    pub on_device: bool,
    pub attach_pin_on_device: bool,
    pub save: bool,
}

/// Interactive answers the command layer needs from a human.
#[async_trait]
pub trait DevicePrompter: Send + Sync {
    async fn request_pin(&self, device: &DeviceSummary, kind: &str) -> ConnectResult<PinAnswer>;

    async fn request_passphrase(
        &self,
        device: &DeviceSummary,
        exists_attach_pin_user: bool,
    ) -> ConnectResult<PassphraseAnswer>;

    fn passphrase_on_device(&self, device: &DeviceSummary);

    fn button(&self, device: &DeviceSummary, code: Option<&str>);
}

#[derive(Debug)]
enum Reply {
    Pin(String),
    Passphrase(PassphraseAnswer),
    Selected(Option<String>),
    Cancelled,
}

/// Suspends prompts until the host answers through [`PromptHub::resolve`].
///
/// At most one prompt is pending per connect id; a second prompt for the
/// same device cancels the first.
pub struct PromptHub {
    events: EventBus,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
}

impl PromptHub {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    async fn wait(&self, key: &str, notification: Notification) -> Reply {
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.pending.lock().insert(key.to_string(), tx) {
            let _ = previous.send(Reply::Cancelled);
        }
        self.events.emit(notification);
        rx.await.unwrap_or(Reply::Cancelled)
    }

    pub fn has_pending(&self, connect_id: &str) -> bool {
        self.pending.lock().contains_key(connect_id)
    }

    /// Routes a host answer; returns false when no prompt was waiting for it.
    pub fn resolve(&self, response: UiResponse) -> bool {
        let (key, reply) = match response {
            UiResponse::ReceivePin { connect_id, pin } => (connect_id, Reply::Pin(pin)),
            UiResponse::ReceivePassphrase {
                connect_id,
                value,
                passphrase_on_device,
                attach_pin_on_device,
                save,
            } => (
                connect_id,
                Reply::Passphrase(PassphraseAnswer {
                    value,
                    on_device: passphrase_on_device,
                    attach_pin_on_device,
                    save,
                }),
            ),
            UiResponse::ReceiveSelectedDevice { connect_id } => (
                Some(SELECT_DEVICE_KEY.to_string()),
                Reply::Selected(connect_id),
            ),
        };

        let mut pending = self.pending.lock();
        let key = match key {
            Some(key) => key,
            None if pending.len() == 1 => match pending.keys().next() {
                Some(key) => key.clone(),
                None => return false,
            },
            None => {
                warn!(pending = pending.len(), "ui response without connect id is ambiguous");
                return false;
            }
        };
        match pending.remove(&key) {
            Some(tx) => {
                debug!(connect_id = %key, "prompt answered");
                tx.send(reply).is_ok()
            }
            None => false,
        }
    }

    pub fn cancel(&self, connect_id: &str) -> bool {
        match self.pending.lock().remove(connect_id) {
            Some(tx) => {
                let _ = tx.send(Reply::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Reply::Cancelled);
        }
    }

    /// Asks the host to pick one of several connected devices.
    pub async fn select_device(&self, devices: Vec<DeviceSummary>) -> Option<String> {
        match self
            .wait(SELECT_DEVICE_KEY, Notification::SelectDevice { devices })
            .await
        {
            Reply::Selected(connect_id) => connect_id,
            _ => None,
        }
    }
}

fn cancelled() -> ConnectError {
    ConnectError::new(HardwareErrorCode::ActionCancelled)
}

#[async_trait]
impl DevicePrompter for PromptHub {
    async fn request_pin(&self, device: &DeviceSummary, kind: &str) -> ConnectResult<PinAnswer> {
        let notification = Notification::RequestPin {
            device: device.clone(),
            kind: kind.to_string(),
        };
        match self.wait(&device.connect_id, notification).await {
            Reply::Pin(pin) if pin == PIN_ON_DEVICE => Ok(PinAnswer::OnDevice),
            Reply::Pin(pin) => Ok(PinAnswer::Pin(pin)),
            Reply::Cancelled => Err(cancelled()),
            other => Err(ConnectError::invalid_parameter(format!(
                "expected a PIN answer, got {other:?}"
            ))),
        }
    }

    async fn request_passphrase(
        &self,
        device: &DeviceSummary,
        exists_attach_pin_user: bool,
    ) -> ConnectResult<PassphraseAnswer> {
        let notification = Notification::RequestPassphrase {
            device: device.clone(),
            exists_attach_pin_user,
        };
        match self.wait(&device.connect_id, notification).await {
            Reply::Passphrase(answer) => Ok(answer),
            Reply::Cancelled => Err(cancelled()),
            other => Err(ConnectError::invalid_parameter(format!(
                "expected a passphrase answer, got {other:?}"
            ))),
        }
    }

    fn passphrase_on_device(&self, device: &DeviceSummary) {
        self.events.emit(Notification::RequestPassphraseOnDevice {
            device: device.clone(),
        });
    }

    fn button(&self, device: &DeviceSummary, code: Option<&str>) {
        let device = device.clone();
        let notification = match code {
            Some("ButtonRequest_PinEntry") => Notification::RequestPin {
                device,
                kind: "ButtonRequest_PinEntry".into(),
            },
            Some("ButtonRequest_AttachPin") => Notification::RequestAttachPin { device },
            code => Notification::RequestButton {
                device,
                code: code.map(str::to_string),
            },
        };
        self.events.emit(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connect_transport::TransportKind;
    use std::sync::Arc;

    fn device(connect_id: &str) -> DeviceSummary {
        DeviceSummary {
            connect_id: connect_id.into(),
            device_id: None,
            path: connect_id.into(),
            name: None,
            transport: TransportKind::Usb,
            features: None,
        }
    }

    async fn wait_pending(hub: &PromptHub, connect_id: &str) {
        while !hub.has_pending(connect_id) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn pin_answer_routes_by_connect_id() {
        let hub = Arc::new(PromptHub::new(EventBus::new()));
        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.request_pin(&device("a"), "Current").await })
        };
        wait_pending(&hub, "a").await;
        assert!(!hub.resolve(UiResponse::ReceivePin {
            connect_id: Some("b".into()),
            pin: "1".into()
        }));
        assert!(hub.resolve(UiResponse::ReceivePin {
            connect_id: Some("a".into()),
            pin: "1234".into()
        }));
        assert_eq!(waiter.await.unwrap().unwrap(), PinAnswer::Pin("1234".into()));
    }

    #[tokio::test]
    async fn on_device_sentinel_and_missing_connect_id() {
        let hub = Arc::new(PromptHub::new(EventBus::new()));
        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.request_pin(&device("a"), "Current").await })
        };
        wait_pending(&hub, "a").await;
        assert!(hub.resolve(UiResponse::ReceivePin {
            connect_id: None,
            pin: PIN_ON_DEVICE.into()
        }));
        assert_eq!(waiter.await.unwrap().unwrap(), PinAnswer::OnDevice);
    }

    #[tokio::test]
    async fn cancel_rejects_pending_prompt() {
        let hub = Arc::new(PromptHub::new(EventBus::new()));
        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.request_passphrase(&device("a"), false).await })
        };
        wait_pending(&hub, "a").await;
        assert!(hub.cancel("a"));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is(HardwareErrorCode::ActionCancelled));
        assert!(!hub.cancel("a"));
    }

    #[tokio::test]
    async fn button_codes_surface_distinctly() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let hub = PromptHub::new(bus);
        hub.button(&device("a"), Some("ButtonRequest_AttachPin"));
        hub.button(&device("a"), Some("ButtonRequest_Other"));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Notification::RequestAttachPin { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Notification::RequestButton { code: Some(_), .. }
        ));
    }
}
