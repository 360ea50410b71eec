use connect_transport::TransportKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::features::Features;
use crate::remote::FirmwareStatus;

const EVENT_CAPACITY: usize = 256;

/// Snapshot of a device carried by notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub connect_id: String,
    pub device_id: Option<String>,
    pub path: String,
    pub name: Option<String>,
    pub transport: TransportKind,
    pub features: Option<Features>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FirmwareTip {
    AutoRebootToBootloader,
    GoToBootloaderSuccess,
    ConfirmOnDevice,
    FirmwareUpdating,
    CheckLatestUiResource,
    FirmwareUpdateSuccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    DeviceConnect {
        device: DeviceSummary,
    },
    DeviceDisconnect {
        device: DeviceSummary,
    },
    DeviceFeatures {
        device: DeviceSummary,
    },
    #[serde(rename_all = "camelCase")]
    FirmwareRelease {
        device: DeviceSummary,
        status: FirmwareStatus,
        release: Option<Value>,
    },
    RequestPin {
        device: DeviceSummary,
        kind: String,
    },
    #[serde(rename_all = "camelCase")]
    RequestPassphrase {
        device: DeviceSummary,
        exists_attach_pin_user: bool,
    },
    RequestPassphraseOnDevice {
        device: DeviceSummary,
    },
    RequestButton {
        device: DeviceSummary,
        code: Option<String>,
    },
    RequestAttachPin {
        device: DeviceSummary,
    },
    SelectDevice {
        devices: Vec<DeviceSummary>,
    },
    FirmwareProgress {
        device: DeviceSummary,
        progress: u8,
    },
    FirmwareProcessing {
        device: DeviceSummary,
        message: String,
        progress: Option<u8>,
    },
    FirmwareTip {
        device: DeviceSummary,
        tip: FirmwareTip,
    },
    #[serde(rename_all = "camelCase")]
    ClosePromptWindow {
        connect_id: Option<String>,
    },
    CallProgress {
        id: u64,
        progress: Value,
    },
}

/// Answers the host feeds back into pending prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UiResponse {
    #[serde(rename_all = "camelCase")]
    ReceivePin {
        #[serde(default)]
        connect_id: Option<String>,
        pin: String,
    },
    #[serde(rename_all = "camelCase")]
    ReceivePassphrase {
        #[serde(default)]
        connect_id: Option<String>,
        #[serde(default)]
        value: String,
        #[serde(default)]
        passphrase_on_device: bool,
        #[serde(default)]
        attach_pin_on_device: bool,
        #[serde(default)]
        save: bool,
    },
    #[serde(rename_all = "camelCase")]
    ReceiveSelectedDevice {
        #[serde(default)]
        connect_id: Option<String>,
    },
}

/// Fan-out of [`Notification`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Notification>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn emit(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.sender.send(notification);
    }
}
