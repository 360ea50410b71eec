use thiserror::Error;

use crate::frame::FrameError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown message type name: {0}")]
    UnknownName(String),
    #[error("unknown message type id: {0}")]
    UnknownId(u16),
    #[error("malformed payload for {name}: {reason}")]
    Malformed { name: String, reason: String },
    #[error("no schema registered for firmware {0}")]
    NoSchema(String),
}

/// Errors raised at the transport boundary.
///
/// Callers above the transport convert these exactly once into their own
/// taxonomy, so the variants stay close to what the medium reports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("bridge not found")]
    BridgeNotFound,
    #[error("bridge timeout")]
    BridgeTimeout,
    #[error("bridge needs permission")]
    BridgeNeedsPermission,
    #[error("bridge network error: {0}")]
    BridgeNetwork(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device disconnected during action")]
    Disconnected,
    #[error("Session not found")]
    SessionNotFound,
    #[error("wrong previous session")]
    WrongPreviousSession,
    #[error("device is used by another application")]
    DeviceBusy,
    #[error("web device not found or needs permission")]
    WebDeviceNotFoundOrNeedsPermission,
    #[error("ble scan error: {0}")]
    BleScan(String),
    #[error("ble permission denied")]
    BlePermission,
    #[error("ble location permission denied")]
    BleLocationPermission,
    #[error("ble bluetooth powered off")]
    BlePoweredOff,
    #[error("ble connect error: {0}")]
    BleConnect(String),
    #[error("ble device not bonded")]
    BleDeviceNotBonded,
    #[error("ble write characteristic error: {0}")]
    BleCharacteristicWrite(String),
    #[error("ble timeout")]
    BleTimeout,
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout,
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => {
                Self::Disconnected
            }
            _ => Self::Io(error.to_string()),
        }
    }
}

impl TransportError {
    /// The bridge process is missing or unusable; retrying cannot help.
    pub fn is_bridge_unavailable(&self) -> bool {
        matches!(
            self,
            Self::BridgeNotFound | Self::BridgeTimeout | Self::BridgeNeedsPermission
        )
    }

    pub fn is_session_not_found(&self) -> bool {
        match self {
            Self::SessionNotFound => true,
            Self::Other(message) | Self::Io(message) => {
                message.to_ascii_lowercase().contains("session not found")
            }
            _ => false,
        }
    }
}
