use connect_transport::TransportError;
use serde_json::Value;
use thiserror::Error;

/// Stable numeric error codes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HardwareErrorCode {
    UnknownError = 0,

    DeviceFwException = 101,
    DeviceUnexpectedMode = 102,
    DeviceListNotInitialized = 103,
    SelectDevice = 104,
    DeviceNotFound = 105,
    DeviceInitializeFailed = 106,
    DeviceInterruptedFromOutside = 107,
    RequiredButInBootloaderMode = 108,
    DeviceInterruptedFromUser = 109,
    DeviceCheckDeviceIdError = 110,
    DeviceNotSupportPassphrase = 111,
    DeviceCheckPassphraseStateError = 112,
    DeviceNotOpenedPassphrase = 113,
    DeviceOpenedPassphrase = 114,
    DeviceDetectInBootloaderMode = 115,
    NotAllowInBootloaderMode = 116,
    DeviceBusy = 117,
    DeviceNotInitialized = 119,
    DeviceSeedless = 120,

    NotInitialized = 200,

    CallMethodError = 400,
    CallMethodNotResponse = 404,
    CallMethodInvalidParameter = 405,
    FirmwareUpdateDownloadFailed = 406,
    CallMethodNeedUpgradeFirmware = 407,
    CallMethodDeprecated = 408,
    FirmwareUpdateLimitOneDevice = 409,
    FirmwareUpdateManuallyEnterBoot = 410,
    FirmwareUpdateAutoEnterBootFailure = 411,
    NewFirmwareUnRelease = 412,
    NewFirmwareForceUpdate = 414,
    DeviceNotSupportMethod = 415,
    DefectiveFirmware = 418,
    FirmwareUpdateSelectDevice = 419,

    TransportNotFound = 602,

    BleScanError = 700,
    BlePermissionError = 701,
    BleLocationError = 702,
    BleConnectedError = 704,
    BleDeviceNotBonded = 705,
    BleWriteCharacteristicError = 710,
    BleTimeoutError = 713,
    BleDeviceDisconnected = 720,
    BlePoweredOff = 721,

    RuntimeError = 800,
    PinInvalid = 801,
    PinCancelled = 802,
    ActionCancelled = 803,
    FirmwareError = 804,
    ResponseUnexpectTypeError = 805,
    BridgeNetworkError = 806,
    BridgeTimeoutError = 807,
    BridgeNotInstalled = 808,
    PollingTimeout = 809,
    PollingStop = 810,
    BlindSignDisabled = 811,
    UnexpectPassphrase = 812,
    NotInSigningMode = 815,
    BridgeDeviceDisconnected = 817,
    EmmcFileWriteFirmwareError = 819,
    FirmwareVerificationFailed = 820,
    BridgeNeedsPermission = 821,
    FirmwareInstallTimeout = 822,

    WebDeviceNotFoundOrNeedsPermission = 901,
}

impl HardwareErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn default_message(self) -> &'static str {
        use HardwareErrorCode::*;
        match self {
            UnknownError => "Unknown error occurred. Check message property.",
            DeviceFwException => "Firmware version mismatch",
            DeviceUnexpectedMode => "Device unexpected mode",
            DeviceListNotInitialized => "Device list is not initialized",
            SelectDevice => "Please select the connected device",
            DeviceNotFound => "Device not found",
            DeviceInitializeFailed => "Device initialization failed",
            DeviceInterruptedFromOutside => "The device is interrupted by another call",
            RequiredButInBootloaderMode => "Device should be in bootloader mode",
            DeviceInterruptedFromUser => "The device operation was interrupted by the user",
            DeviceCheckDeviceIdError => "Device id does not match the requested device",
            DeviceNotSupportPassphrase => "Device does not support passphrase",
            DeviceCheckPassphraseStateError => "Passphrase state does not match",
            DeviceNotOpenedPassphrase => "Device passphrase is not enabled",
            DeviceOpenedPassphrase => "Device passphrase is enabled",
            DeviceDetectInBootloaderMode => "Device is in bootloader mode",
            NotAllowInBootloaderMode => "Not allowed in bootloader mode",
            DeviceBusy => "Device is busy",
            DeviceNotInitialized => "Device is not initialized",
            DeviceSeedless => "Device is in seedless mode",
            NotInitialized => "Not initialized",
            CallMethodError => "Method call failed",
            CallMethodNotResponse => "Method did not respond",
            CallMethodInvalidParameter => "Invalid parameter",
            FirmwareUpdateDownloadFailed => "Firmware update download failed",
            CallMethodNeedUpgradeFirmware => "Device firmware must be upgraded for this method",
            CallMethodDeprecated => "Method is deprecated on this firmware",
            FirmwareUpdateLimitOneDevice => "Only one device may be connected during firmware update",
            FirmwareUpdateManuallyEnterBoot => "Please enter bootloader mode manually",
            FirmwareUpdateAutoEnterBootFailure => "Failed to enter bootloader mode automatically",
            NewFirmwareUnRelease => "Required firmware is not released yet",
            NewFirmwareForceUpdate => "Firmware update is required",
            DeviceNotSupportMethod => "Device does not support this method",
            DefectiveFirmware => "Device firmware is defective",
            FirmwareUpdateSelectDevice => "Please select the device to update",
            TransportNotFound => "Transport not found",
            BleScanError => "BLE scan error",
            BlePermissionError => "BLE permission denied",
            BleLocationError => "BLE location permission denied",
            BleConnectedError => "BLE connect error",
            BleDeviceNotBonded => "BLE device not bonded",
            BleWriteCharacteristicError => "BLE write characteristic error",
            BleTimeoutError => "BLE timeout",
            BleDeviceDisconnected => "BLE device disconnected",
            BlePoweredOff => "Bluetooth is powered off",
            RuntimeError => "Runtime error",
            PinInvalid => "PIN invalid",
            PinCancelled => "PIN cancelled",
            ActionCancelled => "Action cancelled by user",
            FirmwareError => "Firmware installation failed",
            ResponseUnexpectTypeError => "Response type is not expected",
            BridgeNetworkError => "Bridge network error",
            BridgeTimeoutError => "Bridge network timeout",
            BridgeNotInstalled => "Bridge not installed",
            PollingTimeout => "Polling timeout",
            PollingStop => "Polling stopped",
            BlindSignDisabled => "Please confirm the BlindSign enabled",
            UnexpectPassphrase => "Unexpected passphrase",
            NotInSigningMode => "Not in signing mode",
            BridgeDeviceDisconnected => "Device disconnected during action",
            EmmcFileWriteFirmwareError => "Firmware file write failed",
            FirmwareVerificationFailed => "Firmware verification failed",
            BridgeNeedsPermission => "Bridge needs permission",
            FirmwareInstallTimeout => "Firmware installation timed out",
            WebDeviceNotFoundOrNeedsPermission => "Device not found or needs permission",
        }
    }
}

/// Error returned by every fallible operation in this crate.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct ConnectError {
    pub code: HardwareErrorCode,
    pub message: String,
    pub params: Option<Value>,
}

pub type ConnectResult<T> = std::result::Result<T, ConnectError>;

impl ConnectError {
    pub fn new(code: HardwareErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            params: None,
        }
    }

    pub fn with_message(code: HardwareErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            params: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::with_message(HardwareErrorCode::RuntimeError, message)
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::with_message(HardwareErrorCode::CallMethodInvalidParameter, message)
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn is(&self, code: HardwareErrorCode) -> bool {
        self.code == code
    }

    /// Errors after which the transport session cannot be trusted and is
    /// released even when the caller asked to keep it.
    pub fn is_fatal_session(&self) -> bool {
        use HardwareErrorCode::*;
        matches!(
            self.code,
            DeviceInitializeFailed
                | DeviceInterruptedFromOutside
                | DeviceInterruptedFromUser
                | DeviceCheckPassphraseStateError
                | ResponseUnexpectTypeError
                | PinInvalid
                | PinCancelled
                | UnexpectPassphrase
        )
    }

    pub fn is_session_not_found(&self) -> bool {
        self.message.to_ascii_lowercase().contains("session not found")
    }
}

impl From<TransportError> for ConnectError {
    fn from(error: TransportError) -> Self {
        use HardwareErrorCode::*;
        let code = match &error {
            TransportError::BridgeNotFound => BridgeNotInstalled,
            TransportError::BridgeTimeout => BridgeTimeoutError,
            TransportError::BridgeNeedsPermission => BridgeNeedsPermission,
            TransportError::BridgeNetwork(_) => BridgeNetworkError,
            TransportError::DeviceNotFound(_) => DeviceNotFound,
            TransportError::Disconnected => BridgeDeviceDisconnected,
            TransportError::WrongPreviousSession | TransportError::DeviceBusy => DeviceBusy,
            TransportError::WebDeviceNotFoundOrNeedsPermission => {
                WebDeviceNotFoundOrNeedsPermission
            }
            TransportError::BleScan(_) => BleScanError,
            TransportError::BlePermission => BlePermissionError,
            TransportError::BleLocationPermission => BleLocationError,
            TransportError::BlePoweredOff => BlePoweredOff,
            TransportError::BleConnect(_) => BleConnectedError,
            TransportError::BleDeviceNotBonded => BleDeviceNotBonded,
            TransportError::BleCharacteristicWrite(_) => BleWriteCharacteristicError,
            TransportError::BleTimeout => BleTimeoutError,
            TransportError::Cancelled => ActionCancelled,
            TransportError::SessionNotFound
            | TransportError::Timeout
            | TransportError::Codec(_)
            | TransportError::Frame(_)
            | TransportError::Io(_)
            | TransportError::Other(_) => RuntimeError,
        };
        Self::with_message(code, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(HardwareErrorCode::SelectDevice.as_u32(), 104);
        assert_eq!(HardwareErrorCode::DeviceOpenedPassphrase.as_u32(), 114);
        assert_eq!(HardwareErrorCode::ActionCancelled.as_u32(), 803);
        assert_eq!(HardwareErrorCode::EmmcFileWriteFirmwareError.as_u32(), 819);
    }

    #[test]
    fn transport_errors_convert_once() {
        let err = ConnectError::from(TransportError::BridgeNotFound);
        assert!(err.is(HardwareErrorCode::BridgeNotInstalled));

        let err = ConnectError::from(TransportError::SessionNotFound);
        assert!(err.is(HardwareErrorCode::RuntimeError));
        assert!(err.is_session_not_found());

        let err = ConnectError::from(TransportError::Cancelled);
        assert!(err.is(HardwareErrorCode::ActionCancelled));
    }

    #[test]
    fn fatal_session_class() {
        assert!(ConnectError::new(HardwareErrorCode::PinInvalid).is_fatal_session());
        assert!(
            ConnectError::new(HardwareErrorCode::DeviceInterruptedFromOutside).is_fatal_session()
        );
        assert!(!ConnectError::new(HardwareErrorCode::ActionCancelled).is_fatal_session());
        assert!(!ConnectError::runtime("boom").is_fatal_session());
    }
}
