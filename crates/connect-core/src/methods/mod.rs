//! Built-in API methods.

mod batch_call;
mod check_firmware_release;
mod device_lock;
mod firmware_update;
mod get_features;
mod get_passphrase_state;
mod search_devices;
mod typed_call;

pub use batch_call::BatchCall;
pub use check_firmware_release::CheckFirmwareRelease;
pub use device_lock::DeviceLock;
pub use firmware_update::FirmwareUpdate;
pub use get_features::GetFeatures;
pub use get_passphrase_state::GetPassphraseState;
pub use search_devices::SearchDevices;
pub use typed_call::TypedCall;

use crate::features::DeviceMode;
use crate::method::MethodRegistry;

/// Modes in which read-only device queries still make sense.
pub(crate) const ANY_MODE: &[DeviceMode] = &[
    DeviceMode::Bootloader,
    DeviceMode::Initialize,
    DeviceMode::Seedless,
];

pub fn register_builtin(registry: &mut MethodRegistry) {
    registry.register("searchDevices", SearchDevices::create);
    registry.register("getFeatures", GetFeatures::create);
    registry.register("getPassphraseState", GetPassphraseState::create);
    registry.register("typedCall", TypedCall::create);
    registry.register("batchCall", BatchCall::create);
    registry.register("deviceLock", DeviceLock::create);
    registry.register("checkFirmwareRelease", CheckFirmwareRelease::create);
    registry.register("firmwareUpdate", FirmwareUpdate::create);
}
