use async_trait::async_trait;
use base64::Engine;
use semver::Version;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::device::Device;
use crate::error::{ConnectError, ConnectResult};
use crate::features::{DeviceMode, ModelFamily};
use crate::firmware::{FirmwareTransferState, FirmwareUpdateBase};
use crate::method::{CommonParams, Method, MethodContext, parse_payload};
use crate::methods::ANY_MODE;
use crate::policy::{MethodVersionRanges, VersionRange};

const UPDATE_DIR: &str = "0:updates";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FirmwarePayload {
    bootloader: Option<String>,
    ble: Option<String>,
    firmware: Option<String>,
}

struct FirmwareFile {
    path: &'static str,
    data: Vec<u8>,
}

fn decode(field: &str, value: Option<String>) -> ConnectResult<Option<Vec<u8>>> {
    value
        .map(|encoded| {
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| ConnectError::invalid_parameter(format!("{field} is not base64: {e}")))
        })
        .transpose()
}

/// Clears the updating flag however the update ends.
struct UpdatingGuard<'a>(&'a Device);

impl<'a> UpdatingGuard<'a> {
    fn new(device: &'a Device) -> Self {
        device.set_updating_firmware(true);
        Self(device)
    }
}

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        self.0.set_updating_firmware(false);
    }
}

/// eMMC firmware update: bootloader, BLE and main firmware in one pass.
pub struct FirmwareUpdate {
    params: CommonParams,
    files: Vec<FirmwareFile>,
}

impl FirmwareUpdate {
    pub fn create(payload: Value) -> ConnectResult<Box<dyn Method>> {
        let FirmwarePayload {
            bootloader,
            ble,
            firmware,
        } = parse_payload(&payload)?;
        let files: Vec<FirmwareFile> = [
            ("0:updates/bootloader.bin", decode("bootloader", bootloader)?),
            ("0:updates/ble.bin", decode("ble", ble)?),
            ("0:updates/firmware.bin", decode("firmware", firmware)?),
        ]
        .into_iter()
        .filter_map(|(path, data)| data.map(|data| FirmwareFile { path, data }))
        .collect();
        if files.is_empty() || files.iter().any(|file| file.data.is_empty()) {
            return Err(ConnectError::invalid_parameter(
                "at least one non-empty firmware binary is required",
            ));
        }
        Ok(Box::new(Self {
            params: CommonParams::from_payload(&payload)?,
            files,
        }))
    }
}

#[async_trait]
impl Method for FirmwareUpdate {
    fn name(&self) -> &'static str {
        "firmwareUpdate"
    }

    fn params(&self) -> &CommonParams {
        &self.params
    }

    fn use_device_passphrase_state(&self) -> bool {
        false
    }

    fn allow_device_mode(&self) -> &[DeviceMode] {
        ANY_MODE
    }

    fn version_ranges(&self) -> MethodVersionRanges {
        // Classic-family devices have no eMMC storage.
        MethodVersionRanges::new().family(
            ModelFamily::Classic,
            VersionRange::since(Version::new(0, 0, 0)),
        )
    }

    fn skip_force_update_check(&self) -> bool {
        true
    }

    fn is_firmware_update(&self) -> bool {
        true
    }

    async fn run(&mut self, ctx: &MethodContext) -> ConnectResult<Value> {
        let device = ctx.device()?.clone();
        let _updating = UpdatingGuard::new(&device);
        let base = FirmwareUpdateBase::new(ctx, device.clone());

        base.enter_bootloader_mode().await?;
        base.emmc_make_dir(UPDATE_DIR).await?;

        let total = self.files.iter().map(|file| file.data.len()).sum();
        let mut state = FirmwareTransferState::new(total);
        for file in &self.files {
            base.emmc_common_update_process(&file.data, file.path, &mut state)
                .await?;
        }
        info!(connect_id = %device.connect_id(), bytes = state.written(), "firmware uploaded");

        let paths: Vec<&str> = self.files.iter().map(|file| file.path).collect();
        base.start_emmc_firmware_update(&paths).await?;
        base.wait_for_install().await
    }

    fn dispose(&mut self) {
        self.files.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HardwareErrorCode;
    use serde_json::json;

    #[test]
    fn needs_at_least_one_binary() {
        let err = FirmwareUpdate::create(json!({ "connectId": "dev-1" })).err().unwrap();
        assert!(err.is(HardwareErrorCode::CallMethodInvalidParameter));

        let err = FirmwareUpdate::create(json!({ "firmware": "***" })).err().unwrap();
        assert!(err.is(HardwareErrorCode::CallMethodInvalidParameter));

        let method = FirmwareUpdate::create(json!({ "ble": "AAEC" })).unwrap();
        assert!(method.is_firmware_update());
    }
}
