use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::{Value, json};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::device::{Device, RunOptions};
use crate::error::{ConnectError, ConnectResult, HardwareErrorCode};
use crate::events::{FirmwareTip, Notification};
use crate::features::Features;
use crate::method::MethodContext;

pub const MAX_WRITE_ATTEMPTS: usize = 10;
const WRITE_RETRY_DELAY: Duration = Duration::from_secs(1);
const BLE_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
const USB_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Update failures the caller must be able to tell apart; everything else
/// is reported as a generic firmware error.
const PASSTHROUGH_CODES: &[HardwareErrorCode] = &[
    HardwareErrorCode::ActionCancelled,
    HardwareErrorCode::FirmwareVerificationFailed,
    HardwareErrorCode::BleConnectedError,
    HardwareErrorCode::BleDeviceNotBonded,
    HardwareErrorCode::BleWriteCharacteristicError,
    HardwareErrorCode::BleTimeoutError,
    HardwareErrorCode::BleDeviceDisconnected,
    HardwareErrorCode::BlePoweredOff,
    HardwareErrorCode::WebDeviceNotFoundOrNeedsPermission,
];

/// Byte accounting across every file of one update, so progress stays
/// monotonic and never reports 100 before the install finished.
#[derive(Debug, Clone, Default)]
pub struct FirmwareTransferState {
    total: usize,
    written: usize,
    reported: u8,
}

impl FirmwareTransferState {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            written: 0,
            reported: 0,
        }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Records `bytes` more and returns the progress to report.
    pub fn advance(&mut self, bytes: usize) -> u8 {
        self.written = (self.written + bytes).min(self.total);
        let percent = if self.total == 0 {
            99
        } else {
            (self.written * 100).div_ceil(self.total).min(99) as u8
        };
        self.reported = self.reported.max(percent);
        self.reported
    }
}

/// Parses `"Update mode 42%"` style status text.
fn update_mode_progress(message: &str) -> Option<u8> {
    let lower = message.to_ascii_lowercase();
    let rest = &lower[lower.find("update mode")? + "update mode".len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse::<u8>().ok().map(|p| p.min(100))
}

/// Shared machinery of eMMC based firmware updates: reboot into the
/// bootloader, chunked file transfer, install trigger and the install wait.
pub struct FirmwareUpdateBase<'a> {
    ctx: &'a MethodContext,
    device: Arc<Device>,
}

impl<'a> FirmwareUpdateBase<'a> {
    pub fn new(ctx: &'a MethodContext, device: Arc<Device>) -> Self {
        Self { ctx, device }
    }

    fn tip(&self, tip: FirmwareTip) {
        self.ctx.events.emit(Notification::FirmwareTip {
            device: self.device.summary(),
            tip,
        });
    }

    fn check_cancelled(&self) -> ConnectResult<()> {
        self.ctx.signal.check(HardwareErrorCode::ActionCancelled)
    }

    /// Opens a fresh session on the device after a reboot and returns the
    /// features it reports.
    async fn reconnect(&self) -> ConnectResult<Features> {
        if !self.device.is_ble() {
            let descriptors = self.ctx.devices.enumerate().await?;
            let path = self.device.path();
            let descriptor = match descriptors.iter().find(|d| d.path == path) {
                Some(descriptor) => descriptor.clone(),
                None if descriptors.len() == 1 => descriptors[0].clone(),
                None => return Err(ConnectError::new(HardwareErrorCode::DeviceNotFound)),
            };
            self.device.set_descriptor(descriptor);
        }
        self.device.acquire().await?;
        self.device.initialize(&RunOptions::default()).await?;
        self.device
            .features()
            .ok_or_else(|| ConnectError::runtime("device features unavailable"))
    }

    fn reconnect_interval(&self) -> Duration {
        if self.device.is_ble() {
            BLE_RECONNECT_INTERVAL
        } else {
            USB_RECONNECT_INTERVAL
        }
    }

    /// Reboots into the bootloader unless already there, then waits for the
    /// device to come back in bootloader mode.
    pub async fn enter_bootloader_mode(&self) -> ConnectResult<()> {
        if self.device.features().is_some_and(|f| f.is_bootloader()) {
            return Ok(());
        }
        self.tip(FirmwareTip::AutoRebootToBootloader);
        if let Err(error) = self
            .device
            .typed_call("DeviceBackToBoot", &["Success"], json!({}))
            .await
        {
            if error.is(HardwareErrorCode::ActionCancelled) {
                return Err(error);
            }
            return Err(ConnectError::with_message(
                HardwareErrorCode::FirmwareUpdateAutoEnterBootFailure,
                error.message,
            ));
        }

        let ceiling = self.ctx.settings.bootloader_wait();
        let deadline = Instant::now() + ceiling;
        let interval = self.reconnect_interval();
        loop {
            self.check_cancelled()?;
            sleep(interval).await;
            match self.reconnect().await {
                Ok(features) if features.is_bootloader() => break,
                Ok(_) => debug!("device not in bootloader yet"),
                Err(error) => debug!("waiting for bootloader: {error}"),
            }
            if Instant::now() >= deadline {
                warn!(connect_id = %self.device.connect_id(), "bootloader did not show up");
                return Err(ConnectError::with_message(
                    HardwareErrorCode::FirmwareUpdateAutoEnterBootFailure,
                    format!("device did not enter bootloader within {}s", ceiling.as_secs()),
                ));
            }
        }
        self.tip(FirmwareTip::GoToBootloaderSuccess);
        Ok(())
    }

    pub async fn emmc_make_dir(&self, path: &str) -> ConnectResult<()> {
        match self
            .device
            .typed_call("EmmcDirMake", &["Success"], json!({ "path": path }))
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if error.message.to_ascii_lowercase().contains("exist") => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Writes one chunk. A lost session is re-opened before the next
    /// attempt; any other failure waits and retries.
    pub async fn emmc_file_write_with_retry(
        &self,
        path: &str,
        file_len: usize,
        offset: usize,
        chunk: &[u8],
        overwrite: bool,
        progress: u8,
    ) -> ConnectResult<Value> {
        let payload = json!({
            "file": {
                "path": path,
                "len": file_len,
                "offset": offset,
                "data": base64::engine::general_purpose::STANDARD.encode(chunk),
            },
            "overwrite": overwrite,
            "append": !overwrite,
            "ui_percentage": progress,
        });

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.check_cancelled()?;
            let error = match self
                .device
                .typed_call("EmmcFileWrite", &["EmmcFile"], payload.clone())
                .await
            {
                Ok(response) => return Ok(response.body),
                Err(error) => error,
            };
            if attempt >= MAX_WRITE_ATTEMPTS {
                warn!(path, offset, attempt, "chunk write failed for good: {error}");
                return Err(ConnectError::with_message(
                    HardwareErrorCode::EmmcFileWriteFirmwareError,
                    format!("writing {path} at offset {offset} failed: {}", error.message),
                ));
            }
            if error.is_session_not_found() {
                debug!(path, offset, attempt, "session lost, reconnecting");
                if let Err(error) = self.device.acquire().await {
                    warn!("re-acquire failed: {error}");
                    continue;
                }
                if let Err(error) = self.device.initialize(&RunOptions::default()).await {
                    warn!("re-initialize failed: {error}");
                }
            } else {
                debug!(path, offset, attempt, "chunk write failed: {error}");
                sleep(WRITE_RETRY_DELAY).await;
            }
        }
    }

    /// Uploads `data` to `path`: the first chunk overwrites, the rest append.
    pub async fn emmc_common_update_process(
        &self,
        data: &[u8],
        path: &str,
        state: &mut FirmwareTransferState,
    ) -> ConnectResult<()> {
        let chunk_size = self.ctx.settings.chunk_size_for(self.device.is_ble()).max(1);
        info!(path, len = data.len(), chunk_size, "uploading firmware file");
        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            let offset = index * chunk_size;
            let progress = state.advance(chunk.len());
            self.emmc_file_write_with_retry(path, data.len(), offset, chunk, index == 0, progress)
                .await?;
            self.ctx.events.emit(Notification::FirmwareProgress {
                device: self.device.summary(),
                progress,
            });
        }
        Ok(())
    }

    /// Asks the device to install the uploaded files.
    pub async fn start_emmc_firmware_update(&self, paths: &[&str]) -> ConnectResult<()> {
        self.tip(FirmwareTip::ConfirmOnDevice);
        for (index, path) in paths.iter().enumerate() {
            let reboot = index + 1 == paths.len();
            let result = self
                .device
                .typed_call(
                    "FirmwareUpdateEmmc",
                    &["Success"],
                    json!({ "path": path, "reboot_on_success": reboot }),
                )
                .await;
            if let Err(error) = result {
                if PASSTHROUGH_CODES.contains(&error.code) {
                    return Err(error);
                }
                return Err(ConnectError::with_message(
                    HardwareErrorCode::FirmwareError,
                    error.message,
                ));
            }
        }
        Ok(())
    }

    /// Polls until the device reports normal mode again and returns its
    /// firmware, BLE and bootloader versions.
    pub async fn wait_for_install(&self) -> ConnectResult<Value> {
        self.tip(FirmwareTip::FirmwareUpdating);
        let poll = self.ctx.settings.feature_poll();
        let ceiling = self.ctx.settings.install_timeout();
        let deadline = Instant::now() + ceiling;
        loop {
            self.check_cancelled()?;
            let attempt = async {
                if self.device.is_used_here() {
                    self.device.get_features().await
                } else {
                    self.reconnect().await
                }
            };
            match timeout(poll, attempt).await {
                Ok(Ok(features)) if !features.is_bootloader() => break,
                Ok(Ok(_)) => sleep(poll).await,
                Ok(Err(error)) => match update_mode_progress(&error.message) {
                    Some(progress) => {
                        self.ctx.events.emit(Notification::FirmwareProcessing {
                            device: self.device.summary(),
                            message: error.message.clone(),
                            progress: Some(progress),
                        });
                        sleep(poll).await;
                    }
                    None => {
                        debug!("install poll failed: {error}");
                        sleep(self.reconnect_interval()).await;
                    }
                },
                Err(_) => debug!("install poll timed out"),
            }
            if Instant::now() >= deadline {
                return Err(ConnectError::with_message(
                    HardwareErrorCode::FirmwareInstallTimeout,
                    format!("firmware install did not finish within {}s", ceiling.as_secs()),
                ));
            }
        }
        self.tip(FirmwareTip::FirmwareUpdateSuccess);
        let features = self.device.features().unwrap_or_default();
        Ok(features.version_triplet())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceContext, INITIALIZE_TIMEOUT};
    use crate::device_list::DeviceList;
    use crate::events::EventBus;
    use crate::prompts::PromptHub;
    use crate::queue::{AbortSignal, RequestQueue};
    use crate::remote::{RemoteConfigStore, StaticConfigSource};
    use crate::session::MemorySessionStore;
    use crate::settings::ConnectSettings;
    use crate::testing::{MockDevice, MockTransport};
    use connect_transport::{Descriptor, Message, TransportError, TransportKind};

    struct Harness {
        transport: Arc<MockTransport>,
        device: Arc<Device>,
        ctx: MethodContext,
    }

    async fn harness(mock: MockDevice, settings: ConnectSettings) -> Harness {
        let transport = MockTransport::with_device(mock);
        let events = EventBus::new();
        let queue = Arc::new(RequestQueue::new());
        let device_ctx = Arc::new(DeviceContext {
            transport: transport.clone(),
            prompter: Arc::new(PromptHub::new(events.clone())),
            sessions: Arc::new(MemorySessionStore::new()),
            queue: queue.clone(),
            events: events.clone(),
            initialize_timeout: INITIALIZE_TIMEOUT,
        });
        let device = Device::new(device_ctx.clone(), Descriptor::new("dev-1", TransportKind::Usb));
        device.acquire().await.unwrap();
        device.initialize(&RunOptions::default()).await.unwrap();
        let ctx = MethodContext {
            request_id: 1,
            device: Some(device.clone()),
            devices: Arc::new(DeviceList::new(device_ctx)),
            events,
            signal: AbortSignal::never(),
            settings: Arc::new(settings),
            remote: Arc::new(RemoteConfigStore::new(
                Arc::new(StaticConfigSource::default()),
                Duration::from_secs(60),
            )),
            queue,
        };
        Harness {
            transport,
            device,
            ctx,
        }
    }

    fn small_chunks() -> ConnectSettings {
        ConnectSettings {
            chunk_size: 4,
            ..Default::default()
        }
    }

    #[test]
    fn transfer_progress_is_monotonic_and_capped() {
        let mut state = FirmwareTransferState::new(10);
        assert_eq!(state.advance(4), 40);
        assert_eq!(state.advance(4), 80);
        assert_eq!(state.advance(2), 99);
        assert_eq!(state.advance(5), 99);
        assert_eq!(state.written(), 10);
    }

    #[test]
    fn parses_update_mode_progress() {
        assert_eq!(update_mode_progress("Update mode 42%"), Some(42));
        assert_eq!(update_mode_progress("device in update mode 7%"), Some(7));
        assert_eq!(update_mode_progress("Update mode"), None);
        assert_eq!(update_mode_progress("Session not found"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn chunked_upload_overwrites_then_appends() {
        let h = harness(MockDevice::new("dev-1"), small_chunks()).await;
        let base = FirmwareUpdateBase::new(&h.ctx, h.device.clone());
        let data = b"0123456789".to_vec();

        for _ in 0..2 {
            let mut state = FirmwareTransferState::new(data.len());
            base.emmc_common_update_process(&data, "0:updates/firmware.bin", &mut state)
                .await
                .unwrap();
        }
        let written = h.transport.device("dev-1").file("0:updates/firmware.bin").unwrap();
        assert_eq!(written, data);

        let writes: Vec<Message> = h
            .transport
            .sent("dev-1")
            .into_iter()
            .filter(|m| m.is("EmmcFileWrite"))
            .collect();
        assert_eq!(writes.len(), 6);
        assert_eq!(writes[0].body["overwrite"], true);
        assert_eq!(writes[1].body["overwrite"], false);
        assert_eq!(writes[2].body["file"]["offset"], 8);
    }

    #[tokio::test(start_paused = true)]
    async fn session_loss_reconnects_between_attempts() {
        let mock = MockDevice::new("dev-1").script(
            "EmmcFileWrite",
            vec![
                Err(TransportError::SessionNotFound),
                Err(TransportError::SessionNotFound),
                Err(TransportError::SessionNotFound),
            ],
        );
        let h = harness(mock, small_chunks()).await;
        let base = FirmwareUpdateBase::new(&h.ctx, h.device.clone());

        base.emmc_file_write_with_retry("0:f.bin", 3, 0, b"abc", true, 10)
            .await
            .unwrap();
        assert_eq!(h.transport.acquired().len(), 4);
        assert_eq!(h.transport.device("dev-1").file("0:f.bin").unwrap(), b"abc");
    }

    #[tokio::test(start_paused = true)]
    async fn write_gives_up_after_ten_attempts() {
        let failures = (0..MAX_WRITE_ATTEMPTS + 2)
            .map(|_| {
                Ok(Message::new(
                    "Failure",
                    json!({ "code": "Failure_ProcessError", "message": "emmc busy" }),
                ))
            })
            .collect();
        let mock = MockDevice::new("dev-1").script("EmmcFileWrite", failures);
        let h = harness(mock, small_chunks()).await;
        let base = FirmwareUpdateBase::new(&h.ctx, h.device.clone());

        let err = base
            .emmc_file_write_with_retry("0:f.bin", 3, 0, b"abc", true, 10)
            .await
            .unwrap_err();
        assert!(err.is(HardwareErrorCode::EmmcFileWriteFirmwareError));
        let attempts = h.transport.calls("dev-1").iter().filter(|n| *n == "EmmcFileWrite").count();
        assert_eq!(attempts, MAX_WRITE_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn bootloader_wait_times_out_at_ceiling() {
        let h = harness(MockDevice::new("dev-1"), ConnectSettings::default()).await;
        let base = FirmwareUpdateBase::new(&h.ctx, h.device.clone());

        let started = Instant::now();
        let err = base.enter_bootloader_mode().await.unwrap_err();
        assert!(err.is(HardwareErrorCode::FirmwareUpdateAutoEnterBootFailure));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn reboots_into_bootloader() {
        let mock = MockDevice::new("dev-1").transition(
            "DeviceBackToBoot",
            json!({ "bootloader_mode": true }),
        );
        let h = harness(mock, ConnectSettings::default()).await;
        let base = FirmwareUpdateBase::new(&h.ctx, h.device.clone());

        base.enter_bootloader_mode().await.unwrap();
        assert!(h.device.features().unwrap().is_bootloader());
    }

    #[tokio::test(start_paused = true)]
    async fn install_poll_reports_processing_then_versions() {
        let mock = MockDevice::new("dev-1")
            .script(
                "GetFeatures",
                vec![Ok(Message::new(
                    "Failure",
                    json!({ "code": "Failure_ProcessError", "message": "Update mode 50%" }),
                ))],
            )
            .features(json!({ "onekey_firmware_version": "4.11.0" }));
        let h = harness(mock, ConnectSettings::default()).await;
        let mut rx = h.ctx.events.subscribe();
        let base = FirmwareUpdateBase::new(&h.ctx, h.device.clone());

        let versions = base.wait_for_install().await.unwrap();
        assert_eq!(versions["firmwareVersion"], "4.11.0");
        let processing = std::iter::from_fn(|| rx.try_recv().ok()).any(|event| {
            matches!(event, Notification::FirmwareProcessing { progress: Some(50), .. })
        });
        assert!(processing);
    }

    #[tokio::test(start_paused = true)]
    async fn install_poll_times_out_after_five_minutes() {
        let mock = MockDevice::new("dev-1").features(json!({ "bootloader_mode": true }));
        let h = harness(mock, ConnectSettings::default()).await;
        let base = FirmwareUpdateBase::new(&h.ctx, h.device.clone());

        let started = Instant::now();
        let err = base.wait_for_install().await.unwrap_err();
        assert!(err.is(HardwareErrorCode::FirmwareInstallTimeout));
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(started.elapsed() < Duration::from_secs(304));
    }

    #[tokio::test]
    async fn install_trigger_wraps_unknown_failures() {
        let mock = MockDevice::new("dev-1")
            .script(
                "FirmwareUpdateEmmc",
                vec![Ok(Message::new(
                    "Failure",
                    json!({ "code": "Failure_ProcessError", "message": "bad header" }),
                ))],
            )
            .script(
                "FirmwareUpdateEmmc",
                vec![Ok(Message::new(
                    "Failure",
                    json!({ "code": "Failure_ProcessError", "message": "Firmware verification failed" }),
                ))],
            );
        let h = harness(mock, ConnectSettings::default()).await;
        let base = FirmwareUpdateBase::new(&h.ctx, h.device.clone());

        let err = base.start_emmc_firmware_update(&["0:f.bin"]).await.unwrap_err();
        assert!(err.is(HardwareErrorCode::FirmwareError));
        let err = base.start_emmc_firmware_update(&["0:f.bin"]).await.unwrap_err();
        assert!(err.is(HardwareErrorCode::FirmwareVerificationFailed));
    }
}
