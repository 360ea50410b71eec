use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ConnectError, ConnectResult};
use crate::features::{DeviceType, Features, parse_version};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReleaseInfo {
    pub version: String,
    pub required: bool,
    pub url: Option<String>,
    pub changelog: Option<serde_json::Value>,
}

impl ReleaseInfo {
    pub fn parsed_version(&self) -> Option<Version> {
        parse_version(&self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceReleases {
    pub firmware: Vec<ReleaseInfo>,
    pub ble: Vec<ReleaseInfo>,
    pub bootloader: Vec<ReleaseInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DefectiveBatch {
    pub serial_prefix: String,
    /// Affected firmware versions; empty means every version.
    pub firmware_versions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeRelease {
    pub version: String,
    pub required: bool,
}

/// Release and compatibility metadata published for every device model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteConfig {
    pub devices: HashMap<DeviceType, DeviceReleases>,
    pub bridge: Option<BridgeRelease>,
    pub defective: Vec<DefectiveBatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareStatus {
    Valid,
    Outdated,
    Required,
    Unknown,
    None,
}

fn newest(releases: &[ReleaseInfo]) -> Option<&ReleaseInfo> {
    releases
        .iter()
        .filter(|release| release.parsed_version().is_some())
        .max_by_key(|release| release.parsed_version())
}

impl RemoteConfig {
    pub fn releases(&self, device_type: DeviceType) -> Option<&DeviceReleases> {
        self.devices.get(&device_type)
    }

    pub fn latest_firmware(&self, device_type: DeviceType) -> Option<&ReleaseInfo> {
        self.releases(device_type).and_then(|r| newest(&r.firmware))
    }

    pub fn latest_ble(&self, device_type: DeviceType) -> Option<&ReleaseInfo> {
        self.releases(device_type).and_then(|r| newest(&r.ble))
    }

    pub fn firmware_status(&self, features: &Features) -> FirmwareStatus {
        if features.is_bootloader() {
            return FirmwareStatus::Unknown;
        }
        let Some(releases) = self.releases(features.device_type()) else {
            return FirmwareStatus::None;
        };
        let Some(current) = features.firmware_version() else {
            return FirmwareStatus::Unknown;
        };
        let newer: Vec<&ReleaseInfo> = releases
            .firmware
            .iter()
            .filter(|release| release.parsed_version().is_some_and(|v| v > current))
            .collect();
        if newer.is_empty() {
            if releases.firmware.is_empty() {
                FirmwareStatus::None
            } else {
                FirmwareStatus::Valid
            }
        } else if newer.iter().any(|release| release.required) {
            FirmwareStatus::Required
        } else {
            FirmwareStatus::Outdated
        }
    }

    pub fn is_defective(&self, features: &Features) -> bool {
        let Some(serial) = features.onekey_serial_no.as_deref() else {
            return false;
        };
        let firmware = features.firmware_version();
        self.defective.iter().any(|batch| {
            !batch.serial_prefix.is_empty()
                && serial.starts_with(&batch.serial_prefix)
                && (batch.firmware_versions.is_empty()
                    || batch
                        .firmware_versions
                        .iter()
                        .any(|v| parse_version(v).is_some() && parse_version(v) == firmware))
        })
    }
}

/// Where compatibility metadata comes from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> ConnectResult<RemoteConfig>;
}

pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn fetch(&self) -> ConnectResult<RemoteConfig> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            ConnectError::runtime(format!("read {}: {e}", self.path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ConnectError::runtime(format!("parse {}: {e}", self.path.display()))
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    config: RemoteConfig,
}

impl StaticConfigSource {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch(&self) -> ConnectResult<RemoteConfig> {
        Ok(self.config.clone())
    }
}

struct Loaded {
    config: Arc<RemoteConfig>,
    at: Instant,
}

/// Caches [`RemoteConfig`] and refreshes it on a fixed cadence.
pub struct RemoteConfigStore {
    source: Arc<dyn ConfigSource>,
    refresh_interval: Duration,
    loaded: RwLock<Option<Loaded>>,
    reload: tokio::sync::Mutex<()>,
}

impl RemoteConfigStore {
    pub fn new(source: Arc<dyn ConfigSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            refresh_interval,
            loaded: RwLock::new(None),
            reload: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> Arc<RemoteConfig> {
        self.loaded
            .read()
            .as_ref()
            .map(|loaded| loaded.config.clone())
            .unwrap_or_default()
    }

    fn is_fresh(&self) -> bool {
        self.loaded
            .read()
            .as_ref()
            .is_some_and(|loaded| loaded.at.elapsed() < self.refresh_interval)
    }

    /// Reloads when the cached copy is missing or stale. A failed fetch
    /// keeps serving the previous copy.
    pub async fn check_and_reload(&self) -> Arc<RemoteConfig> {
        if self.is_fresh() {
            return self.config();
        }
        let _guard = self.reload.lock().await;
        if self.is_fresh() {
            return self.config();
        }
        match self.source.fetch().await {
            Ok(config) => {
                debug!(devices = config.devices.len(), "remote config reloaded");
                *self.loaded.write() = Some(Loaded {
                    config: Arc::new(config),
                    at: Instant::now(),
                });
            }
            Err(error) => warn!("remote config reload failed: {error}"),
        }
        self.config()
    }
}
