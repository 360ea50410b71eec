use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::remote::DEFAULT_REFRESH_INTERVAL;

/// Orchestrator tunables. Every field has a default so partial JSON works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectSettings {
    /// Hint about the host medium (`"node"`, `"web"`, `"react-native"`...).
    pub env: Option<String>,
    pub poll_interval_time_ms: u64,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub initialize_timeout_ms: u64,
    pub bootloader_wait_ms: u64,
    pub feature_poll_ms: u64,
    pub install_timeout_ms: u64,
    pub remote_refresh_secs: u64,
    pub ble_chunk_size: usize,
    pub chunk_size: usize,
    /// Emit `SelectDevice` and wait for the answer instead of failing when
    /// several devices match.
    pub select_device_prompt: bool,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            env: None,
            poll_interval_time_ms: 1000,
            timeout_ms: 10_000,
            retry_count: 5,
            initialize_timeout_ms: 25_000,
            bootloader_wait_ms: 30_000,
            feature_poll_ms: 3_000,
            install_timeout_ms: 300_000,
            remote_refresh_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
            ble_chunk_size: 16 * 1024,
            chunk_size: 128 * 1024,
            select_device_prompt: false,
        }
    }
}

impl ConnectSettings {
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    pub fn bootloader_wait(&self) -> Duration {
        Duration::from_millis(self.bootloader_wait_ms)
    }

    pub fn feature_poll(&self) -> Duration {
        Duration::from_millis(self.feature_poll_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }

    pub fn remote_refresh(&self) -> Duration {
        Duration::from_secs(self.remote_refresh_secs)
    }

    pub fn chunk_size_for(&self, ble: bool) -> usize {
        if ble { self.ble_chunk_size } else { self.chunk_size }
    }
}
