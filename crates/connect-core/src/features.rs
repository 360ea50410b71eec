use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Device metadata as returned by `Initialize` / `GetFeatures`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub vendor: Option<String>,
    pub major_version: Option<u32>,
    pub minor_version: Option<u32>,
    pub patch_version: Option<u32>,
    pub bootloader_mode: Option<bool>,
    pub device_id: Option<String>,
    pub label: Option<String>,
    pub initialized: Option<bool>,
    pub passphrase_protection: Option<bool>,
    pub unlocked: Option<bool>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub capabilities: Vec<String>,
    pub no_backup: Option<bool>,
    pub safety_checks: Option<String>,
    pub onekey_device_type: Option<String>,
    pub onekey_firmware_version: Option<String>,
    pub onekey_ble_version: Option<String>,
    pub onekey_boot_version: Option<String>,
    pub onekey_serial_no: Option<String>,
    pub onekey_ble_name: Option<String>,
    pub unlocked_attach_pin: Option<bool>,
    pub attach_to_pin_user: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Classic,
    Classic1s,
    Mini,
    Touch,
    Pro,
    Unknown,
}

/// Coarse hardware family, used when a device type has no dedicated entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Classic,
    Touch,
}

impl DeviceType {
    pub fn family(self) -> Option<ModelFamily> {
        match self {
            Self::Classic | Self::Classic1s | Self::Mini => Some(ModelFamily::Classic),
            Self::Touch | Self::Pro => Some(ModelFamily::Touch),
            Self::Unknown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::Classic1s => "classic1s",
            Self::Mini => "mini",
            Self::Touch => "touch",
            Self::Pro => "pro",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Bootloader,
    Initialize,
    Seedless,
    Normal,
}

/// Parses `"4.10"`, `"4.10.0"` or `"v4.10.0"`; missing parts read as zero.
pub fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if raw.is_empty() {
        return None;
    }
    let mut parts = raw.split('.').map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

impl Features {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn device_type(&self) -> DeviceType {
        if let Some(kind) = self.onekey_device_type.as_deref() {
            match kind.to_ascii_uppercase().as_str() {
                "CLASSIC" => return DeviceType::Classic,
                "CLASSIC1S" => return DeviceType::Classic1s,
                "MINI" => return DeviceType::Mini,
                "TOUCH" => return DeviceType::Touch,
                "PRO" => return DeviceType::Pro,
                _ => {}
            }
        }
        if let Some(serial) = self.onekey_serial_no.as_deref() {
            let prefix: String = serial.chars().take(2).collect::<String>().to_ascii_uppercase();
            match prefix.as_str() {
                "MI" => return DeviceType::Mini,
                "TC" => return DeviceType::Touch,
                "PR" => return DeviceType::Pro,
                "CL" => return DeviceType::Classic,
                _ => {}
            }
        }
        match self.model.as_deref() {
            Some("1") => DeviceType::Classic,
            Some("T") => DeviceType::Touch,
            _ => DeviceType::Unknown,
        }
    }

    pub fn firmware_version(&self) -> Option<Version> {
        if let Some(version) = self.onekey_firmware_version.as_deref().and_then(parse_version) {
            return Some(version);
        }
        Some(Version::new(
            self.major_version? as u64,
            self.minor_version.unwrap_or(0) as u64,
            self.patch_version.unwrap_or(0) as u64,
        ))
    }

    pub fn ble_version(&self) -> Option<Version> {
        self.onekey_ble_version.as_deref().and_then(parse_version)
    }

    pub fn bootloader_version(&self) -> Option<Version> {
        self.onekey_boot_version.as_deref().and_then(parse_version)
    }

    pub fn is_bootloader(&self) -> bool {
        self.bootloader_mode == Some(true)
    }

    pub fn mode(&self) -> DeviceMode {
        if self.is_bootloader() {
            DeviceMode::Bootloader
        } else if self.initialized != Some(true) {
            DeviceMode::Initialize
        } else if self.no_backup == Some(true) {
            DeviceMode::Seedless
        } else {
            DeviceMode::Normal
        }
    }

    pub fn passphrase_enabled(&self) -> bool {
        self.passphrase_protection == Some(true)
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked != Some(false)
    }

    pub fn version_triplet(&self) -> Value {
        serde_json::json!({
            "firmwareVersion": self.firmware_version().map(|v| v.to_string()),
            "bleVersion": self.ble_version().map(|v| v.to_string()),
            "bootloaderVersion": self.bootloader_version().map(|v| v.to_string()),
        })
    }
}

fn blank_to_none(field: &mut Option<String>) {
    if field.as_deref().is_some_and(|s| s.trim().is_empty()) {
        *field = None;
    }
}

/// Normalises the firmware quirks seen across device generations.
pub fn fix_features(mut features: Features) -> Features {
    blank_to_none(&mut features.onekey_firmware_version);
    blank_to_none(&mut features.onekey_ble_version);
    blank_to_none(&mut features.onekey_boot_version);
    blank_to_none(&mut features.onekey_serial_no);
    blank_to_none(&mut features.session_id);
    blank_to_none(&mut features.device_id);

    if features.model.is_none() {
        features.model = match features.major_version {
            Some(1) => Some("1".into()),
            Some(_) => Some("T".into()),
            None => None,
        };
    }

    if features.is_bootloader() {
        // Bootloader builds report their own version in the semantic fields.
        if features.onekey_boot_version.is_none()
            && let Some(major) = features.major_version
        {
            features.onekey_boot_version = Some(format!(
                "{major}.{}.{}",
                features.minor_version.unwrap_or(0),
                features.patch_version.unwrap_or(0)
            ));
        }
    } else if features.onekey_firmware_version.is_none()
        && let Some(major) = features.major_version
    {
        features.onekey_firmware_version = Some(format!(
            "{major}.{}.{}",
            features.minor_version.unwrap_or(0),
            features.patch_version.unwrap_or(0)
        ));
    }

    features
}
