use std::collections::HashMap;

use semver::Version;
use serde_json::json;

use crate::error::{ConnectError, ConnectResult, HardwareErrorCode};
use crate::features::{DeviceMode, DeviceType, Features, ModelFamily};

/// Supported firmware window for a method; `max` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    pub min: Version,
    pub max: Option<Version>,
}

impl VersionRange {
    pub fn since(min: Version) -> Self {
        Self { min, max: None }
    }

    pub fn between(min: Version, max: Version) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    /// A `0.0.0` minimum marks the method as unavailable on that hardware.
    pub fn unsupported() -> Self {
        Self::since(Version::new(0, 0, 0))
    }

    pub fn is_unsupported(&self) -> bool {
        self.min == Version::new(0, 0, 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodVersionRanges {
    pub by_type: HashMap<DeviceType, VersionRange>,
    pub by_family: HashMap<ModelFamily, VersionRange>,
}

impl MethodVersionRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_type(mut self, device_type: DeviceType, range: VersionRange) -> Self {
        self.by_type.insert(device_type, range);
        self
    }

    pub fn family(mut self, family: ModelFamily, range: VersionRange) -> Self {
        self.by_family.insert(family, range);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty() && self.by_family.is_empty()
    }

    /// Device-type entry first, model-family entry as fallback.
    pub fn select(&self, device_type: DeviceType) -> Option<&VersionRange> {
        self.by_type
            .get(&device_type)
            .or_else(|| device_type.family().and_then(|f| self.by_family.get(&f)))
    }
}

/// Rejects firmware outside the method's supported window.
///
/// `latest_release` is the newest published firmware for the device type;
/// when even that is below the minimum the required firmware is not out yet.
pub fn check_version_range(
    features: &Features,
    ranges: &MethodVersionRanges,
    latest_release: Option<&Version>,
) -> ConnectResult<()> {
    let Some(range) = ranges.select(features.device_type()) else {
        return Ok(());
    };
    if range.is_unsupported() {
        return Err(ConnectError::new(HardwareErrorCode::DeviceNotSupportMethod));
    }
    let Some(current) = features.firmware_version() else {
        return Ok(());
    };

    if current < range.min {
        let params = json!({
            "current": current.to_string(),
            "require": range.min.to_string(),
        });
        let code = match latest_release {
            Some(latest) if *latest >= range.min => HardwareErrorCode::CallMethodNeedUpgradeFirmware,
            _ => HardwareErrorCode::NewFirmwareUnRelease,
        };
        return Err(ConnectError::new(code).params(params));
    }
    if let Some(max) = &range.max
        && current >= *max
    {
        return Err(ConnectError::new(HardwareErrorCode::CallMethodDeprecated).params(json!({
            "current": current.to_string(),
            "deprecated": max.to_string(),
        })));
    }
    Ok(())
}

/// Returns the mode the device is in that the method cannot run in.
pub fn unexpected_mode(
    features: &Features,
    allow: &[DeviceMode],
    require: &[DeviceMode],
) -> Option<DeviceMode> {
    if features.is_bootloader() && !allow.contains(&DeviceMode::Bootloader) {
        return Some(DeviceMode::Bootloader);
    }
    if !features.is_bootloader() {
        if features.initialized != Some(true) && !allow.contains(&DeviceMode::Initialize) {
            return Some(DeviceMode::Initialize);
        }
        if features.no_backup == Some(true) && !allow.contains(&DeviceMode::Seedless) {
            return Some(DeviceMode::Seedless);
        }
    }
    if require.contains(&DeviceMode::Bootloader) && !features.is_bootloader() {
        return Some(DeviceMode::Normal);
    }
    None
}

pub fn check_device_mode(
    features: &Features,
    allow: &[DeviceMode],
    require: &[DeviceMode],
) -> ConnectResult<()> {
    let code = match unexpected_mode(features, allow, require) {
        None => return Ok(()),
        Some(DeviceMode::Bootloader) => HardwareErrorCode::NotAllowInBootloaderMode,
        Some(DeviceMode::Initialize) => HardwareErrorCode::DeviceNotInitialized,
        Some(DeviceMode::Seedless) => HardwareErrorCode::DeviceSeedless,
        Some(DeviceMode::Normal) => HardwareErrorCode::RequiredButInBootloaderMode,
    };
    Err(ConnectError::new(code))
}

/// Passphrase configuration must agree with what the caller pinned.
///
/// A wallet-scoped method on a passphrase-enabled device needs either a
/// passphrase state or an explicit request for the standard wallet; a pinned
/// state on a device without passphrase can never match.
pub fn check_passphrase_enabled(
    features: &Features,
    use_device_passphrase_state: bool,
    passphrase_state: Option<&str>,
    use_empty_passphrase: bool,
) -> ConnectResult<()> {
    let enabled = features.passphrase_enabled();
    if use_device_passphrase_state && enabled && passphrase_state.is_none() && !use_empty_passphrase
    {
        return Err(ConnectError::new(HardwareErrorCode::DeviceOpenedPassphrase));
    }
    if !enabled && passphrase_state.is_some() {
        return Err(ConnectError::new(HardwareErrorCode::DeviceNotOpenedPassphrase));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(device_type: &str, version: &str) -> Features {
        Features {
            onekey_device_type: Some(device_type.into()),
            onekey_firmware_version: Some(version.into()),
            initialized: Some(true),
            ..Default::default()
        }
    }

    fn v(major: u64, minor: u64, patch: u64) -> Version {
        Version::new(major, minor, patch)
    }

    #[test]
    fn device_type_range_takes_precedence_over_family() {
        let ranges = MethodVersionRanges::new()
            .family(ModelFamily::Touch, VersionRange::since(v(4, 0, 0)))
            .device_type(DeviceType::Pro, VersionRange::since(v(4, 5, 0)));

        assert_eq!(ranges.select(DeviceType::Pro).unwrap().min, v(4, 5, 0));
        assert_eq!(ranges.select(DeviceType::Touch).unwrap().min, v(4, 0, 0));
        assert!(ranges.select(DeviceType::Mini).is_none());

        let err = check_version_range(&features("PRO", "4.2.0"), &ranges, Some(&v(4, 6, 0)))
            .unwrap_err();
        assert!(err.is(HardwareErrorCode::CallMethodNeedUpgradeFirmware));
        assert!(check_version_range(&features("TOUCH", "4.2.0"), &ranges, None).is_ok());
    }

    #[test]
    fn unreleased_when_latest_is_below_minimum() {
        let ranges =
            MethodVersionRanges::new().device_type(DeviceType::Mini, VersionRange::since(v(3, 0, 0)));
        let err = check_version_range(&features("MINI", "2.0.0"), &ranges, Some(&v(2, 9, 0)))
            .unwrap_err();
        assert!(err.is(HardwareErrorCode::NewFirmwareUnRelease));
        assert_eq!(err.params.unwrap()["require"], "3.0.0");

        let err = check_version_range(&features("MINI", "2.0.0"), &ranges, None).unwrap_err();
        assert!(err.is(HardwareErrorCode::NewFirmwareUnRelease));
    }

    #[test]
    fn zero_minimum_means_unsupported_and_max_is_exclusive() {
        let ranges = MethodVersionRanges::new()
            .device_type(DeviceType::Classic, VersionRange::unsupported())
            .device_type(DeviceType::Pro, VersionRange::between(v(1, 0, 0), v(4, 0, 0)));
        let err = check_version_range(&features("CLASSIC", "9.0.0"), &ranges, None).unwrap_err();
        assert!(err.is(HardwareErrorCode::DeviceNotSupportMethod));

        let err = check_version_range(&features("PRO", "4.0.0"), &ranges, None).unwrap_err();
        assert!(err.is(HardwareErrorCode::CallMethodDeprecated));
        assert!(check_version_range(&features("PRO", "3.9.9"), &ranges, None).is_ok());
    }

    #[test]
    fn device_mode_checks() {
        let mut boot = features("PRO", "4.0.0");
        boot.bootloader_mode = Some(true);
        let err = check_device_mode(&boot, &[], &[]).unwrap_err();
        assert!(err.is(HardwareErrorCode::NotAllowInBootloaderMode));
        assert!(check_device_mode(&boot, &[DeviceMode::Bootloader], &[DeviceMode::Bootloader]).is_ok());

        let normal = features("PRO", "4.0.0");
        let err = check_device_mode(&normal, &[], &[DeviceMode::Bootloader]).unwrap_err();
        assert!(err.is(HardwareErrorCode::RequiredButInBootloaderMode));

        let mut fresh = features("PRO", "4.0.0");
        fresh.initialized = Some(false);
        let err = check_device_mode(&fresh, &[], &[]).unwrap_err();
        assert!(err.is(HardwareErrorCode::DeviceNotInitialized));
        assert!(check_device_mode(&fresh, &[DeviceMode::Initialize], &[]).is_ok());
    }

    #[test]
    fn passphrase_configuration_must_match_request() {
        let plain = features("PRO", "4.0.0");
        let err = check_passphrase_enabled(&plain, true, Some("state"), false).unwrap_err();
        assert!(err.is(HardwareErrorCode::DeviceNotOpenedPassphrase));
        assert!(check_passphrase_enabled(&plain, true, None, false).is_ok());

        let mut protected = features("PRO", "4.0.0");
        protected.passphrase_protection = Some(true);
        let err = check_passphrase_enabled(&protected, true, None, false).unwrap_err();
        assert!(err.is(HardwareErrorCode::DeviceOpenedPassphrase));
        assert!(check_passphrase_enabled(&protected, true, None, true).is_ok());
        assert!(check_passphrase_enabled(&protected, true, Some("state"), false).is_ok());
        assert!(check_passphrase_enabled(&protected, false, None, false).is_ok());
    }
}
