//! Espruino interpreter version comparison
//!
//! Devices report versions like "2v25.359" or "2v24". Firmware definitions
//! declare the minimum interpreter version they need in the same format.

use crate::config::schema::FirmwareDefinition;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

/// Errors during version comparison
#[derive(Debug, Clone)]
pub enum VersionError {
    /// Version string without a `<major>v<minor>` component (e.g., "unknown")
    InvalidVersion { value: String },
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionError::InvalidVersion { value } => {
                write!(f, "invalid Espruino version '{}'", value)
            }
        }
    }
}

impl std::error::Error for VersionError {}

/// A parsed `<major>v<minor>[.<build>]` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EspruinoVersion {
    pub major: u32,
    pub minor: u32,
    /// Missing build numbers count as 0
    pub build: u32,
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+)v(\d+)(?:\.(\d+))?").unwrap_or_else(|e| {
            unreachable!("static version pattern failed to compile: {e}")
        })
    })
}

impl EspruinoVersion {
    pub fn parse(value: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidVersion {
            value: value.to_string(),
        };
        let caps = version_regex().captures(value.trim()).ok_or_else(invalid)?;

        let number = |idx: usize| -> Result<u32, VersionError> {
            match caps.get(idx) {
                Some(m) => m.as_str().parse().map_err(|_| invalid()),
                None => Ok(0),
            }
        };

        Ok(Self {
            major: number(1)?,
            minor: number(2)?,
            build: number(3)?,
        })
    }

    /// Lenient parse: anything unparseable counts as the oldest version.
    pub fn parse_or_zero(value: &str) -> Self {
        Self::parse(value).unwrap_or(Self {
            major: 0,
            minor: 0,
            build: 0,
        })
    }
}

impl Ord for EspruinoVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.build).cmp(&(other.major, other.minor, other.build))
    }
}

impl PartialOrd for EspruinoVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EspruinoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}.{}", self.major, self.minor, self.build)
    }
}

/// Check if a device version satisfies a minimum version
///
/// # Examples
///
/// ```
/// use cfw_builder::config::version::matches_requirement;
///
/// assert!(matches_requirement("2v25.376", Some("2v25.359")).unwrap());
/// assert!(!matches_requirement("2v24", Some("2v25.359")).unwrap());
///
/// // None requirement means "runs on any device"
/// assert!(matches_requirement("2v20", None).unwrap());
/// ```
pub fn matches_requirement(
    device: &str,
    minimum: Option<&str>,
) -> Result<bool, VersionError> {
    let Some(minimum) = minimum.map(str::trim).filter(|m| !m.is_empty()) else {
        return Ok(true);
    };

    let device = EspruinoVersion::parse(device)?;
    let minimum = EspruinoVersion::parse_or_zero(minimum);
    Ok(device >= minimum)
}

/// Firmware definitions the device can run, in definition order.
///
/// An unparseable device version counts as the oldest version, so only
/// firmware without a minimum stays available.
pub fn compatible_firmware<'a>(
    firmware: &'a [FirmwareDefinition],
    device: &str,
) -> Vec<&'a FirmwareDefinition> {
    let device = EspruinoVersion::parse_or_zero(device);
    firmware
        .iter()
        .filter(|def| match def.espversion.as_deref().map(str::trim) {
            Some(minimum) if !minimum.is_empty() => {
                device >= EspruinoVersion::parse_or_zero(minimum)
            }
            _ => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firmware(key: &str, espversion: Option<&str>) -> FirmwareDefinition {
        FirmwareDefinition {
            key: key.to_string(),
            name: key.to_string(),
            file: format!("FW_{key}.js"),
            espversion: espversion.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_full_version() {
        let v = EspruinoVersion::parse("2v25.359").unwrap();
        assert_eq!((v.major, v.minor, v.build), (2, 25, 359));
    }

    #[test]
    fn test_parse_without_build() {
        let v = EspruinoVersion::parse("2v24").unwrap();
        assert_eq!((v.major, v.minor, v.build), (2, 24, 0));
    }

    #[test]
    fn test_parse_embedded_in_text() {
        let v = EspruinoVersion::parse("Espruino 2v25.376\r\n").unwrap();
        assert_eq!(v.to_string(), "2v25.376");
    }

    #[test]
    fn test_parse_unknown() {
        assert!(matches!(
            EspruinoVersion::parse("unknown"),
            Err(VersionError::InvalidVersion { .. })
        ));
        assert_eq!(
            EspruinoVersion::parse_or_zero("unknown"),
            EspruinoVersion { major: 0, minor: 0, build: 0 }
        );
    }

    #[test]
    fn test_ordering() {
        let a = EspruinoVersion::parse("2v25.359").unwrap();
        let b = EspruinoVersion::parse("2v25.376").unwrap();
        let c = EspruinoVersion::parse("3v0").unwrap();
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }

    #[test]
    fn test_no_requirement() {
        assert!(matches_requirement("2v20", None).unwrap());
        assert!(matches_requirement("2v20", Some("  ")).unwrap());
    }

    #[test]
    fn test_minimum_requirement() {
        assert!(matches_requirement("2v25.359", Some("2v25.359")).unwrap());
        assert!(matches_requirement("2v26", Some("2v25.359")).unwrap());
        assert!(!matches_requirement("2v25.358", Some("2v25.359")).unwrap());
    }

    #[test]
    fn test_unknown_device_version() {
        assert!(matches_requirement("unknown", Some("2v25")).is_err());
    }

    #[test]
    fn test_compatible_firmware_filters_in_order() {
        let defs = vec![
            firmware("1.29", Some("2v25.359")),
            firmware("1.31", Some("2v25.376")),
            firmware("legacy", None),
        ];

        let keys: Vec<&str> = compatible_firmware(&defs, "2v25.360")
            .iter()
            .map(|d| d.key.as_str())
            .collect();
        assert_eq!(keys, vec!["1.29", "legacy"]);

        assert_eq!(compatible_firmware(&defs, "2v25.376").len(), 3);
    }

    #[test]
    fn test_compatible_firmware_unknown_device() {
        let defs = vec![firmware("1.29", Some("2v25.359")), firmware("legacy", None)];
        let compatible = compatible_firmware(&defs, "unknown");
        assert_eq!(compatible.len(), 1);
        assert_eq!(compatible[0].key, "legacy");
    }
}
