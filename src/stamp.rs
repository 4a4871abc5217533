//! Per-build version stamping.
//!
//! Every build appends `.<N>` to the firmware's `const VERSION = "x.y"`
//! literal, where N is the current Unix time in seconds modulo 1000. The
//! device compares its stored VERSION record against this literal to decide
//! whether a fresh install is pending.

use regex::{Captures, Regex};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Version used when neither the source nor the file name carries one.
pub const UNKNOWN_VERSION: &str = "unknown";

fn version_literal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(const\s+VERSION\s*=\s*["'])([0-9.]+)(["'])"#)
            .unwrap_or_else(|e| unreachable!("static VERSION pattern failed to compile: {e}"))
    })
}

fn file_name_version() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"FW_([0-9.]+)\.js")
            .unwrap_or_else(|e| unreachable!("static file name pattern failed to compile: {e}"))
    })
}

/// Stamped source and the version string written into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamped {
    pub text: String,
    pub version: String,
    /// False when the source had no VERSION literal and `version` was
    /// synthesised from the fallback
    pub found_literal: bool,
}

/// Stamp `buffer` using the current time.
pub fn stamp(buffer: &str, fallback: Option<&str>) -> Stamped {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    stamp_at(buffer, fallback, secs)
}

/// Stamp `buffer` as if it were `unix_secs` seconds after the epoch.
///
/// Every VERSION literal is rewritten; the returned version is the last one.
/// Without a literal the buffer is returned unchanged and the version is
/// `<fallback>.<N>` (or `unknown.<N>`).
pub fn stamp_at(buffer: &str, fallback: Option<&str>, unix_secs: u64) -> Stamped {
    let suffix = unix_secs % 1000;
    let mut last = None;

    let text = version_literal()
        .replace_all(buffer, |caps: &Captures<'_>| {
            let version = format!("{}.{}", &caps[2], suffix);
            debug!(from = &caps[2], to = %version, "stamping VERSION literal");
            let out = format!("{}{}{}", &caps[1], version, &caps[3]);
            last = Some(version);
            out
        })
        .into_owned();

    match last {
        Some(version) => {
            info!(%version, "stamped firmware version");
            Stamped {
                text,
                version,
                found_literal: true,
            }
        }
        None => {
            let base = fallback
                .filter(|v| !v.is_empty())
                .unwrap_or(UNKNOWN_VERSION);
            let version = format!("{base}.{suffix}");
            info!(%version, "no VERSION literal found, using fallback version");
            Stamped {
                text,
                version,
                found_literal: false,
            }
        }
    }
}

/// VERSION literal value in `source`, if any.
pub fn detect_version(source: &str) -> Option<&str> {
    version_literal()
        .captures(source)
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str())
}

/// Version from a `FW_<version>.js` file name, e.g. `FW_1.29.js` → `1.29`.
pub fn version_from_file_name(name: &str) -> Option<&str> {
    file_name_version()
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_appends_suffix() {
        let stamped = stamp_at("const VERSION = \"1.29\";\nrest", None, 1_700_000_123);
        assert_eq!(stamped.text, "const VERSION = \"1.29.123\";\nrest");
        assert_eq!(stamped.version, "1.29.123");
        assert!(stamped.found_literal);
    }

    #[test]
    fn test_stamp_single_quotes_and_spacing() {
        let stamped = stamp_at("const  VERSION='2.0'", None, 5);
        assert_eq!(stamped.text, "const  VERSION='2.0.5'");
        assert_eq!(stamped.version, "2.0.5");
    }

    #[test]
    fn test_suffix_is_not_padded() {
        let stamped = stamp_at("const VERSION = \"1.31\"", None, 2_000_007);
        assert_eq!(stamped.version, "1.31.7");
    }

    #[test]
    fn test_stamp_fallback() {
        let stamped = stamp_at("no version here", Some("1.31"), 42);
        assert_eq!(stamped.text, "no version here");
        assert_eq!(stamped.version, "1.31.42");
        assert!(!stamped.found_literal);

        let stamped = stamp_at("no version here", None, 42);
        assert_eq!(stamped.version, "unknown.42");
    }

    #[test]
    fn test_stamps_differ_across_seconds() {
        let base = "const VERSION = \"1.29\";";
        let a = stamp_at(base, None, 1000);
        let b = stamp_at(base, None, 1001);
        assert_ne!(a.version, b.version);
        assert_ne!(a.text, b.text);
    }

    #[test]
    fn test_let_declaration_is_not_a_version_literal() {
        let stamped = stamp_at("let VERSION = \"1.29\";", Some("1.29"), 9);
        assert!(!stamped.found_literal);
    }

    #[test]
    fn test_detect_and_file_name_versions() {
        assert_eq!(detect_version("const VERSION = \"1.31\";"), Some("1.31"));
        assert_eq!(detect_version("var x = 1;"), None);
        assert_eq!(version_from_file_name("firmware/FW_1.29.js"), Some("1.29"));
        assert_eq!(version_from_file_name("custom.js"), None);
    }
}
