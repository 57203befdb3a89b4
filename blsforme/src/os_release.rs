// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Minimal `os-release(5)` parser.
//!
//! Only the fields this crate actually consumes are kept: `NAME`, `ID`,
//! `VERSION_ID` and `PRETTY_NAME`. This is intentionally not a general
//! shell-variable evaluator.

use std::str::FromStr;

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("os-release is missing a required NAME or ID field"))]
    MissingIdentity,
}

/// `VERSION_ID`-bearing fields
#[derive(Debug, Clone, Default)]
pub struct OsReleaseVersion {
    pub name: Option<String>,
}

/// Display/support metadata fields, kept loosely grouped as the original does
#[derive(Debug, Clone, Default)]
pub struct OsReleaseMeta {
    pub pretty_name: Option<String>,
    pub ansi_color: Option<String>,
    pub home_url: Option<String>,
    pub support_url: Option<String>,
    pub bug_report_url: Option<String>,
}

/// Parsed identity of the running (or target) operating system
#[derive(Debug, Clone)]
pub struct OsRelease {
    pub name: String,
    pub id: String,
    pub version: OsReleaseVersion,
    pub meta: OsReleaseMeta,
}

impl Default for OsRelease {
    fn default() -> Self {
        Self {
            name: "generic-linux-os".into(),
            id: "linux".into(),
            version: OsReleaseVersion { name: Some("1".into()) },
            meta: OsReleaseMeta::default(),
        }
    }
}

impl FromStr for OsRelease {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut fields = std::collections::HashMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            fields.insert(key.trim().to_string(), unquote(value.trim()));
        }

        let name = fields.get("NAME").cloned().unwrap_or_else(|| "generic-linux-os".into());
        let id = fields.get("ID").cloned().unwrap_or_else(|| "linux".into());

        Ok(Self {
            name,
            id,
            version: OsReleaseVersion {
                name: fields.get("VERSION_ID").cloned(),
            },
            meta: OsReleaseMeta {
                pretty_name: fields.get("PRETTY_NAME").cloned(),
                ansi_color: fields.get("ANSI_COLOR").cloned(),
                home_url: fields.get("HOME_URL").cloned(),
                support_url: fields.get("SUPPORT_URL").cloned(),
                bug_report_url: fields.get("BUG_REPORT_URL").cloned(),
            },
        })
    }
}

/// Strip a single layer of matching double or single quotes, as shells do
/// when sourcing `KEY="value"` assignments.
fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'"' || bytes[0] == b'\'') && bytes[bytes.len() - 1] == bytes[0] {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_os_release() {
        let text = r#"
NAME="Clear Linux OS"
ID=clear-linux-os
VERSION_ID=41780
PRETTY_NAME="Clear Linux OS"
HOME_URL="https://clearlinux.org"
"#;
        let os_release = OsRelease::from_str(text).unwrap();
        assert_eq!(os_release.name, "Clear Linux OS");
        assert_eq!(os_release.id, "clear-linux-os");
        assert_eq!(os_release.version.name.as_deref(), Some("41780"));
        assert_eq!(os_release.meta.pretty_name.as_deref(), Some("Clear Linux OS"));
    }

    #[test]
    fn falls_back_when_fields_missing() {
        let os_release = OsRelease::from_str("").unwrap();
        assert_eq!(os_release.name, "generic-linux-os");
        assert_eq!(os_release.id, "linux");
    }
}
