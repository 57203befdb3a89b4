// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Minimal reader for the systemd "Boot Loader Interface" efivarfs
//! variables (`LoaderInfo`, `LoaderDevicePartUUID`, ...). See
//! <https://systemd.io/BOOT_LOADER_INTERFACE/>. Write support is
//! intentionally not provided: this crate only ever *reads* loader-vendor
//! state to discover where the ESP already lives.

use std::path::{Path, PathBuf};

use fs_err as fs;
use snafu::{ResultExt, Snafu};

/// The Boot Loader Interface vendor GUID
const LOADER_GUID: &str = "4a67b082-0a4c-41cf-b6c7-440b29bb8c4f";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("efivarfs not available: {source}"))]
    Unavailable { source: std::io::Error },

    #[snafu(display("variable {name} not found"))]
    NotFound { name: String },

    #[snafu(display("variable {name} contains invalid UCS-2 data"))]
    InvalidEncoding { name: String },
}

/// Known Boot Loader Interface variable names
#[derive(Debug, Clone, Copy)]
pub enum VariableName {
    /// Human readable loader name + version, e.g. `systemd-boot 255`
    Info,

    /// PartUUID of the ESP the loader itself was started from
    DevicePartUuid,
}

impl VariableName {
    fn as_str(&self) -> &'static str {
        match self {
            VariableName::Info => "LoaderInfo",
            VariableName::DevicePartUuid => "LoaderDevicePartUUID",
        }
    }
}

/// Handle onto the efivarfs-exposed Boot Loader Interface
#[derive(Debug)]
pub struct BootLoaderInterface {
    efivars: PathBuf,
}

impl BootLoaderInterface {
    /// `vfs` is the root under which `/sys/firmware/efi/efivars` is mounted
    pub fn new(vfs: impl AsRef<Path>) -> Result<Self, Error> {
        let efivars = vfs.as_ref().join("sys").join("firmware").join("efi").join("efivars");
        if !efivars.exists() {
            return Err(Error::Unavailable {
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "efivarfs not mounted"),
            });
        }
        Ok(Self { efivars })
    }

    fn variable_path(&self, name: VariableName) -> PathBuf {
        self.efivars.join(format!("{}-{LOADER_GUID}", name.as_str()))
    }

    fn read_raw(&self, name: VariableName) -> Result<Vec<u8>, Error> {
        let path = self.variable_path(name);
        let data = fs::read(&path).context(UnavailableSnafu)?;
        // first 4 bytes are the EFI variable attributes (u32 LE)
        Ok(data.into_iter().skip(4).collect())
    }

    /// Read a variable as a NUL-terminated UCS-2 string
    pub fn get_ucs2_string(&self, name: VariableName) -> Result<String, Error> {
        let raw = self.read_raw(name)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16(&units).map_err(|_| Error::InvalidEncoding {
            name: name.as_str().to_string(),
        })
    }

    /// Resolve `LoaderDevicePartUUID` to a `/dev/disk/by-partuuid/<uuid>` path
    pub fn get_device_path(&self) -> Result<PathBuf, Error> {
        let raw = self.get_ucs2_string(VariableName::DevicePartUuid)?;
        let normalised = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect::<String>()
            .to_lowercase();
        Ok(PathBuf::from("/dev/disk/by-partuuid").join(normalised))
    }
}
