// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Parsed view of `/proc/self/mounts`

use std::{fs, io, path::Path};

/// A single parsed mount table row
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
}

/// In-memory snapshot of the kernel mount table
#[derive(Debug, Default, Clone)]
pub struct Table {
    entries: Vec<MountEntry>,
}

impl Table {
    /// Parse a mounts-format file (`/proc/self/mounts`, `/proc/mounts`, etc)
    pub fn new_from_path(path: impl AsRef<Path>) -> Result<Self, io::Error> {
        let text = fs::read_to_string(path)?;
        let entries = text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?.to_string();
                let mountpoint = unescape_field(fields.next()?);
                let fstype = fields.next()?.to_string();
                Some(MountEntry {
                    device,
                    mountpoint,
                    fstype,
                })
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountEntry> {
        self.entries.iter()
    }

    /// Filesystem type backing the given device, if mounted
    pub fn fstype_of(&self, device: &str) -> Option<&str> {
        self.entries.iter().find(|e| e.device == device).map(|e| e.fstype.as_str())
    }

    /// Mountpoint the given device is mounted at, if any
    pub fn mountpoint_of(&self, device: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.device == device)
            .map(|e| e.mountpoint.as_str())
    }

    /// Is the given path already a mountpoint?
    pub fn is_mountpoint(&self, path: &str) -> bool {
        self.entries.iter().any(|e| e.mountpoint == path)
    }
}

/// `/proc/self/mounts` octal-escapes space, tab, newline and backslash
fn unescape_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mount_table() {
        let text = "/dev/sda2 / ext4 rw,relatime 0 0\n/dev/sda1 /boot vfat rw,relatime 0 0\n";
        let entries: Vec<MountEntry> = text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?.to_string();
                let mountpoint = unescape_field(fields.next()?);
                let fstype = fields.next()?.to_string();
                Some(MountEntry {
                    device,
                    mountpoint,
                    fstype,
                })
            })
            .collect();
        let table = Table { entries };
        assert_eq!(table.fstype_of("/dev/sda1"), Some("vfat"));
        assert!(table.is_mountpoint("/boot"));
        assert_eq!(table.mountpoint_of("/dev/sda2"), Some("/"));
    }

    #[test]
    fn unescapes_space_in_mountpoint() {
        assert_eq!(unescape_field("/mnt/My\\040Disk"), "/mnt/My Disk");
    }
}
