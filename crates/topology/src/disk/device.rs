// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! A resolved block device within a custodial chain

use std::path::{Path, PathBuf};

use super::probe::Probe;

/// A single device in a dependency chain (root fs device, its LUKS backing
/// device, its physical parent, etc)
#[derive(Debug)]
pub struct BlockDevice<'a> {
    #[allow(dead_code)]
    probe: &'a Probe,

    /// `/dev/...` path for this device
    pub path: PathBuf,

    /// Mountpoint, if this exact device is mounted somewhere
    pub mountpoint: Option<PathBuf>,

    /// True if this device is a backing/custodial device further down the
    /// chain (LUKS physical volume, md member, etc) rather than the
    /// directly-mounted device itself
    pub backing: bool,

    /// Child (backing) devices, outermost first
    pub children: Vec<BlockDevice<'a>>,

    /// GPT PartUUID, if the parent disk is GPT
    pub guid: Option<String>,

    /// Filesystem UUID from the superblock, if readable
    pub uuid: Option<String>,
}

impl<'a> BlockDevice<'a> {
    /// Construct a new block device view, probing its superblock for a UUID
    pub fn new(
        probe: &'a Probe,
        path: impl AsRef<Path>,
        mountpoint: Option<PathBuf>,
        backing: bool,
    ) -> Result<Self, super::Error> {
        let path = path.as_ref().to_path_buf();
        let uuid = probe.get_device_superblock(&path).ok().and_then(|sb| sb.uuid());

        Ok(Self {
            probe,
            path,
            mountpoint,
            backing,
            children: vec![],
            guid: None,
            uuid,
        })
    }

    /// basename of the device path, e.g. `sda2`, `dm-1`, `md0`
    pub fn basename(&self) -> Option<&str> {
        self.path.file_name().and_then(|f| f.to_str())
    }

    /// True if this is a device-mapper node (`dm-N`)
    pub fn is_device_mapper(&self) -> bool {
        self.basename().is_some_and(|n| n.starts_with("dm-"))
    }

    /// True if this is a software RAID (md) node
    pub fn is_md_raid(&self) -> bool {
        self.basename().is_some_and(|n| n.starts_with("md"))
    }

    /// Depth-first search for the first LUKS (`crypto_LUKS`) ancestor in the chain
    pub fn find_luks_ancestor(&self) -> Option<&BlockDevice<'a>> {
        for child in &self.children {
            if child.uuid.is_some() && child.is_device_mapper() {
                return Some(child);
            }
            if let Some(found) = child.find_luks_ancestor() {
                return Some(found);
            }
        }
        None
    }
}
