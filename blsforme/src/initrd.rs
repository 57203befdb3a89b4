// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Freestanding (kernel-independent) initrd registry, e.g. microcode or
//! recovery initrds that are not tied to a specific kernel version and get
//! concatenated ahead of the kernel-specific initrd at boot.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use fs_err as fs;

/// A single freestanding initrd, tracked by its basename
#[derive(Debug, Clone)]
pub struct FreestandingInitrd {
    /// On-disk display name, e.g. `freestanding-intel-ucode.img`
    pub name: String,
    pub source: PathBuf,
}

/// Admin-first, first-registration-wins registry of freestanding initrds
#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<String, FreestandingInitrd>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `admin_dir` (highest priority) then `vendor_dir`, registering
    /// each basename once under its display key `freestanding-<basename>`.
    /// An admin entry whose symlink target contains `/dev/null` masks any
    /// vendor entry of the same basename.
    pub fn scan(&mut self, admin_dir: impl AsRef<Path>, vendor_dir: impl AsRef<Path>) -> std::io::Result<()> {
        let mut masked = Vec::new();

        if let Ok(entries) = fs::read_dir(admin_dir.as_ref()) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let basename = entry.file_name().to_string_lossy().to_string();
                if is_masked(&path) {
                    masked.push(basename);
                    continue;
                }
                self.entries.entry(basename.clone()).or_insert(FreestandingInitrd {
                    name: format!("freestanding-{basename}"),
                    source: path,
                });
            }
        }

        if let Ok(entries) = fs::read_dir(vendor_dir.as_ref()) {
            for entry in entries.filter_map(|e| e.ok()) {
                let basename = entry.file_name().to_string_lossy().to_string();
                if masked.contains(&basename) {
                    continue;
                }
                let path = entry.path();
                self.entries.entry(basename.clone()).or_insert(FreestandingInitrd {
                    name: format!("freestanding-{basename}"),
                    source: path,
                });
            }
        }

        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &FreestandingInitrd> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy every registered initrd into `dest_dir`, skipping unchanged content
    pub fn copy_out(&self, dest_dir: impl AsRef<Path>) -> std::io::Result<()> {
        let dest_dir = dest_dir.as_ref();
        fs::create_dir_all(dest_dir)?;
        let pairs = self
            .entries
            .values()
            .map(|i| (i.source.clone(), dest_dir.join(&i.name)))
            .collect::<Vec<_>>();
        for (source, dest) in crate::file_utils::changed_files(&pairs) {
            crate::file_utils::copy_atomic_vfat(source, dest)?;
        }
        Ok(())
    }

    /// Remove any `freestanding-*` file in `dest_dir` that is no longer
    /// registered. Never touches files outside that namespace, since
    /// `dest_dir` is typically also where the installed kernels/initrds live.
    pub fn prune(&self, dest_dir: impl AsRef<Path>) -> std::io::Result<()> {
        let dest_dir = dest_dir.as_ref();
        let Ok(entries) = fs::read_dir(dest_dir) else {
            return Ok(());
        };
        let registered: std::collections::HashSet<&str> = self.entries.values().map(|i| i.name.as_str()).collect();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("freestanding-") && !registered.contains(name.as_str()) {
                crate::file_utils::remove_if_exists(entry.path())?;
            }
        }
        Ok(())
    }
}

fn is_masked(path: &Path) -> bool {
    fs::read_link(path)
        .map(|target| target.to_string_lossy().contains("/dev/null"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::fs as stdfs;

    use super::*;

    #[test]
    fn admin_entry_wins_over_vendor() {
        let root = tempfile::tempdir().unwrap();
        let admin = root.path().join("admin");
        let vendor = root.path().join("vendor");
        stdfs::create_dir_all(&admin).unwrap();
        stdfs::create_dir_all(&vendor).unwrap();

        stdfs::write(vendor.join("intel-ucode.img"), b"vendor").unwrap();
        stdfs::write(admin.join("intel-ucode.img"), b"admin").unwrap();

        let mut registry = Registry::new();
        registry.scan(&admin, &vendor).unwrap();

        let entry = registry.iter().find(|e| e.name == "freestanding-intel-ucode.img").unwrap();
        assert_eq!(stdfs::read(&entry.source).unwrap(), b"admin");
    }

    #[test]
    fn prune_only_removes_freestanding_files() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("dest");
        stdfs::create_dir_all(&dest).unwrap();
        stdfs::write(dest.join("freestanding-stale.img"), b"x").unwrap();
        stdfs::write(dest.join("kernel-6.6.0-1"), b"not freestanding").unwrap();

        let registry = Registry::new();
        registry.prune(&dest).unwrap();

        assert!(!dest.join("freestanding-stale.img").exists());
        assert!(dest.join("kernel-6.6.0-1").exists());
    }

    #[test]
    fn masked_admin_entry_hides_vendor() {
        let root = tempfile::tempdir().unwrap();
        let admin = root.path().join("admin");
        let vendor = root.path().join("vendor");
        stdfs::create_dir_all(&admin).unwrap();
        stdfs::create_dir_all(&vendor).unwrap();

        stdfs::write(vendor.join("extra.img"), b"vendor").unwrap();
        std::os::unix::fs::symlink("/dev/null", admin.join("extra.img")).unwrap();

        let mut registry = Registry::new();
        registry.scan(&admin, &vendor).unwrap();

        assert!(registry.is_empty());
    }
}
