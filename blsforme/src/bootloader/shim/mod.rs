// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! shim + systemd-boot two-stage UEFI backend.
//!
//! Layout on the ESP:
//!
//! ```text
//! /EFI/Boot/BOOTX64.EFI        <-- never touched, vendor fallback loader
//! /<namespace>/
//!     bootloaderx64.efi        <-- shim (first stage)
//!     loaderx64.efi            <-- systemd-boot (second stage)
//!     kernel/                  <-- installed kernels
//! /loader/                     <-- systemd-boot config + entries, shared format
//! ```
//!
//! The default fallback path is left alone; instead a dedicated EFI boot
//! variable is created (and pushed to the front of `BootOrder`) via
//! `efibootmgr`, pointing firmware at `bootloaderx64.efi` directly.

use std::{path::PathBuf, process::Command};

use crate::{
    bootloader::{Backend, Error},
    capability::{sets, CapabilitySet},
    file_utils::{changed_files, copy_atomic_vfat, PathExt},
    initrd::Registry,
    kernel::KernelIdentifier,
    manager::{Mounts, RootCmdline},
    Entry, Kernel, Schema,
};

#[derive(Debug)]
pub struct Loader<'a, 'b> {
    assets: &'b [PathBuf],
    schema: &'a Schema,
    namespace: String,
    esp: PathBuf,
    boot_root: PathBuf,
    kernel_dir: PathBuf,
}

impl<'a, 'b> Loader<'a, 'b> {
    pub(super) fn new(schema: &'a Schema, assets: &'b [PathBuf], mounts: &'a Mounts) -> Result<Self, Error> {
        let esp = mounts.esp.clone().ok_or(Error::MissingMount {
            description: "ESP (/efi)",
        })?;
        let boot_root = mounts.xbootldr.clone().unwrap_or_else(|| esp.clone());
        let namespace = schema.os_namespace();
        let kernel_dir = esp.join_insensitive(&namespace).join_insensitive("kernel");

        Ok(Self {
            schema,
            assets,
            namespace,
            esp,
            boot_root,
            kernel_dir,
        })
    }

    fn source(&self, suffix: &str) -> Result<&PathBuf, Error> {
        self.assets
            .iter()
            .find(|p| p.ends_with(suffix))
            .ok_or(Error::MissingFile { filename: "shim/systemd-boot binaries" })
    }

    fn shim_dest(&self) -> PathBuf {
        self.esp
            .join_insensitive("EFI")
            .join_insensitive(&self.namespace)
            .join_insensitive("bootloaderx64.efi")
    }

    fn loader_dest(&self) -> PathBuf {
        self.esp
            .join_insensitive("EFI")
            .join_insensitive(&self.namespace)
            .join_insensitive("loaderx64.efi")
    }

    fn targets(&self) -> Result<Vec<(PathBuf, PathBuf)>, Error> {
        Ok(vec![
            (self.source("shimx64.efi")?.clone(), self.shim_dest()),
            (self.source("systemd-bootx64.efi")?.clone(), self.loader_dest()),
        ])
    }

    fn loader_conf_path(&self) -> PathBuf {
        self.boot_root.join_insensitive("loader").join_insensitive("loader.conf")
    }

    fn create_boot_entry(&self) -> Result<(), Error> {
        let label = format!("{} (shim)", self.schema.os_name());
        let status = Command::new("efibootmgr")
            .args(["--create", "--disk", "--label", &label, "--loader"])
            .arg(format!("\\EFI\\{}\\bootloaderx64.efi", self.namespace))
            .status();
        match status {
            Ok(s) if s.success() => Ok(()),
            _ => {
                log::warn!("efibootmgr unavailable; firmware boot entry was not created");
                Ok(())
            }
        }
    }

    pub fn installed_kernels(&self) -> Result<Vec<Kernel>, Error> {
        let Ok(dir) = std::fs::read_dir(&self.kernel_dir) else {
            return Ok(vec![]);
        };
        let paths = dir.filter_map(|e| e.ok()).map(|e| e.path()).collect::<Vec<_>>();
        Ok(self.schema.discover_system_kernels(paths.iter()).unwrap_or_default())
    }
}

impl Backend for Loader<'_, '_> {
    fn capabilities(&self) -> CapabilitySet {
        sets::SHIM
    }

    fn kernel_destination(&self) -> Option<&str> {
        Some("kernel")
    }

    fn install_kernel(&mut self, cmdline: &str, entry: &Entry, initrds: &Registry, root: &RootCmdline) -> Result<(), Error> {
        let vmlinuz = self.kernel_dir.join_insensitive(
            entry
                .installed_kernel_name(self.schema)
                .ok_or(Error::MissingFile { filename: "vmlinuz" })?,
        );
        let mut changeset = vec![(entry.kernel.image.clone(), vmlinuz)];
        for initrd in &entry.kernel.initrd {
            if let Some(name) = entry.installed_asset_name(self.schema, initrd) {
                changeset.push((initrd.path.clone(), self.kernel_dir.join_insensitive(name)));
            }
        }
        for (source, dest) in changed_files(&changeset) {
            copy_atomic_vfat(source, dest)?;
        }

        let entries_dir = self.boot_root.join_insensitive("loader").join_insensitive("entries");
        std::fs::create_dir_all(&entries_dir)?;

        let title = if let Some(pretty) = self.schema.os_release().meta.pretty_name.as_ref() {
            format!("{pretty} ({})", entry.kernel.version)
        } else {
            format!("{} ({})", self.schema.os_name(), entry.kernel.version)
        };
        let merged_cmdline = if let Some(k_cmdline) = entry.kernel.cmdline.as_ref() {
            format!("{cmdline} {k_cmdline}")
        } else {
            cmdline.to_string()
        };
        let options = root.prefix(&merged_cmdline);
        let initrd_lines: String = entry
            .kernel
            .initrd
            .iter()
            .filter_map(|i| entry.installed_asset_name(self.schema, i))
            .map(|name| format!("initrd /{}/kernel/{}\n", self.namespace, name))
            .chain(initrds.iter().map(|i| format!("initrd /{}/kernel/{}\n", self.namespace, i.name)))
            .collect();

        let conf = format!(
            "title {title}\nlinux /{ns}/kernel/{vmlinuz}\n{initrd_lines}options {options}\n",
            ns = self.namespace,
            vmlinuz = entry.installed_kernel_name(self.schema).unwrap(),
        );

        let conf_path = entries_dir.join(format!("{}.conf", entry.id(self.schema)));
        let unchanged = std::fs::read_to_string(&conf_path).map(|e| e == conf).unwrap_or(false);
        if !unchanged {
            std::fs::write(conf_path, conf)?;
        }
        Ok(())
    }

    fn remove_kernel(&mut self, kernel: &Kernel) -> Result<(), Error> {
        if let Some(identifier) = kernel.identifier.as_ref() {
            let conf = self
                .boot_root
                .join_insensitive("loader")
                .join_insensitive("entries")
                .join(format!("{}.conf", identifier.format(&self.namespace)));
            crate::file_utils::remove_if_exists(conf)?;
        }
        if let Some(target) = kernel.current_target_name() {
            crate::file_utils::remove_if_exists(self.kernel_dir.join_insensitive(&target))?;
        }
        Ok(())
    }

    fn set_default_kernel(&mut self, kernel: Option<&Kernel>) -> Result<(), Error> {
        let timeout = std::fs::read_to_string(self.boot_root.join("timeout"))
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(10);

        let mut contents = String::new();
        if let Some(kernel) = kernel {
            if let Some(identifier) = kernel.identifier.as_ref() {
                contents.push_str(&format!("default {}.conf\n", identifier.format(&self.namespace)));
            }
        }
        contents.push_str(&format!("timeout {timeout}\n"));
        let path = self.loader_conf_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn default_kernel(&self) -> Option<KernelIdentifier> {
        let text = std::fs::read_to_string(self.loader_conf_path()).ok()?;
        let line = text.lines().find_map(|l| l.strip_prefix("default "))?;
        let basename = line.trim().strip_suffix(".conf").unwrap_or(line.trim());
        KernelIdentifier::parse(&self.namespace, basename)
    }

    fn needs_install(&self) -> bool {
        !self.shim_dest().exists() || !self.loader_dest().exists()
    }

    fn install(&mut self) -> Result<(), Error> {
        for (source, dest) in changed_files(&self.targets()?) {
            copy_atomic_vfat(source, dest)?;
        }
        self.create_boot_entry()
    }

    fn needs_update(&self) -> bool {
        self.targets().map(|t| !changed_files(&t).is_empty()).unwrap_or(false)
    }

    fn update(&mut self) -> Result<(), Error> {
        for (source, dest) in changed_files(&self.targets()?) {
            copy_atomic_vfat(source, dest)?;
        }
        Ok(())
    }

    fn remove(&mut self) -> Result<(), Error> {
        crate::file_utils::remove_dir_if_exists(self.esp.join_insensitive("EFI").join_insensitive(&self.namespace))?;
        crate::file_utils::remove_if_exists(self.loader_conf_path())?;
        Ok(())
    }
}
