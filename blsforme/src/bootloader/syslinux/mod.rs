// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! syslinux/extlinux legacy-BIOS backend. Kernels are queued via
//! `install_kernel` and the whole config file is materialised in one shot
//! from `set_default_kernel`, matching the original's queue-then-flush
//! design (there is no per-entry file, just one `syslinux.cfg`/`extlinux.conf`).

use std::{
    cell::RefCell,
    path::PathBuf,
    process::Command,
};

use fs_err as fs;

use crate::{
    bootloader::{Backend, Error},
    capability::{sets, CapabilitySet},
    file_utils::copy_atomic_vfat,
    initrd::Registry,
    kernel::KernelIdentifier,
    manager::{Mounts, RootCmdline},
    Entry, Kernel, Schema,
};

#[derive(Debug)]
pub struct Loader<'a, 'b> {
    assets: &'b [PathBuf],
    schema: &'a Schema,
    base_path: PathBuf,
    is_extlinux: bool,
    queue: RefCell<Vec<(String, String)>>,
}

impl<'a, 'b> Loader<'a, 'b> {
    pub(super) fn new(
        schema: &'a Schema,
        assets: &'b [PathBuf],
        mounts: &'a Mounts,
        is_extlinux: bool,
    ) -> Result<Self, Error> {
        let base_path = mounts
            .xbootldr
            .clone()
            .or_else(|| mounts.esp.clone())
            .ok_or(Error::MissingMount { description: "/boot" })?;
        Ok(Self {
            schema,
            assets,
            base_path,
            is_extlinux,
            queue: RefCell::new(vec![]),
        })
    }

    fn config_name(&self) -> &'static str {
        if self.is_extlinux {
            "extlinux.conf"
        } else {
            "syslinux.cfg"
        }
    }

    fn config_path(&self) -> PathBuf {
        self.base_path.join(self.config_name())
    }

    fn mbr_source(&self) -> Option<&PathBuf> {
        self.assets.iter().find(|p| p.ends_with("syslinux.bin") || p.ends_with("gptmbr.bin"))
    }

    fn write_config(&self, default: Option<&Kernel>) -> Result<(), Error> {
        let mut buf = String::new();

        if default.is_none() {
            buf.push_str("TIMEOUT 100\n");
        }

        for (target, options) in self.queue.borrow().iter() {
            if let Some(default) = default {
                if default.current_target_name().as_deref() == Some(target.as_str()) {
                    buf.push_str(&format!("DEFAULT {target}\n"));
                }
            }
            buf.push_str(&format!("LABEL {target}\n"));
            buf.push_str(&format!("  KERNEL {target}\n"));
            buf.push_str(&format!("APPEND {options}\n"));
        }

        let path = self.config_path();
        let unchanged = fs::read_to_string(&path).map(|e| e == buf).unwrap_or(false);
        if !unchanged {
            fs::write(path, buf)?;
        }
        Ok(())
    }

    fn run_installer(&self) -> Result<(), Error> {
        let command = if self.is_extlinux { "extlinux" } else { "syslinux-nomtools" };
        let status = Command::new(command)
            .arg("--install")
            .arg(&self.base_path)
            .status()
            .map_err(|_| Error::ExternalCommand { command })?;
        if !status.success() {
            return Err(Error::ExternalCommand { command });
        }
        Ok(())
    }
}

impl Backend for Loader<'_, '_> {
    fn capabilities(&self) -> CapabilitySet {
        if self.is_extlinux {
            sets::EXTLINUX
        } else {
            sets::SYSLINUX
        }
    }

    fn kernel_destination(&self) -> Option<&str> {
        None
    }

    fn install_kernel(&mut self, cmdline: &str, entry: &Entry, _initrds: &Registry, root: &RootCmdline) -> Result<(), Error> {
        let target = entry
            .kernel
            .legacy_target_name()
            .ok_or(Error::MissingFile { filename: "vmlinuz" })?;

        let dest = self.base_path.join(&target);
        copy_atomic_vfat(&entry.kernel.image, &dest)?;

        let merged_cmdline = if let Some(k_cmdline) = entry.kernel.cmdline.as_ref() {
            format!("{cmdline} {k_cmdline}")
        } else {
            cmdline.to_string()
        };
        let options = root.prefix_no_subvol(&merged_cmdline);

        let mut queue = self.queue.borrow_mut();
        if !queue.iter().any(|(t, _)| t == &target) {
            queue.push((target, options));
        }
        Ok(())
    }

    fn remove_kernel(&mut self, kernel: &Kernel) -> Result<(), Error> {
        if let Some(target) = kernel.legacy_target_name() {
            crate::file_utils::remove_if_exists(self.base_path.join(target))?;
        }
        Ok(())
    }

    fn set_default_kernel(&mut self, kernel: Option<&Kernel>) -> Result<(), Error> {
        self.write_config(kernel)
    }

    fn default_kernel(&self) -> Option<KernelIdentifier> {
        let text = fs::read_to_string(self.config_path()).ok()?;
        let basename = text.lines().find_map(|l| l.strip_prefix("DEFAULT "))?;
        KernelIdentifier::parse(&self.schema.os_namespace(), basename.trim())
    }

    fn needs_install(&self) -> bool {
        true
    }

    fn install(&mut self) -> Result<(), Error> {
        if let Some(source) = self.mbr_source() {
            copy_atomic_vfat(source, self.base_path.join("syslinux.bin"))?;
        }
        self.run_installer()
    }

    fn needs_update(&self) -> bool {
        true
    }

    fn update(&mut self) -> Result<(), Error> {
        self.install()
    }

    fn remove(&mut self) -> Result<(), Error> {
        crate::file_utils::remove_if_exists(self.config_path())?;
        crate::file_utils::remove_if_exists(self.base_path.join("syslinux.bin"))?;
        Ok(())
    }
}
