// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! GRUB2 backend: writes one `/etc/grub.d/10_<id>` script per kernel, and
//! shells out to `grub-mkconfig` on default-kernel changes. No dedicated
//! kernel/initrd copy step: grub reads the kernel tree in place.

use std::{path::PathBuf, process::Command};

use fs_err as fs;

use crate::{
    bootloader::{Backend, Error},
    capability::{sets, CapabilitySet},
    initrd::Registry,
    kernel::KernelIdentifier,
    manager::{Mounts, RootCmdline},
    Entry, Kernel, Schema,
};

#[derive(Debug)]
pub struct Loader<'a, 'b> {
    schema: &'a Schema,
    prefix: PathBuf,
    _phantom: std::marker::PhantomData<&'b ()>,
}

impl<'a, 'b> Loader<'a, 'b> {
    pub(super) fn new(schema: &'a Schema, mounts: &'a Mounts) -> Result<Self, Error> {
        let prefix = mounts
            .xbootldr
            .clone()
            .or_else(|| mounts.esp.clone())
            .ok_or(Error::MissingMount { description: "/boot" })?;
        Ok(Self {
            schema,
            prefix,
            _phantom: std::marker::PhantomData,
        })
    }

    fn script_path(&self, identifier: &KernelIdentifier) -> PathBuf {
        self.prefix
            .join("etc")
            .join("grub.d")
            .join(format!("10_{}_{}", self.schema.os_id(), identifier.format(&self.schema.os_namespace())))
    }

    fn write_script(&self, entry: &Entry, cmdline: &str, root: &RootCmdline) -> Result<(), Error> {
        let Some(identifier) = entry.kernel.identifier.as_ref() else {
            return Ok(());
        };

        let title = if let Some(pretty) = self.schema.os_release().meta.pretty_name.as_ref() {
            format!("{pretty} ({})", entry.kernel.version)
        } else {
            format!("{} ({})", self.schema.os_name(), entry.kernel.version)
        };

        let mut initrd_paths = String::new();
        for initrd in &entry.kernel.initrd {
            if let Some(name) = entry.installed_asset_name(self.schema, initrd) {
                initrd_paths.push_str(&format!(" /{name}"));
            }
        }

        let kernel_path = entry
            .installed_kernel_name(self.schema)
            .ok_or(Error::MissingFile { filename: "vmlinuz" })?;

        let cmdline = root.prefix(cmdline);

        let script = format!(
            r###"#!/bin/sh
exec tail -n +3 $0
# This file is generated and will be overwritten on every update
menuentry '{title}' --class {os_id} --class gnu-linux --class gnu --class os {{
	load_video
	insmod gzio
	echo 'Loading {os_name} {version} ...'
	linux /{kernel_path} {cmdline}
	echo 'Loading initial ramdisk ...'
	initrd{initrd_paths}
}}
"###,
            title = title,
            os_id = self.schema.os_id(),
            os_name = self.schema.os_name(),
            version = entry.kernel.version,
            kernel_path = kernel_path,
            cmdline = cmdline,
            initrd_paths = initrd_paths,
        );

        let path = self.script_path(identifier);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, script)?;
        Ok(())
    }

    fn run_mkconfig(&self) -> Result<(), Error> {
        let cfg = self.prefix.join("boot").join("grub").join("grub.cfg");
        if let Some(parent) = cfg.parent() {
            fs::create_dir_all(parent)?;
        }
        let status = Command::new("grub-mkconfig")
            .arg("-o")
            .arg(&cfg)
            .status()
            .map_err(|_| Error::ExternalCommand { command: "grub-mkconfig" })?;
        if !status.success() {
            return Err(Error::ExternalCommand { command: "grub-mkconfig" });
        }
        Ok(())
    }
}

impl Backend for Loader<'_, '_> {
    fn capabilities(&self) -> CapabilitySet {
        sets::GRUB2
    }

    fn kernel_destination(&self) -> Option<&str> {
        None
    }

    fn install_kernel(&mut self, cmdline: &str, entry: &Entry, _initrds: &Registry, root: &RootCmdline) -> Result<(), Error> {
        self.write_script(entry, cmdline, root)
    }

    fn remove_kernel(&mut self, kernel: &Kernel) -> Result<(), Error> {
        if let Some(identifier) = kernel.identifier.as_ref() {
            crate::file_utils::remove_if_exists(self.script_path(identifier))?;
        }
        Ok(())
    }

    fn set_default_kernel(&mut self, _kernel: Option<&Kernel>) -> Result<(), Error> {
        self.run_mkconfig()
    }

    fn default_kernel(&self) -> Option<KernelIdentifier> {
        None
    }

    fn needs_install(&self) -> bool {
        false
    }

    fn install(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn needs_update(&self) -> bool {
        false
    }

    fn update(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn remove(&mut self) -> Result<(), Error> {
        let dir = self.prefix.join("etc").join("grub.d");
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(&format!("10_{}_", self.schema.os_id())) {
                    crate::file_utils::remove_if_exists(entry.path())?;
                }
            }
        }
        Ok(())
    }
}
