// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! systemd-boot (and ABI-compatible gummiboot/goofiboot) ESP-class backend

use std::{
    fs::{self, create_dir_all},
    path::PathBuf,
};

use crate::{
    bootloader::{Backend, Error},
    capability::{sets, CapabilitySet},
    file_utils::{changed_files, copy_atomic_vfat, PathExt},
    initrd::Registry,
    kernel::KernelIdentifier,
    manager::{Mounts, RootCmdline},
    Entry, Kernel, Schema,
};

pub mod interface;

/// systemd specific bootloader behaviours
/// NOTE: Currently secure boot is NOT supported (or fbx64)
#[derive(Debug)]
pub struct Loader<'a, 'b> {
    assets: &'b [PathBuf],
    mounts: &'a Mounts,

    schema: &'a Schema,
    kernel_dir: PathBuf,
    boot_root: PathBuf,
    namespace: String,
}

impl<'a, 'b> Loader<'a, 'b> {
    /// Construct a new systemd boot loader manager
    pub(super) fn new(schema: &'a Schema, assets: &'b [PathBuf], mounts: &'a Mounts) -> Result<Self, Error> {
        let boot_root = if let Some(xbootldr) = mounts.xbootldr.as_ref() {
            xbootldr.clone()
        } else if let Some(esp) = mounts.esp.as_ref() {
            esp.clone()
        } else {
            return Err(Error::MissingMount {
                description: "ESP (/efi)",
            });
        };

        let namespace = schema.os_namespace();
        let kernel_dir = boot_root.join_insensitive("EFI").join_insensitive(&namespace);

        Ok(Self {
            schema,
            assets,
            mounts,
            kernel_dir,
            boot_root,
            namespace,
        })
    }

    fn stub_source(&self) -> Result<&PathBuf, Error> {
        self.assets
            .iter()
            .find(|p| p.ends_with("systemd-bootx64.efi"))
            .ok_or(Error::MissingFile {
                filename: "systemd-bootx64.efi",
            })
    }

    fn esp(&self) -> Result<&PathBuf, Error> {
        self.mounts.esp.as_ref().ok_or(Error::MissingMount {
            description: "ESP (/efi)",
        })
    }

    fn stub_targets(&self) -> Result<Vec<(PathBuf, PathBuf)>, Error> {
        let x64_efi = self.stub_source()?;
        let esp = self.esp()?;
        Ok(vec![
            (
                x64_efi.clone(),
                esp.join_insensitive("EFI")
                    .join_insensitive("Boot")
                    .join_insensitive("BOOTX64.EFI"),
            ),
            (
                x64_efi.clone(),
                esp.join_insensitive("EFI")
                    .join_insensitive("systemd")
                    .join_insensitive("systemd-bootx64.efi"),
            ),
        ])
    }

    fn loader_conf_path(&self) -> PathBuf {
        self.boot_root.join_insensitive("loader").join_insensitive("loader.conf")
    }

    /// Generate a usable loader config entry
    fn generate_entry(&self, asset_dir: &str, cmdline: &str, entry: &Entry, initrds: &Registry, root: &RootCmdline) -> String {
        let kernel_initrds: String = entry
            .kernel
            .initrd
            .iter()
            .filter_map(|asset| {
                Some(format!(
                    "\ninitrd /{asset_dir}/{}",
                    entry.installed_asset_name(self.schema, asset)?
                ))
            })
            .collect();
        let freestanding_initrds: String = initrds
            .iter()
            .map(|i| format!("\ninitrd /{asset_dir}/{}", i.name))
            .collect();
        let all_initrds = format!("{kernel_initrds}{freestanding_initrds}");
        let initrd = if all_initrds.is_empty() { "\n".to_string() } else { format!("\n{all_initrds}") };
        let title = if let Some(pretty) = self.schema.os_release().meta.pretty_name.as_ref() {
            format!("{pretty} ({})", entry.kernel.version)
        } else {
            format!("{} ({})", self.schema.os_release().name, entry.kernel.version)
        };
        let vmlinuz = entry.installed_kernel_name(self.schema).expect("linux go boom");
        let merged_cmdline = if let Some(k_cmdline) = entry.kernel.cmdline.as_ref() {
            format!("{cmdline} {k_cmdline}")
        } else {
            cmdline.to_string()
        };
        let options = root.prefix(&merged_cmdline);
        format!(
            r###"title {title}
linux /{asset_dir}/{}{}
options {}
"###,
            vmlinuz, initrd, options
        )
    }

    pub fn installed_kernels(&self) -> Result<Vec<Kernel>, Error> {
        let mut all_paths = vec![];
        let Ok(dir) = fs::read_dir(&self.kernel_dir) else {
            return Ok(vec![]);
        };
        for entry in dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let paths = fs::read_dir(entry.path())?
                .filter_map(|p| p.ok())
                .map(|d| d.path())
                .collect::<Vec<_>>();
            all_paths.extend(paths);
        }

        Ok(self.schema.discover_system_kernels(all_paths.iter()).unwrap_or_default())
    }
}

impl Backend for Loader<'_, '_> {
    fn capabilities(&self) -> CapabilitySet {
        sets::ESP_CLASS
    }

    fn kernel_destination(&self) -> Option<&str> {
        Some(self.namespace.as_str())
    }

    fn install_kernel(&mut self, cmdline: &str, entry: &Entry, initrds: &Registry, root: &RootCmdline) -> Result<(), Error> {
        let loader_id = self
            .boot_root
            .join_insensitive("loader")
            .join_insensitive("entries")
            .join_insensitive(entry.id(self.schema))
            .with_extension("conf");
        log::trace!("writing entry: {}", loader_id.display());

        let vmlinuz = self.kernel_dir.join_insensitive(
            entry
                .installed_kernel_name(self.schema)
                .ok_or(Error::MissingFile { filename: "vmlinuz" })?,
        );
        let kernel_initrd_files = entry
            .kernel
            .initrd
            .iter()
            .filter_map(|asset| {
                Some((
                    asset.path.clone(),
                    self.kernel_dir
                        .join_insensitive(entry.installed_asset_name(self.schema, asset)?),
                ))
            })
            .collect::<Vec<_>>();

        let mut changeset = vec![(entry.kernel.image.clone(), vmlinuz)];
        changeset.extend(kernel_initrd_files);

        for (source, dest) in changed_files(changeset.as_slice()) {
            copy_atomic_vfat(source, dest)?;
        }

        let loader_config = self.generate_entry(
            self.kernel_dir
                .strip_prefix(&self.boot_root)
                .map_err(|source| Error::Prefix { source })?
                .to_string_lossy()
                .as_ref(),
            cmdline,
            entry,
            initrds,
            root,
        );

        let entry_dir = self.boot_root.join_insensitive("loader").join_insensitive("entries");
        if !entry_dir.exists() {
            create_dir_all(entry_dir)?;
        }

        let unchanged = fs::read_to_string(&loader_id)
            .map(|existing| existing == loader_config)
            .unwrap_or(false);
        if !unchanged {
            fs::write(loader_id, loader_config)?;
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
        for initrd in &kernel.initrd {
            if let Some(name) = initrd.path.file_name() {
                crate::file_utils::remove_if_exists(self.kernel_dir.join_insensitive(format!("initrd-{}", name.to_string_lossy())))?;
            }
        }
        Ok(())
    }

    fn set_default_kernel(&mut self, kernel: Option<&Kernel>) -> Result<(), Error> {
        let timeout = fs::read_to_string(self.boot_root.join("timeout"))
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok());

        let mut contents = String::new();
        if let Some(kernel) = kernel {
            if let Some(identifier) = kernel.identifier.as_ref() {
                contents.push_str(&format!("default {}.conf\n", identifier.format(&self.namespace)));
            }
        }
        contents.push_str(&format!("timeout {}\n", timeout.unwrap_or(10)));

        let path = self.loader_conf_path();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let unchanged = fs::read_to_string(&path).map(|e| e == contents).unwrap_or(false);
        if !unchanged {
            fs::write(path, contents)?;
        }
        Ok(())
    }

    fn default_kernel(&self) -> Option<KernelIdentifier> {
        let text = fs::read_to_string(self.loader_conf_path()).ok()?;
        let line = text.lines().find_map(|l| l.strip_prefix("default "))?;
        let basename = line.trim().strip_suffix(".conf").unwrap_or(line.trim());
        KernelIdentifier::parse(&self.namespace, basename)
    }

    fn needs_install(&self) -> bool {
        self.stub_targets()
            .map(|targets| targets.iter().any(|(_, dest)| !dest.exists()))
            .unwrap_or(true)
    }

    fn install(&mut self) -> Result<(), Error> {
        for (source, dest) in changed_files(&self.stub_targets()?) {
            copy_atomic_vfat(source, dest)?;
        }
        Ok(())
    }

    fn needs_update(&self) -> bool {
        self.stub_targets()
            .map(|targets| !changed_files(&targets).is_empty())
            .unwrap_or(false)
    }

    fn update(&mut self) -> Result<(), Error> {
        self.install()
    }

    fn remove(&mut self) -> Result<(), Error> {
        if let Ok(esp) = self.esp() {
            crate::file_utils::remove_dir_if_exists(esp.join_insensitive("EFI").join_insensitive(&self.namespace))?;
            crate::file_utils::remove_if_exists(
                esp.join_insensitive("EFI")
                    .join_insensitive("Boot")
                    .join_insensitive("BOOTX64.EFI"),
            )?;
        }
        crate::file_utils::remove_if_exists(self.loader_conf_path())?;
        Ok(())
    }
}
