// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Bootloader APIs

use std::path::{PathBuf, StripPrefixError};

use snafu::Snafu;

use crate::{
    capability::CapabilitySet,
    initrd::Registry,
    kernel::KernelIdentifier,
    manager::{Mounts, RootCmdline},
    Entry, Firmware, Kernel, Schema,
};

pub mod grub2;
pub mod shim;
pub mod syslinux;
pub mod systemd_boot;

/// Bootloader errors
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing bootloader file: {filename}"))]
    MissingFile { filename: &'static str },

    #[snafu(display("missing mountpoint: {description}"))]
    MissingMount { description: &'static str },

    #[snafu(context(false), display("io: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("wip: {source}"))]
    Prefix { source: StripPrefixError },

    #[snafu(display("external command `{command}` failed"))]
    ExternalCommand { command: &'static str },
}

/// Common contract every bootloader backend implements, per the polymorphic
/// bootloader backend design: initialise against a mountpoint, report
/// capabilities, and manage the kernel/default-kernel/binary lifecycle.
pub trait Backend {
    /// Capability set this backend satisfies
    fn capabilities(&self) -> CapabilitySet;

    /// Directory (relative to `$BOOT`) kernels are installed under, if any
    fn kernel_destination(&self) -> Option<&str>;

    /// Install (or queue, for accumulator-style backends) one kernel.
    /// `initrds` is the freestanding-initrd registry (emitted as additional
    /// `initrd` lines); `root` is the probed root device identity, rendered
    /// into the `root=`/`rd.luks.uuid=`/`rootflags=subvol=` prefix.
    fn install_kernel(&mut self, cmdline: &str, entry: &Entry, initrds: &Registry, root: &RootCmdline) -> Result<(), Error>;

    /// Remove all artefacts owned by one kernel
    fn remove_kernel(&mut self, kernel: &Kernel) -> Result<(), Error>;

    /// Set (or clear, via `None`, meaning "boot to timeout menu") the default kernel
    fn set_default_kernel(&mut self, kernel: Option<&Kernel>) -> Result<(), Error>;

    /// Currently configured default kernel identifier, if resolvable
    fn default_kernel(&self) -> Option<KernelIdentifier>;

    /// True if the bootloader binary itself is not yet installed
    fn needs_install(&self) -> bool;

    /// Install the bootloader binary/scripts (first-time setup)
    fn install(&mut self) -> Result<(), Error>;

    /// True if an installed bootloader binary differs from its source
    fn needs_update(&self) -> bool;

    /// Refresh an already-installed bootloader binary/scripts
    fn update(&mut self) -> Result<(), Error>;

    /// Remove everything this backend owns
    fn remove(&mut self) -> Result<(), Error>;
}

#[derive(Debug)]
pub enum Bootloader<'a, 'b> {
    /// ESP-class: systemd-boot / gummiboot / goofiboot
    Systemd(Box<systemd_boot::Loader<'a, 'b>>),

    /// shim + systemd-boot two-stage UEFI layout
    Shim(Box<shim::Loader<'a, 'b>>),

    /// syslinux/extlinux, queue-then-materialise
    Syslinux(Box<syslinux::Loader<'a, 'b>>),

    /// grub2 script generation + grub-mkconfig
    Grub2(Box<grub2::Loader<'a, 'b>>),
}

/// Compile-time-ordered list of candidate backends; the first whose
/// capability set is a superset of the wanted mask wins.
#[derive(Debug, Clone, Copy)]
enum Candidate {
    Shim,
    Systemd,
    Grub2,
    Syslinux,
    Extlinux,
}

const CANDIDATES: &[Candidate] = &[
    Candidate::Shim,
    Candidate::Systemd,
    Candidate::Grub2,
    Candidate::Syslinux,
    Candidate::Extlinux,
];

impl<'a, 'b> Bootloader<'a, 'b> {
    /// Construct the firmware/capability-appropriate bootloader backend.
    /// This is the Backend Selector from the update orchestrator design:
    /// iterate the compile-time-ordered candidate list and pick the first
    /// whose static capability set is a superset of `wanted`.
    pub(crate) fn select(
        schema: &'a Schema,
        assets: &'b [PathBuf],
        mounts: &'a Mounts,
        firmware: &Firmware,
        wanted: CapabilitySet,
    ) -> Result<Self, Error> {
        for candidate in CANDIDATES {
            let caps = match candidate {
                Candidate::Shim => crate::capability::sets::SHIM,
                Candidate::Systemd => crate::capability::sets::ESP_CLASS,
                Candidate::Grub2 => crate::capability::sets::GRUB2,
                Candidate::Syslinux => crate::capability::sets::SYSLINUX,
                Candidate::Extlinux => crate::capability::sets::EXTLINUX,
            };
            if !caps.is_superset_of(wanted) {
                continue;
            }
            // UEFI-class backends only make sense under UEFI firmware
            let is_uefi_backend = matches!(candidate, Candidate::Shim | Candidate::Systemd);
            if is_uefi_backend != matches!(firmware, Firmware::Uefi) {
                continue;
            }

            return Ok(match candidate {
                Candidate::Shim => Bootloader::Shim(Box::new(shim::Loader::new(schema, assets, mounts)?)),
                Candidate::Systemd => {
                    Bootloader::Systemd(Box::new(systemd_boot::Loader::new(schema, assets, mounts)?))
                }
                Candidate::Grub2 => Bootloader::Grub2(Box::new(grub2::Loader::new(schema, mounts)?)),
                Candidate::Syslinux => {
                    Bootloader::Syslinux(Box::new(syslinux::Loader::new(schema, assets, mounts, false)?))
                }
                Candidate::Extlinux => {
                    Bootloader::Syslinux(Box::new(syslinux::Loader::new(schema, assets, mounts, true)?))
                }
            });
        }

        Err(Error::MissingMount {
            description: "no bootloader backend satisfies the detected capability mask",
        })
    }

    fn inner_mut(&mut self) -> &mut dyn Backend {
        match self {
            Bootloader::Systemd(s) => s.as_mut(),
            Bootloader::Shim(s) => s.as_mut(),
            Bootloader::Syslinux(s) => s.as_mut(),
            Bootloader::Grub2(s) => s.as_mut(),
        }
    }

    fn inner(&self) -> &dyn Backend {
        match self {
            Bootloader::Systemd(s) => s.as_ref(),
            Bootloader::Shim(s) => s.as_ref(),
            Bootloader::Syslinux(s) => s.as_ref(),
            Bootloader::Grub2(s) => s.as_ref(),
        }
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.inner().capabilities()
    }

    pub fn install_kernel(&mut self, cmdline: &str, entry: &Entry, initrds: &Registry, root: &RootCmdline) -> Result<(), Error> {
        self.inner_mut().install_kernel(cmdline, entry, initrds, root)
    }

    pub fn remove_kernel(&mut self, kernel: &Kernel) -> Result<(), Error> {
        self.inner_mut().remove_kernel(kernel)
    }

    pub fn set_default_kernel(&mut self, kernel: Option<&Kernel>) -> Result<(), Error> {
        self.inner_mut().set_default_kernel(kernel)
    }

    pub fn default_kernel(&self) -> Option<KernelIdentifier> {
        self.inner().default_kernel()
    }

    pub fn needs_install(&self) -> bool {
        self.inner().needs_install()
    }

    pub fn install(&mut self) -> Result<(), Error> {
        self.inner_mut().install()
    }

    pub fn needs_update(&self) -> bool {
        self.inner().needs_update()
    }

    pub fn update(&mut self) -> Result<(), Error> {
        self.inner_mut().update()
    }

    pub fn remove(&mut self) -> Result<(), Error> {
        self.inner_mut().remove()
    }

    /// Grab the installed entries (ESP-class backends only; others return empty)
    pub fn installed_kernels(&self) -> Result<Vec<Kernel>, Error> {
        match self {
            Bootloader::Systemd(s) => s.installed_kernels(),
            Bootloader::Shim(s) => s.installed_kernels(),
            _ => Ok(vec![]),
        }
    }
}
