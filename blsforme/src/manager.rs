// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The top level orchestrator: owns the detected boot environment, the
//! selected bootloader backend, and drives kernel install/removal, default
//! kernel selection and the retention policy.

use std::path::PathBuf;

use fs_err as fs;
use snafu::{OptionExt, ResultExt};
use topology::disk::{probe::DeviceIdentity, Builder};

use crate::{
    bootenv::{BootEnvironment, Firmware},
    bootloader::Bootloader,
    capability::{Capability, CapabilitySet},
    cmdline::Assembler,
    initrd::Registry,
    Configuration, Entry, Error, Kernel, Root, Schema,
};

/// Root device identity rendered into the `root=`/`rd.luks.uuid=`/
/// `rootflags=subvol=` kernel parameters every backend prepends to its
/// assembled cmdline. `PARTUUID` is only used when the parent disk is GPT,
/// `UUID` otherwise.
#[derive(Debug, Clone, Default)]
pub struct RootCmdline {
    root: Option<String>,
    luks: Option<String>,
    subvol: Option<String>,
}

impl RootCmdline {
    fn from_identity(identity: &DeviceIdentity) -> Self {
        let root = if identity.gpt {
            identity
                .part_uuid
                .as_ref()
                .map(|u| format!("root=PARTUUID={u}"))
                .or_else(|| identity.uuid.as_ref().map(|u| format!("root=UUID={u}")))
        } else {
            identity.uuid.as_ref().map(|u| format!("root=UUID={u}"))
        };
        Self {
            root,
            luks: identity.luks_uuid.as_ref().map(|u| format!("rd.luks.uuid={u}")),
            subvol: identity.btrfs_subvol.as_ref().map(|s| format!("rootflags=subvol={s}")),
        }
    }

    /// `root=… [rd.luks.uuid=…] [rootflags=subvol=…]`, prepended to `cmdline`
    /// by the ESP-class, shim and grub2 backends.
    pub fn prefix(&self, cmdline: &str) -> String {
        Self::join(&Self::parts([self.root.as_deref(), self.luks.as_deref(), self.subvol.as_deref()]), cmdline)
    }

    /// `root=… [rd.luks.uuid=…]`, omitting `rootflags=subvol=`: the
    /// syslinux/extlinux `APPEND` line does not carry the subvolume hint,
    /// carried over unchanged from the original implementation.
    pub fn prefix_no_subvol(&self, cmdline: &str) -> String {
        Self::join(&Self::parts([self.root.as_deref(), self.luks.as_deref()]), cmdline)
    }

    fn parts<const N: usize>(fields: [Option<&str>; N]) -> String {
        fields.into_iter().flatten().collect::<Vec<_>>().join(" ")
    }

    fn join(root: &str, cmdline: &str) -> String {
        match (root.is_empty(), cmdline.is_empty()) {
            (true, _) => cmdline.to_string(),
            (false, true) => root.to_string(),
            (false, false) => format!("{root} {cmdline}"),
        }
    }
}

/// Filesystem roots the selected bootloader backend is permitted to write
/// into; distinct from the raw block devices `BootEnvironment` tracks.
#[derive(Debug, Default, Clone)]
pub struct Mounts {
    pub esp: Option<PathBuf>,
    pub xbootldr: Option<PathBuf>,
}

impl Mounts {
    fn discover(env: &BootEnvironment, config: &Configuration) -> Self {
        // In native mode the ESP/XBOOTLDR partitions are expected to already
        // be mounted at their conventional mountpoints beneath the sysroot;
        // in image mode the caller is expected to have bind-mounted them
        // beneath `config.root` ahead of time (the Mount Coordinator's job).
        let esp = env.esp().map(|_| config.root.path().join("efi"));
        let xbootldr = env.xbootldr().map(|_| config.root.path().join("boot"));
        Self { esp, xbootldr }
    }
}

/// Tri-state mount coordinator result for a single boot mountpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// Already mounted, and at the device we expect
    AlreadyMounted,
    /// We mounted it ourselves this run
    Mounted,
    /// Nothing to mount (no matching partition detected)
    NotApplicable,
}

/// Top level boot management orchestrator
pub struct Manager<'a> {
    config: &'a Configuration,
    schema: Schema,
    env: BootEnvironment,
    mounts: Mounts,
    assets: Vec<PathBuf>,
    root_identity: DeviceIdentity,
}

impl<'a> Manager<'a> {
    /// Construct a manager for the given configuration and schema, probing
    /// the underlying block device topology and boot environment.
    pub fn new(config: &'a Configuration, schema: Schema) -> Result<Self, Error> {
        let probe = Builder::default()
            .with_sysfs(config.vfs.join("sys"))
            .with_devfs(config.vfs.join("dev"))
            .with_procfs(config.vfs.join("proc"))
            .build()?;
        let disk_parent = probe.get_device_parent(config.root.path());
        let env = BootEnvironment::new(&probe, disk_parent, config)?;
        let mounts = Mounts::discover(&env, config);
        let root_identity = probe.probe_identity(config.root.path()).unwrap_or_else(|e| {
            log::warn!("failed to determine root device identity: {e}");
            DeviceIdentity::default()
        });

        Ok(Self {
            config,
            schema,
            env,
            mounts,
            assets: vec![],
            root_identity,
        })
    }

    /// `/usr/lib/kernel`, the kernel source tree beneath the configured root
    fn kernel_dir(&self) -> PathBuf {
        self.config.root.path().join("usr").join("lib").join("kernel")
    }

    /// Register a bootloader asset (e.g. a vendored `systemd-bootx64.efi`)
    /// discovered on disk; used during backend selection.
    pub fn with_assets(mut self, assets: Vec<PathBuf>) -> Self {
        self.assets = assets;
        self
    }

    /// The detected boot environment (ESP/XBOOTLDR device paths, firmware)
    pub fn environment(&self) -> &BootEnvironment {
        &self.env
    }

    /// The active kernel discovery schema
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn wanted_capabilities(&self) -> CapabilitySet {
        let mut wanted = CapabilitySet::empty();
        wanted.insert(Capability::Gpt);
        if matches!(self.env.firmware(), Firmware::Uefi) {
            wanted.insert(Capability::Uefi);
            wanted.insert(Capability::Fatfs);
        } else {
            wanted.insert(Capability::Legacy);
        }
        wanted
    }

    /// Run the Backend Selector: pick the bootloader implementation whose
    /// capabilities satisfy the detected firmware/partition layout.
    pub fn select_bootloader(&'a self) -> Result<Bootloader<'a, 'a>, Error> {
        Ok(Bootloader::select(
            &self.schema,
            &self.assets,
            &self.mounts,
            &self.env.firmware(),
            self.wanted_capabilities(),
        )?)
    }

    /// Discover every kernel present in the source tree (`/usr/lib/kernel`,
    /// or the Blsforme schema's versioned module directories).
    pub fn discover_kernels(&self) -> Result<Vec<Kernel>, Error> {
        let paths = glob_dir(&self.kernel_dir());
        self.schema.discover_system_kernels(paths.iter())
    }

    /// Install every discovered kernel, apply the retention policy, then
    /// set the default kernel and refresh the bootloader binary.
    ///
    /// Image mode installs every discovered kernel and sets the default to
    /// the overall highest release; native mode additionally runs the
    /// running/tip/last-good retention policy and garbage-collects anything
    /// outside that set.
    pub fn update(&'a self, cmdline: &Assembler, initrds: &Registry) -> Result<(), Error> {
        let kernels = self.discover_kernels()?;
        if kernels.is_empty() {
            log::warn!("no kernels discovered beneath {}", self.config.root.path().display());
        }

        let mut bootloader = self.select_bootloader()?;

        if bootloader.needs_install() {
            bootloader.install()?;
        }

        let assembled = cmdline.assemble();
        let image_mode = is_image_mode(&self.config.root);
        let root = RootCmdline::from_identity(&self.root_identity);

        let (retained, condemned, default): (Vec<&Kernel>, Vec<&Kernel>, Option<&Kernel>) = if image_mode {
            let default = kernels.iter().max_by_key(|k| k.identifier.as_ref().map(|i| i.release));
            (kernels.iter().collect(), vec![], default)
        } else {
            let running = running_kernel(&kernels);
            let groups = retain_policy(&kernels, running, &self.kernel_dir());
            let retained: Vec<&Kernel> = groups.iter().flat_map(|g| g.retained.iter().copied()).collect();
            let condemned: Vec<&Kernel> = kernels
                .iter()
                .filter(|k| running.is_some() && !retained.iter().any(|r| std::ptr::eq(*r, *k)))
                .collect();
            let default = running
                .and_then(|r| groups.iter().find(|g| g.variant == r.variant))
                .or_else(|| groups.first())
                .and_then(|g| g.tip);
            (retained, condemned, default)
        };

        if let Some(dest) = bootloader.kernel_destination() {
            if let Some(esp) = self.mounts.esp.as_ref() {
                initrds.copy_out(esp.join(dest))?;
                initrds.prune(esp.join(dest))?;
            }
        }

        for kernel in &retained {
            let entry = Entry::new(kernel);
            bootloader.install_kernel(&assembled, &entry, initrds, &root)?;
        }

        if let Some(default) = default {
            bootloader.set_default_kernel(Some(default))?;
        }

        if bootloader.needs_update() {
            bootloader.update()?;
        }

        for kernel in condemned {
            if let Err(e) = bootloader.remove_kernel(kernel) {
                log::warn!("failed to remove kernel {}: {e}", kernel.version);
            }
        }

        Ok(())
    }

    /// Remove one kernel's artefacts from the currently selected bootloader
    pub fn remove_kernel(&'a self, kernel: &Kernel) -> Result<(), Error> {
        let mut bootloader = self.select_bootloader()?;
        bootloader.remove_kernel(kernel)
    }

    /// Mount coordinator: ensure the boot mountpoint is available, mounting
    /// it from the detected device if it is not already mounted.
    pub fn mount_boot(&self) -> Result<MountState, Error> {
        let Some(target) = self.mounts.esp.clone().or_else(|| self.mounts.xbootldr.clone()) else {
            return Ok(MountState::NotApplicable);
        };

        if is_mountpoint(&target) {
            log::info!("boot dir is already mounted: {}", target.display());
            return Ok(MountState::AlreadyMounted);
        }

        let Some(device) = self.env.boot_partition() else {
            return Ok(MountState::NotApplicable);
        };

        fs::create_dir_all(&target).context(crate::IoSnafu)?;

        let fstype = if matches!(self.env.firmware(), Firmware::Uefi) { "vfat" } else { "ext4" };
        log::info!("mounting {} at {} ({fstype})", device.display(), target.display());
        nix::mount::mount(
            Some(device.as_path()),
            &target,
            Some(fstype),
            nix::mount::MsFlags::empty(),
            None::<&str>,
        )
        .context(crate::NixSnafu)?;

        Ok(MountState::Mounted)
    }

    /// Unmount the boot mountpoint, best-effort, logging on failure
    pub fn unmount_boot(&self) {
        if let Some(target) = self.mounts.esp.as_ref().or(self.mounts.xbootldr.as_ref()) {
            log::info!("attempting umount of {}", target.display());
            match nix::mount::umount(target) {
                Ok(()) => log::info!("unmounted boot directory"),
                Err(e) => log::warn!("could not unmount boot directory: {e}"),
            }
        }
    }

    fn timeout_path(&self) -> Option<PathBuf> {
        self.mounts
            .xbootldr
            .clone()
            .or_else(|| self.mounts.esp.clone())
            .map(|p| p.join("timeout"))
    }

    /// Persist the bootloader menu timeout, in seconds
    pub fn set_timeout(&self, seconds: u32) -> Result<(), Error> {
        let path = self.timeout_path().context(crate::NoEspSnafu)?;
        fs::write(path, seconds.to_string()).context(crate::IoSnafu)?;
        Ok(())
    }

    /// Read back the configured bootloader menu timeout, if set
    pub fn get_timeout(&self) -> Option<u32> {
        fs::read_to_string(self.timeout_path()?).ok()?.trim().parse().ok()
    }

    /// Mark the currently-running kernel as having booted successfully, by
    /// touching its `k_booted_<version>` marker beneath `/var/lib/kernel`.
    pub fn report_booted(&self, kernel: &Kernel) -> Result<(), Error> {
        let marker_dir = self.config.root.path().join("var").join("lib").join("kernel");
        fs::create_dir_all(&marker_dir).context(crate::IoSnafu)?;
        let marker = kernel
            .kboot_marker
            .clone()
            .unwrap_or_else(|| marker_dir.join(format!("k_booted_{}", kernel.version)));
        fs::write(&marker, b"").context(crate::IoSnafu)?;
        Ok(())
    }
}

/// Running in image mode means every mutation must be explicit; there is no
/// live firmware to consult, so the caller supplies the root directly.
pub fn is_image_mode(root: &Root) -> bool {
    matches!(root, Root::Image(_))
}

/// Per-type retention outcome: tip (newest), last-good (newest booted
/// non-tip) and the running kernel if it belongs to this type, deduplicated.
struct TypeRetention<'k> {
    variant: Option<String>,
    tip: Option<&'k Kernel>,
    retained: Vec<&'k Kernel>,
}

/// Split a raw `uname -r` string formatted as `<version>-<release>.<type>`
/// (the same layout `KernelIdentifier::format` produces, minus the
/// namespace prefix) into its `(type, version, release)` parts.
fn parse_uname_release(release: &str) -> Option<(&str, &str, u32)> {
    let (rest, ktype) = release.rsplit_once('.')?;
    let (version, release) = rest.rsplit_once('-')?;
    Some((ktype, version, release.parse().ok()?))
}

/// Match the currently running kernel (`uname -r`) against the discovered
/// set: first by a full `type + version + release` match, then falling back
/// to `type + release` alone. An unparseable or unmatched `uname -r` yields
/// `None`, in which case no garbage-collection is performed.
fn running_kernel(kernels: &[Kernel]) -> Option<&Kernel> {
    let uts = nix::sys::utsname::uname().ok()?;
    let release = uts.release().to_string_lossy().to_string();
    let (ktype, version, rel) = parse_uname_release(&release)?;

    kernels
        .iter()
        .find(|k| k.identifier.as_ref().is_some_and(|i| i.ktype == ktype && i.version == version && i.release == rel))
        .or_else(|| {
            kernels
                .iter()
                .find(|k| k.identifier.as_ref().is_some_and(|i| i.ktype == ktype && i.release == rel))
        })
}

/// Resolve the `default-<type>` symlink in the kernel source tree, if
/// present, to the vmlinuz basename it points at.
fn default_override(kernel_dir: &std::path::Path, ktype: &str) -> Option<String> {
    let target = fs::read_link(kernel_dir.join(format!("default-{ktype}"))).ok()?;
    target.file_name().map(|f| f.to_string_lossy().to_string())
}

/// Apply the running/tip/last-good retention policy, grouped by kernel
/// `variant` (type): at steady state every type keeps its running kernel (if
/// any), its tip (highest release), and its last-good (highest release,
/// booted, non-tip) kernel, duplicates collapsed.
fn retain_policy<'k>(
    kernels: &'k [Kernel],
    running: Option<&'k Kernel>,
    kernel_dir: &std::path::Path,
) -> Vec<TypeRetention<'k>> {
    use std::collections::BTreeMap;

    let mut by_type: BTreeMap<Option<String>, Vec<&Kernel>> = BTreeMap::new();
    for kernel in kernels {
        by_type.entry(kernel.variant.clone()).or_default().push(kernel);
    }

    let mut groups = vec![];
    for (variant, mut group) in by_type {
        group.sort_by_key(|k| k.identifier.as_ref().map(|i| i.release).unwrap_or_default());
        group.reverse();

        let tip = variant
            .as_deref()
            .and_then(|ktype| default_override(kernel_dir, ktype))
            .and_then(|basename| {
                group
                    .iter()
                    .find(|k| k.image.file_name().is_some_and(|f| f.to_string_lossy() == basename))
                    .copied()
            })
            .or_else(|| group.first().copied());
        let last_good = group
            .iter()
            .filter(|k| k.boots && !tip.is_some_and(|t| std::ptr::eq(*k, t)))
            .copied()
            .next();
        let group_running = running.filter(|r| group.iter().any(|k| std::ptr::eq(*k, *r)));

        let mut retained = vec![];
        for candidate in [tip, last_good, group_running].into_iter().flatten() {
            if !retained.iter().any(|r| std::ptr::eq(*r, candidate)) {
                retained.push(candidate);
            }
        }

        groups.push(TypeRetention { variant, tip, retained });
    }
    groups
}

/// A crude but root-unprivileged mountpoint test: a directory is mounted iff
/// its device id differs from its parent's.
fn is_mountpoint(path: &std::path::Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Some(parent) = path.parent() else {
        return false;
    };
    std::fs::metadata(parent).map(|p| p.dev() != meta.dev()).unwrap_or(false)
}

fn glob_dir(dir: &std::path::Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return vec![];
    };
    entries.filter_map(|e| e.ok()).map(|e| e.path()).collect()
}

#[cfg(test)]
mod tests {
    use crate::kernel::KernelIdentifier;

    use super::*;

    /// No `default-<type>` symlinks live here, so `tip` falls back to the
    /// highest-release kernel in every existing test.
    fn no_overrides() -> PathBuf {
        PathBuf::from("/nonexistent-kernel-dir")
    }

    fn kernel(variant: &str, release: u32, boots: bool) -> Kernel {
        Kernel {
            version: format!("6.{release}.0-{release}.{variant}"),
            image: PathBuf::from(format!("vmlinuz-{release}")),
            initrd: vec![],
            extras: vec![],
            variant: Some(variant.to_string()),
            identifier: Some(KernelIdentifier {
                ktype: variant.to_string(),
                version: "6.0.0".to_string(),
                release,
            }),
            cmdline: None,
            boots,
            modules_dir: None,
            headers_dir: None,
            kboot_marker: None,
        }
    }

    #[test]
    fn retains_tip_and_last_good_when_neither_is_running() {
        let kernels = vec![kernel("native", 1, true), kernel("native", 2, false), kernel("native", 3, true)];
        let groups = retain_policy(&kernels, None, &no_overrides());
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.tip.unwrap().identifier.as_ref().unwrap().release, 3);
        // last-good is the newest booted kernel excluding the tip: release 1, not 2 (doesn't boot)
        assert_eq!(group.retained.len(), 2);
        assert!(group.retained.iter().any(|k| k.identifier.as_ref().unwrap().release == 1));
        assert!(group.retained.iter().any(|k| k.identifier.as_ref().unwrap().release == 3));
    }

    #[test]
    fn running_kernel_is_always_kept_even_if_neither_tip_nor_last_good() {
        let kernels = vec![kernel("native", 1, false), kernel("native", 2, true), kernel("native", 3, true)];
        let running = &kernels[0];
        let groups = retain_policy(&kernels, Some(running), &no_overrides());
        let group = &groups[0];
        assert_eq!(group.retained.len(), 3);
    }

    #[test]
    fn duplicate_candidates_are_not_retained_twice() {
        let kernels = vec![kernel("native", 1, true)];
        let running = &kernels[0];
        let groups = retain_policy(&kernels, Some(running), &no_overrides());
        // single kernel is simultaneously tip, last-good (none, since it is the tip) and running
        assert_eq!(groups[0].retained.len(), 1);
    }

    #[test]
    fn groups_are_independent_per_variant() {
        let kernels = vec![kernel("native", 1, true), kernel("lts", 1, true)];
        let groups = retain_policy(&kernels, None, &no_overrides());
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.retained.len() == 1));
    }

    #[test]
    fn default_type_symlink_overrides_release_ordered_tip() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("vmlinuz-1", dir.path().join("default-native")).unwrap();

        let kernels = vec![kernel("native", 1, true), kernel("native", 2, true), kernel("native", 3, true)];
        let groups = retain_policy(&kernels, None, dir.path());

        assert_eq!(groups[0].tip.unwrap().identifier.as_ref().unwrap().release, 1);
    }

    #[test]
    fn missing_default_symlink_falls_back_to_highest_release() {
        let kernels = vec![kernel("native", 1, true), kernel("native", 2, true)];
        let groups = retain_policy(&kernels, None, &no_overrides());
        assert_eq!(groups[0].tip.unwrap().identifier.as_ref().unwrap().release, 2);
    }

    #[test]
    fn parses_type_version_release_from_uname() {
        assert_eq!(parse_uname_release("4.6.0-180.native"), Some(("native", "4.6.0", 180)));
        assert_eq!(parse_uname_release("unknown-uname"), None);
    }

    #[test]
    fn running_kernel_falls_back_to_type_and_release_without_version() {
        let mut k = kernel("native", 180, true);
        k.identifier.as_mut().unwrap().version = "weird-vendor-version".to_string();
        let kernels = vec![k];

        let (ktype, _version, release) = parse_uname_release("4.6.0-180.native").unwrap();
        let full_match = kernels
            .iter()
            .find(|k| k.identifier.as_ref().is_some_and(|i| i.ktype == ktype && i.version == "4.6.0" && i.release == release));
        assert!(full_match.is_none());

        let fallback = kernels
            .iter()
            .find(|k| k.identifier.as_ref().is_some_and(|i| i.ktype == ktype && i.release == release));
        assert!(fallback.is_some());
    }

    #[test]
    fn image_mode_flag_matches_root_variant() {
        assert!(is_image_mode(&Root::Image(PathBuf::from("/tmp/img"))));
        assert!(!is_image_mode(&Root::Native(PathBuf::from("/"))));
    }

    #[test]
    fn plain_subdirectory_is_not_a_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("boot");
        fs::create_dir_all(&sub).unwrap();
        assert!(!is_mountpoint(&sub));
    }
}
