// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Kernel abstraction

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{os_release::OsRelease, Error};

/// Control kernel discovery mechanism
#[derive(Debug)]
pub enum Schema {
    /// Legacy (clr-boot-manager style) schema: `<namespace>.<type>.<version>-<release>`
    Legacy {
        os_release: Box<OsRelease>,
        namespace: &'static str,
    },

    /// Native BLS directory schema, using only an os-release file
    Blsforme { os_release: Box<OsRelease> },
}

/// `boot.json` deserialise support (native BLS directory schema only)
#[derive(Deserialize)]
pub struct BootJSON<'a> {
    /// Kernel's package name
    #[serde(borrow)]
    pub name: &'a str,

    /// Kernel's version string (uname -r)
    #[serde(borrow)]
    pub version: &'a str,

    /// Kernel's variant id
    #[serde(borrow)]
    pub variant: &'a str,
}

impl<'a> TryFrom<&'a str> for BootJSON<'a> {
    type Error = serde_json::Error;

    fn try_from(value: &'a str) -> Result<Self, Self::Error> {
        serde_json::from_str::<Self>(value)
    }
}

/// A parsed `<namespace>.<type>.<version>-<release>` kernel basename.
///
/// `ktype` is bounded to 31 bytes and `version` to 15 bytes, matching the
/// original `sscanf("%31[^.].%15[^-]-%d")` grammar; `release` totally orders
/// kernels sharing the same `ktype`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelIdentifier {
    pub ktype: String,
    pub version: String,
    pub release: u32,
}

impl KernelIdentifier {
    /// Parse `<namespace>.<type>.<version>-<release>` out of a file basename
    pub fn parse(namespace: &str, basename: &str) -> Option<Self> {
        let rest = basename.strip_prefix(namespace)?.strip_prefix('.')?;
        let (ktype, rest) = rest.split_once('.')?;
        let (version, release) = rest.rsplit_once('-')?;

        if ktype.is_empty() || ktype.len() > 31 || version.is_empty() || version.len() > 15 {
            return None;
        }

        let release = release.parse::<u32>().ok()?;

        Some(Self {
            ktype: ktype.to_string(),
            version: version.to_string(),
            release,
        })
    }

    /// Render back to `<namespace>.<type>.<version>-<release>`
    pub fn format(&self, namespace: &str) -> String {
        format!("{namespace}.{}.{}-{}", self.ktype, self.version, self.release)
    }
}

/// A kernel is the primary bootable element that we care about, ie
/// the vmlinuz file. It also comes with a set of auxiliary files
/// that are required for a fully working system, but specifically
/// dependent on that kernel version.
#[derive(Debug, PartialEq, PartialOrd, Eq, Ord)]
pub struct Kernel {
    /// Matches the `uname -r` of the kernel, should be uniquely encoded by release/variant
    pub version: String,

    /// vmlinuz path
    pub image: PathBuf,

    /// All of the initrds
    pub initrd: Vec<AuxiliaryFile>,

    /// Any non-initrd, auxiliary files
    pub extras: Vec<AuxiliaryFile>,

    /// Recorded variant type
    pub variant: Option<String>,

    /// Parsed `<namespace>.<type>.<version>-<release>` identity, when known
    pub identifier: Option<KernelIdentifier>,

    /// Per-kernel cmdline fragment (contents of its `cmdline-*` sidecar)
    pub cmdline: Option<String>,

    /// True once `k_booted_<ver>-<rel>.<type>` exists for this kernel
    pub boots: bool,

    /// `/usr/lib/modules/<ver>-<rel>.<type>` (or legacy `<ver>-<rel>`), if present
    pub modules_dir: Option<PathBuf>,

    /// `/usr/src/linux-headers-<ver>-<rel>.<type>`, if present
    pub headers_dir: Option<PathBuf>,

    /// `/var/lib/kernel/k_booted_<ver>-<rel>.<type>` marker path (may not exist)
    pub kboot_marker: Option<PathBuf>,
}

/// Denotes the kind of auxiliary file
#[derive(Debug, PartialEq, PartialOrd, Eq, Ord)]
pub enum AuxiliaryKind {
    /// A cmdline snippet
    Cmdline,

    /// An initial ramdisk
    InitRd,

    /// System.map file
    SystemMap,

    /// .config file
    Config,

    /// The `boot.json` file
    BootJson,
}

/// An additional file required to be shipped with the kernel,
/// such as initrds, system maps, etc.
#[derive(Debug, PartialEq, PartialOrd, Eq, Ord)]
pub struct AuxiliaryFile {
    pub path: PathBuf,
    pub kind: AuxiliaryKind,
}

impl Kernel {
    /// Target basename under the namespaced UEFI kernel destination, e.g.
    /// `kernel-org.example.native.6.8.2-180`
    pub fn current_target_name(&self) -> Option<String> {
        self.image
            .file_name()
            .map(|f| format!("kernel-{}", f.to_string_lossy()))
    }

    /// Pre-namespace-migration target basename (the bare source basename)
    pub fn legacy_target_name(&self) -> Option<String> {
        self.image.file_name().map(|f| f.to_string_lossy().to_string())
    }
}

impl Schema {
    /// Given a set of kernel-like paths, yield all potential kernels within them
    /// This should be a set of `/usr/lib/kernel` paths. Use glob or appropriate to discover.
    pub fn discover_system_kernels(&self, paths: impl Iterator<Item = impl AsRef<Path>>) -> Result<Vec<Kernel>, Error> {
        match &self {
            Schema::Legacy { namespace, .. } => Self::legacy_kernels(namespace, paths),
            Schema::Blsforme { .. } => Self::blsforme_kernels(paths),
        }
    }

    /// Retrieve the OS name
    pub fn os_name(&self) -> String {
        match self {
            Schema::Legacy { os_release, .. } => os_release.name.clone(),
            Schema::Blsforme { os_release } => os_release.name.clone(),
        }
    }

    /// Retrieve the namespace for files on the boot partition(s)
    pub fn os_namespace(&self) -> String {
        match self {
            Schema::Legacy { namespace, .. } => namespace.to_string(),
            Schema::Blsforme { os_release } => os_release.id.clone(),
        }
    }

    /// Retrieve the OS ID (ie `serpent-os`, `aerynos`, etc)
    /// This is the `ID` field in os-release
    pub fn os_id(&self) -> String {
        match self {
            Schema::Legacy { os_release, .. } => os_release.id.clone(),
            Schema::Blsforme { os_release } => os_release.id.clone(),
        }
    }

    /// Retrieve display name for the OS
    /// This is the `PRETTY_NAME` field in os-release, used for display purposes
    pub fn os_display_name(&self) -> Option<String> {
        match self {
            Schema::Legacy { os_release, .. } => os_release.meta.pretty_name.clone(),
            Schema::Blsforme { os_release } => os_release.meta.pretty_name.clone(),
        }
    }

    /// Borrow the underlying os-release record
    pub fn os_release(&self) -> &OsRelease {
        match self {
            Schema::Legacy { os_release, .. } => os_release,
            Schema::Blsforme { os_release } => os_release,
        }
    }

    /// Discover any legacy (CBM-grammar) kernels
    fn legacy_kernels(
        namespace: &'static str,
        paths: impl Iterator<Item = impl AsRef<Path>>,
    ) -> Result<Vec<Kernel>, Error> {
        let paths = paths.collect::<Vec<_>>();
        // First up, find kernels. They start with the prefix..
        let candidates = paths
            .iter()
            .filter_map(|p| p.as_ref().file_name()?.to_str()?.starts_with(namespace).then_some(p));

        let mut kernels = BTreeMap::new();

        for cand in candidates {
            let item = cand.as_ref();
            if let Some(file_name) = item.file_name().map(|f| f.to_string_lossy().to_string()) {
                let Some(identifier) = KernelIdentifier::parse(namespace, &file_name) else {
                    continue;
                };
                let full_version = format!("{}-{}", identifier.version, identifier.release);
                log::trace!("discovered vmlinuz: {file_name}");
                kernels.insert(
                    full_version.clone(),
                    Kernel {
                        version: full_version,
                        image: item.into(),
                        initrd: vec![],
                        extras: vec![],
                        variant: Some(identifier.ktype.clone()),
                        identifier: Some(identifier),
                        cmdline: None,
                        boots: false,
                        modules_dir: None,
                        headers_dir: None,
                        kboot_marker: None,
                    },
                );
            }
        }

        // Find all the AUX files
        for (version, kernel) in kernels.iter_mut() {
            let variant_str = kernel.variant.as_ref().map(|v| format!(".{v}")).unwrap_or_default();
            let sysmap_file = format!("System.map-{version}{variant_str}");
            let cmdline_file = format!("cmdline-{version}{variant_str}");
            let config_file = format!("config-{version}{variant_str}");
            let indep_initrd = format!("initrd-{namespace}.");
            let initrd_file = format!(
                "initrd-{}{}{}",
                namespace,
                kernel.variant.as_ref().map(|v| format!(".{v}.")).unwrap_or_default(),
                version
            );

            for path in paths.iter() {
                let filename = path
                    .as_ref()
                    .file_name()
                    .ok_or(Error::InvalidFilesystem)?
                    .to_str()
                    .ok_or(Error::InvalidFilesystem)?;

                let aux = match filename {
                    x if x == sysmap_file => Some(AuxiliaryFile {
                        path: path.as_ref().into(),
                        kind: AuxiliaryKind::SystemMap,
                    }),
                    x if x == cmdline_file => Some(AuxiliaryFile {
                        path: path.as_ref().into(),
                        kind: AuxiliaryKind::Cmdline,
                    }),
                    x if x == config_file => Some(AuxiliaryFile {
                        path: path.as_ref().into(),
                        kind: AuxiliaryKind::Config,
                    }),
                    x if x == initrd_file => Some(AuxiliaryFile {
                        path: path.as_ref().into(),
                        kind: AuxiliaryKind::InitRd,
                    }),
                    x if x.starts_with(&initrd_file) => {
                        // Version dependent initrd
                        if x != initrd_file && x.split_once(&initrd_file).is_some() {
                            Some(AuxiliaryFile {
                                path: path.as_ref().into(),
                                kind: AuxiliaryKind::InitRd,
                            })
                        } else {
                            None
                        }
                    }
                    x if x.starts_with(&indep_initrd) => {
                        // Version independent initrd
                        if let Some((_, r)) = x.split_once(&indep_initrd) {
                            if !r.contains('.') {
                                Some(AuxiliaryFile {
                                    path: path.as_ref().into(),
                                    kind: AuxiliaryKind::InitRd,
                                })
                            } else {
                                None
                            }
                        } else {
                            None
                        }
                    }
                    _ => None,
                };

                if let Some(aux_file) = aux {
                    if matches!(aux_file.kind, AuxiliaryKind::InitRd) {
                        kernel.initrd.push(aux_file);
                    } else {
                        kernel.extras.push(aux_file);
                    }
                }
            }

            // A kernel only truly "exists" once both the blob and a
            // non-empty cmdline sidecar are present; absent cmdline demotes
            // it to a partial install, flagged by leaving `cmdline` unset.
            if let Some(cmdline_aux) = kernel.extras.iter().find(|e| matches!(e.kind, AuxiliaryKind::Cmdline)) {
                if let Ok(text) = std::fs::read_to_string(&cmdline_aux.path) {
                    let joined = crate::file_utils::join_cmdline_lines(&text);
                    if !joined.is_empty() {
                        kernel.cmdline = Some(joined);
                    }
                }
            }

            kernel
                .initrd
                .sort_by_key(|i| i.path.display().to_string().to_lowercase());
            kernel
                .extras
                .sort_by_key(|e| e.path.display().to_string().to_lowercase());
        }

        // Drop kernels without a usable (non-empty) cmdline sidecar; absent
        // modules are left as a later warning, not a reason to drop here.
        kernels.retain(|_, k| k.cmdline.is_some());

        Ok(kernels.into_values().collect::<Vec<_>>())
    }

    // Handle newstyle discovery
    fn blsforme_kernels(paths: impl Iterator<Item = impl AsRef<Path>>) -> Result<Vec<Kernel>, Error> {
        let all_paths = paths.map(|m| m.as_ref().to_path_buf()).collect::<BTreeSet<_>>();

        // all `vmlinuz` files within the set
        let mut kernel_images = all_paths
            .iter()
            .filter(|p| p.ends_with("vmlinuz"))
            .filter_map(|m| {
                let version = m.parent()?.file_name()?.to_str()?.to_string();
                Some((
                    version.clone(),
                    Kernel {
                        version,
                        image: PathBuf::from(m),
                        initrd: vec![],
                        extras: vec![],
                        variant: None,
                        identifier: None,
                        cmdline: None,
                        boots: false,
                        modules_dir: None,
                        headers_dir: None,
                        kboot_marker: None,
                    },
                ))
            })
            .collect::<HashMap<_, _>>();

        // Walk kernels, find matching assets
        for (version, kernel) in kernel_images.iter_mut() {
            let lepath = kernel
                .image
                .parent()
                .ok_or(Error::InvalidFilesystem)?
                .to_str()
                .ok_or(Error::InvalidFilesystem)?;
            let versioned_assets = all_paths
                .iter()
                .filter(|p| !p.ends_with("vmlinuz") && p.starts_with(lepath) && !p.ends_with(version));
            for asset in versioned_assets {
                let filename = asset
                    .file_name()
                    .ok_or(Error::InvalidFilesystem)?
                    .to_str()
                    .ok_or(Error::InvalidFilesystem)?;
                let aux = match filename {
                    "System.map" => Some(AuxiliaryFile {
                        path: asset.clone(),
                        kind: AuxiliaryKind::SystemMap,
                    }),
                    "boot.json" => Some(AuxiliaryFile {
                        path: asset.clone(),
                        kind: AuxiliaryKind::BootJson,
                    }),
                    "config" => Some(AuxiliaryFile {
                        path: asset.clone(),
                        kind: AuxiliaryKind::Config,
                    }),
                    _ if filename.ends_with(".initrd") => Some(AuxiliaryFile {
                        path: asset.clone(),
                        kind: AuxiliaryKind::InitRd,
                    }),
                    _ if filename.ends_with(".cmdline") => Some(AuxiliaryFile {
                        path: asset.clone(),
                        kind: AuxiliaryKind::Cmdline,
                    }),
                    _ => None,
                };

                if let Some(aux_file) = aux {
                    if matches!(aux_file.kind, AuxiliaryKind::InitRd) {
                        kernel.initrd.push(aux_file);
                    } else {
                        kernel.extras.push(aux_file);
                    }
                }

                kernel
                    .initrd
                    .sort_by_key(|i| i.path.display().to_string().to_lowercase());
                kernel
                    .extras
                    .sort_by_key(|e| e.path.display().to_string().to_lowercase());
            }
        }

        Ok(kernel_images.into_values().collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod tests {
    use fs_err as fs;

    use super::{BootJSON, KernelIdentifier};

    #[test]
    fn test_boot_json() {
        let text = fs::read_to_string("boot.json").expect("Failed to read json file");
        let boot = BootJSON::try_from(text.as_str()).expect("Failed to decode JSON");
        assert_eq!(boot.name, "linux-desktop");
        assert_eq!(boot.variant, "desktop");
        assert_eq!(boot.version, "6.8.2-25.desktop");
    }

    #[test]
    fn parses_cbm_identifier() {
        let id = KernelIdentifier::parse("org.clearlinux", "org.clearlinux.native.4.6.0-180").unwrap();
        assert_eq!(id.ktype, "native");
        assert_eq!(id.version, "4.6.0");
        assert_eq!(id.release, 180);
        assert_eq!(id.format("org.clearlinux"), "org.clearlinux.native.4.6.0-180");
    }

    #[test]
    fn rejects_oversized_components() {
        let long_type = "x".repeat(32);
        let basename = format!("ns.{long_type}.1.0-1");
        assert!(KernelIdentifier::parse("ns", &basename).is_none());
    }

    #[test]
    fn rejects_non_numeric_release() {
        assert!(KernelIdentifier::parse("ns", "ns.native.1.0-abc").is_none());
    }

    #[test]
    fn same_type_orders_by_release() {
        let a = KernelIdentifier::parse("ns", "ns.native.1.0-140").unwrap();
        let b = KernelIdentifier::parse("ns", "ns.native.1.0-180").unwrap();
        assert!(a.release < b.release);
    }
}
