// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Provides a CLI compatible with `clr-boot-manager` to be used as a drop-in
//! replacement for Solus.

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use blsforme::{cmdline::Assembler, initrd::Registry, os_release::OsRelease, Configuration, Manager, Root, Schema};
use clap::{Parser, Subcommand};
use color_eyre::{
    eyre::{eyre, Context, Ok},
    Section,
};

use pretty_env_logger::formatted_builder;

/// Boot Loader Specification compatible kernel/initrd/cmdline management
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Override base path for all boot management operations
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Force running in image mode (scripting integration)
    #[arg(short, long, global = true)]
    image: bool,

    /// Do not allow updating EFI vars
    #[arg(short, long, global = true)]
    no_efi_update: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print version and exit
    Version,

    /// Report currently running kernel as successfully booting
    ReportBooted,

    /// Remove specified kernel from the system
    RemoveKernel { version: String },

    /// Mount the `$BOOT` directories
    MountBoot,

    /// Configure the `$BOOT` directories for next boot
    Update,

    /// Set the bootloader timeout value
    SetTimeout { timeout: u32 },

    /// Retrieve the bootloader timeout value
    GetTimeout,

    /// Set the kernel that will be used at next boot
    SetKernel { kernel: String },

    /// List kernels on `$BOOT`
    ListKernels,

    /// Status information (debugging)
    Status,
}

fn scan_os_release(root: impl AsRef<Path>) -> color_eyre::Result<OsRelease> {
    let root = root.as_ref();
    let query_paths = vec![
        root.join("run").join("os-release"),
        root.join("etc").join("os-release"),
        root.join("usr").join("lib").join("os-release"),
    ];

    for p in query_paths {
        if p.exists() {
            log::trace!("Reading os-release from: {}", p.display());
            let text = fs::read_to_string(p)?;
            let os_rel = OsRelease::from_str(&text)?;
            return Ok(os_rel);
        }
    }
    Err(eyre!(
        "Failed to determine the Linux distribution by scanning os-release"
    ))
}

/// Determine the kernel discovery schema to use, based on the detected distro
fn query_schema(config: &Configuration) -> color_eyre::Result<Schema> {
    let os_rel = scan_os_release(config.root.path())?;

    match os_rel.id.as_str() {
        "solus" if os_rel.version.name.as_deref().is_some_and(|v| v.starts_with('4')) => {
            log::trace!("Legacy schema due to Solus 4 installation");
            Ok(Schema::Legacy {
                os_release: Box::new(os_rel),
                namespace: "com.solus-project",
            })
        }
        "clear-linux-os" => {
            log::trace!("Legacy schema due to Clear Linux OS installation");
            Ok(Schema::Legacy {
                os_release: Box::new(os_rel),
                namespace: "org.clearlinux",
            })
        }
        _ => Ok(Schema::Blsforme {
            os_release: Box::new(os_rel),
        }),
    }
}

/// Bail-out permission check for execution
fn check_permissions() -> color_eyre::Result<()> {
    if nix::unistd::Uid::effective().is_root() {
        Ok(())
    } else {
        Err(eyre!("blsctl must be run with root privileges to work correctly"))
            .note("This tool must be able to mount partitions and scan partition tables to operate effectively")
    }
}

/// The `uname -r` of the currently running kernel
fn running_kernel_version() -> color_eyre::Result<String> {
    let uts = nix::sys::utsname::uname()?;
    Ok(uts.release().to_string_lossy().to_string())
}

/// Bootloader assets vendored onto the source tree, used for installation
fn vendor_assets(config: &Configuration) -> Vec<PathBuf> {
    let candidates = [
        "usr/lib/systemd/boot/efi/systemd-bootx64.efi",
        "usr/lib/shim/shimx64.efi",
        "usr/lib/shim/mmx64.efi",
        "usr/lib/shim/fbx64.efi",
        "usr/lib/syslinux/gptmbr.bin",
    ];
    candidates
        .iter()
        .map(|c| config.root.path().join(c))
        .filter(|p| p.exists())
        .collect()
}

fn default_cmdline_assembler(config: &Configuration) -> Assembler {
    let root = config.root.path();
    Assembler::new()
        .with_vendor_dir(root.join("usr").join("share").join("kernel").join("cmdline.d"))
        .with_admin_global(root.join("etc").join("kernel").join("cmdline"))
        .with_admin_dir(root.join("etc").join("kernel").join("cmdline.d"))
        .with_removal_dir(root.join("etc").join("kernel").join("cmdline-removal.d"))
}

fn default_initrd_registry(config: &Configuration) -> Registry {
    let root = config.root.path();
    let mut registry = Registry::new();
    let _ = registry.scan(
        root.join("etc").join("kernel").join("initrd.d"),
        root.join("usr").join("lib").join("kernel").join("initrd.d"),
    );
    registry
}

fn main() -> color_eyre::Result<()> {
    let host_os = scan_os_release("/").unwrap_or_default();
    color_eyre::config::HookBuilder::default()
        .issue_url("https://github.com/serpent-os/blsforme/issues/new")
        .add_issue_metadata("tool-context", "standalone (blsctl)")
        .add_issue_metadata("version", env!("CARGO_PKG_VERSION"))
        .add_issue_metadata("os-release-name", host_os.name)
        .add_issue_metadata(
            "os-release-version",
            host_os.version.name.unwrap_or("n/a".into()),
        )
        .issue_filter(|_| true)
        .install()?;

    formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let res = Cli::parse();
    let root = if res.image {
        // forced image mode
        Root::Image(res.path.unwrap_or("/".into()))
    } else if let Some(path) = res.path {
        // Path provided, native only if it is `/`
        if path.as_path() == Path::new("/") {
            Root::Native(path)
        } else {
            Root::Image(path)
        }
    } else {
        // Native operation
        Root::Native("/".into())
    };

    let config = Configuration {
        root,
        vfs: "/".into(),
    };

    log::trace!("Using configuration: {config:?}");
    log::info!("Inspecting root device: {}", config.root.path().display());

    if !matches!(res.command, Commands::Version) {
        check_permissions()?;
    }

    match res.command {
        Commands::Version => {
            println!("blsctl {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::ReportBooted => {
            let schema = query_schema(&config)?;
            let manager = Manager::new(&config, schema).wrap_err("failed to probe boot environment")?;
            let running = running_kernel_version()?;
            let kernel = manager
                .discover_kernels()?
                .into_iter()
                .find(|k| k.version == running)
                .ok_or_else(|| eyre!("no installed kernel matches the running release {running}"))?;
            manager.report_booted(&kernel)?;
            log::info!("Reported kernel {running} as successfully booted");
        }
        Commands::RemoveKernel { version } => {
            let schema = query_schema(&config)?;
            let manager = Manager::new(&config, schema)
                .wrap_err("failed to probe boot environment")?
                .with_assets(vendor_assets(&config));
            let kernel = manager
                .discover_kernels()?
                .into_iter()
                .find(|k| k.version == version)
                .ok_or_else(|| eyre!("no installed kernel matches version {version}"))?;
            manager.remove_kernel(&kernel)?;
            log::info!("Removed kernel {version}");
        }
        Commands::MountBoot => {
            let schema = query_schema(&config)?;
            let manager = Manager::new(&config, schema).wrap_err("failed to probe boot environment")?;
            let state = manager.mount_boot()?;
            log::info!("Boot mount state: {state:?}");
        }
        Commands::Update => {
            let schema = query_schema(&config)?;
            let manager = Manager::new(&config, schema)
                .wrap_err("failed to probe boot environment")?
                .with_assets(vendor_assets(&config));
            let cmdline = default_cmdline_assembler(&config);
            let initrds = default_initrd_registry(&config);

            let mount_state = manager.mount_boot()?;
            let result = manager.update(&cmdline, &initrds);
            if matches!(mount_state, blsforme::MountState::Mounted) {
                manager.unmount_boot();
            }
            result?;
            log::info!("Boot configuration updated");
        }
        Commands::SetTimeout { timeout } => {
            let schema = query_schema(&config)?;
            let manager = Manager::new(&config, schema).wrap_err("failed to probe boot environment")?;
            manager.set_timeout(timeout)?;
            log::info!("Bootloader timeout set to {timeout}s");
        }
        Commands::GetTimeout => {
            let schema = query_schema(&config)?;
            let manager = Manager::new(&config, schema).wrap_err("failed to probe boot environment")?;
            match manager.get_timeout() {
                Some(t) => println!("{t}"),
                None => println!("unset"),
            }
        }
        Commands::SetKernel { kernel } => {
            let schema = query_schema(&config)?;
            let manager = Manager::new(&config, schema)
                .wrap_err("failed to probe boot environment")?
                .with_assets(vendor_assets(&config));
            let found = manager
                .discover_kernels()?
                .into_iter()
                .find(|k| k.version == kernel)
                .ok_or_else(|| eyre!("no installed kernel matches version {kernel}"))?;
            let mut bootloader = manager.select_bootloader()?;
            bootloader.set_default_kernel(Some(&found))?;
            log::info!("Default kernel set to {kernel}");
        }
        Commands::ListKernels => {
            let schema = query_schema(&config)?;
            let manager = Manager::new(&config, schema).wrap_err("failed to probe boot environment")?;
            for kernel in manager.discover_kernels()? {
                println!("{} ({})", kernel.version, kernel.variant.as_deref().unwrap_or("unknown"));
            }
        }
        Commands::Status => {
            let schema = query_schema(&config)?;
            let manager = Manager::new(&config, schema).wrap_err("failed to probe boot environment")?;
            log::info!("Environment: {:?}", manager.environment());
            log::info!("Kernels: {:?}", manager.discover_kernels()?);
        }
    }

    Ok(())
}
