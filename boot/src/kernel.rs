//! kernel.rs — Kernel images between the staging directory and the ESP
//!
//! The package manager drops `kernel.efi-<ABI>` images into a staging
//! directory. [`KernelManager`] mirrors them into the vendor directory on the
//! ESP, derives one boot entry per staged kernel (newest first), retires
//! kernels that are no longer staged and commits the entry list to shim's
//! fallback config and, when attached, the firmware boot manager.
//!
//! Hard errors only happen while constructing the manager or talking to
//! firmware. Failing to copy or remove one kernel, or to write the fallback
//! config, is logged and reported; the run carries on.

use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{info, warn};
use serde::Serialize;

use crate::bootmgr::{BootCommit, BootManager};
use crate::error::{Error, Result};
use crate::fs::{maybe_update_file, Filesystem};
use crate::shim;
use crate::version::Version;

pub const KERNEL_PREFIX: &str = "kernel.efi-";

/// One entry for shim's fallback config and the firmware boot menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootEntry {
    /// Loader binary in the vendor directory, `shim<arch>.efi`.
    pub filename: String,
    pub label: String,
    /// `\<kernel file> <kernel options>`; the leading `\` means "next to the loader".
    pub options: String,
    pub description: String,
}

/// A `kernel.efi-<ABI>` file with its parsed ABI.
#[derive(Debug, Clone, Serialize)]
pub struct KernelImage {
    file_name: String,
    version: Version,
}

impl KernelImage {
    /// `None` unless `file_name` carries the kernel prefix.
    pub fn parse(file_name: &str) -> Option<Result<Self>> {
        let abi = file_name.strip_prefix(KERNEL_PREFIX)?;
        Some(
            Version::parse(abi)
                .map(|version| Self { file_name: file_name.to_string(), version })
                .map_err(|source| Error::InvalidKernelVersion {
                    file: file_name.to_string(),
                    source,
                }),
        )
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// The ABI as written in the file name.
    pub fn abi(&self) -> &str {
        &self.file_name[KERNEL_PREFIX.len()..]
    }
}

/// A per-asset soft failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetFailure {
    pub file: String,
    pub error: String,
}

impl AssetFailure {
    fn new(file: impl Into<String>, error: impl fmt::Display) -> Self {
        Self { file: file.into(), error: error.to_string() }
    }
}

impl fmt::Display for AssetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.file, self.error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub unchanged: Vec<String>,
    pub failures: Vec<AssetFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub removed: Vec<String>,
    pub failures: Vec<AssetFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub fallback: PathBuf,
    pub fallback_failure: Option<AssetFailure>,
    /// `None` when no firmware boot manager is attached.
    pub firmware: Option<BootCommit>,
}

/// Where kernels come from and go to, and how their entries read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub source_dir: PathBuf,
    /// `<esp>/EFI/<vendor>`.
    pub target_dir: PathBuf,
    /// Distribution name shown in entry labels, e.g. `Ubuntu`.
    pub vendor_label: String,
    pub kernel_options: String,
    /// EFI architecture tag, e.g. `x64`.
    pub architecture: String,
}

pub struct KernelManager {
    fs: Rc<dyn Filesystem>,
    settings: Settings,
    source_kernels: Vec<KernelImage>,
    target_kernels: Vec<KernelImage>,
    boot_entries: Vec<BootEntry>,
    boot_manager: Option<BootManager>,
}

/// Kernels in `dir`, newest first. Every name is parsed before anything is
/// ordered; equal versions fall back to the file name.
fn read_kernels(fs: &dyn Filesystem, dir: &Path) -> Result<Vec<KernelImage>> {
    if !fs.exists(dir) {
        return Err(Error::MissingDirectory(dir.to_path_buf()));
    }
    let names = fs.read_dir(dir).map_err(|source| Error::ListDirectory {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut kernels = names
        .iter()
        .filter_map(|name| KernelImage::parse(name))
        .collect::<Result<Vec<_>>>()?;
    kernels.sort_by(|a, b| {
        b.version
            .cmp(&a.version)
            .then_with(|| b.file_name.cmp(&a.file_name))
    });
    Ok(kernels)
}

impl KernelManager {
    pub fn new(
        fs: Rc<dyn Filesystem>,
        settings: Settings,
        boot_manager: Option<BootManager>,
    ) -> Result<Self> {
        let source_kernels = read_kernels(fs.as_ref(), &settings.source_dir)?;
        let target_kernels = read_kernels(fs.as_ref(), &settings.target_dir)?;
        Ok(Self {
            fs,
            settings,
            source_kernels,
            target_kernels,
            boot_entries: Vec::new(),
            boot_manager,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn source_kernels(&self) -> &[KernelImage] {
        &self.source_kernels
    }

    pub fn target_kernels(&self) -> &[KernelImage] {
        &self.target_kernels
    }

    /// Entries built by the last [`install_kernels`](Self::install_kernels).
    pub fn boot_entries(&self) -> &[BootEntry] {
        &self.boot_entries
    }

    pub fn boot_manager(&self) -> Option<&BootManager> {
        self.boot_manager.as_ref()
    }

    pub fn is_obsolete(&self, kernel: &KernelImage) -> bool {
        !self
            .source_kernels
            .iter()
            .any(|k| k.file_name == kernel.file_name)
    }

    /// Tracked target kernels that are not staged any more.
    pub fn obsolete_kernels(&self) -> impl Iterator<Item = &KernelImage> {
        self.target_kernels.iter().filter(|k| self.is_obsolete(k))
    }

    /// Path of shim's fallback config for this vendor directory.
    pub fn fallback_path(&self) -> PathBuf {
        self.settings
            .target_dir
            .join(shim::fallback_file_name(&self.settings.architecture))
    }

    fn boot_entry(&self, kernel: &KernelImage) -> BootEntry {
        let s = &self.settings;
        let abi = kernel.abi();
        BootEntry {
            filename: format!("shim{}.efi", s.architecture),
            label: format!("{} with kernel {}", s.vendor_label, abi),
            options: format!("\\{} {}", kernel.file_name, s.kernel_options),
            description: format!("{} entry for kernel {}", s.vendor_label, abi),
        }
    }

    /// Copy every staged kernel into the vendor directory and rebuild the
    /// boot entry list, newest first.
    pub fn install_kernels(&mut self) -> InstallReport {
        let mut report = InstallReport::default();
        let mut entries = Vec::with_capacity(self.source_kernels.len());

        for kernel in &self.source_kernels {
            let name = kernel.file_name();
            let target = self.settings.target_dir.join(name);
            let source = self.settings.source_dir.join(name);
            match maybe_update_file(self.fs.as_ref(), &target, &source) {
                Ok(true) => {
                    info!("installed or updated kernel {}", name);
                    report.installed.push(name.to_string());
                }
                Ok(false) => report.unchanged.push(name.to_string()),
                Err(e) => {
                    warn!("could not install kernel {}: {}", name, e);
                    report.failures.push(AssetFailure::new(name, e));
                }
            }
            // the entry is wanted even if this copy failed; an older copy may be in place
            entries.push(self.boot_entry(kernel));
        }

        self.boot_entries = entries;
        report
    }

    /// Delete target kernels that are no longer staged. A kernel that
    /// cannot be deleted stays tracked.
    pub fn remove_obsolete_kernels(&mut self) -> RemovalReport {
        let mut report = RemovalReport::default();
        let mut remaining = Vec::with_capacity(self.target_kernels.len());

        for kernel in std::mem::take(&mut self.target_kernels) {
            if !self.is_obsolete(&kernel) {
                remaining.push(kernel);
                continue;
            }
            let name = kernel.file_name();
            match self.fs.remove_file(&self.settings.target_dir.join(name)) {
                Ok(()) => {
                    info!("removed kernel {}", name);
                    report.removed.push(name.to_string());
                }
                Err(e) => {
                    warn!("could not remove kernel {}: {}", name, e);
                    report.failures.push(AssetFailure::new(name, e));
                    remaining.push(kernel);
                }
            }
        }

        self.target_kernels = remaining;
        report
    }

    /// Write the fallback config and, with a boot manager attached, the
    /// firmware boot entries and order.
    pub fn commit_to_boot_loader(&mut self) -> Result<CommitReport> {
        info!("configuring shim fallback loader");
        let fallback = self.fallback_path();
        let fallback_failure =
            match shim::write_fallback(self.fs.as_ref(), &fallback, &self.boot_entries) {
                Ok(()) => None,
                Err(e) => {
                    warn!("failed to configure shim fallback loader: {}", e);
                    let name = fallback
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    Some(AssetFailure::new(name, e))
                }
            };

        let firmware = match self.boot_manager.as_mut() {
            Some(bm) => {
                info!("configuring UEFI boot device selection");
                Some(bm.commit(&self.settings.target_dir, &self.boot_entries)?)
            }
            None => None,
        };

        Ok(CommitReport { fallback, fallback_failure, firmware })
    }
}
