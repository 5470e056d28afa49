//! config.rs — `/etc/bootsync/config.toml`
//!
//! Every key is optional; a missing file is the same as an empty one.
//!
//! ```toml
//! esp = "/boot/efi"
//! kernel_source_dir = "/usr/lib/linux/efi"
//! vendor = "ubuntu"
//! vendor_label = "Ubuntu"
//! kernel_options = "root=/dev/sda2 ro quiet"
//! architecture = "x64"
//! efivars = true
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kernel::Settings;

pub const CONFIG_PATH: &str = "/etc/bootsync/config.toml";
const ETC_KERNEL_CMDLINE: &str = "/etc/kernel/cmdline";
const PROC_CMDLINE: &str = "/proc/cmdline";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Mount point of the EFI System Partition.
    pub esp: PathBuf,
    /// Where the package manager stages `kernel.efi-*` images.
    pub kernel_source_dir: PathBuf,
    /// Vendor directory name under `<esp>/EFI`.
    pub vendor: String,
    /// Shown in entry labels; defaults to the capitalized vendor.
    pub vendor_label: Option<String>,
    /// Defaults to `/etc/kernel/cmdline`, then the running kernel's command line.
    pub kernel_options: Option<String>,
    pub architecture: String,
    /// Maintain firmware `Boot####` variables as well as the fallback config.
    pub efivars: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            esp: PathBuf::from("/boot/efi"),
            kernel_source_dir: PathBuf::from("/usr/lib/linux/efi"),
            vendor: "ubuntu".into(),
            vendor_label: None,
            kernel_options: None,
            architecture: crate::efi_architecture().into(),
            efivars: true,
        }
    }
}

impl Config {
    /// Read `path`; a file that does not exist yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&text).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `<esp>/EFI/<vendor>`.
    pub fn target_dir(&self) -> PathBuf {
        self.esp.join("EFI").join(&self.vendor)
    }

    pub fn vendor_label(&self) -> String {
        match &self.vendor_label {
            Some(label) => label.clone(),
            None => capitalize(&self.vendor),
        }
    }

    /// Kernel manager settings, resolving kernel options from the host if
    /// the file does not set them.
    pub fn settings(&self) -> Result<Settings> {
        let kernel_options = match &self.kernel_options {
            Some(options) => options.clone(),
            None => host_kernel_options(Path::new(ETC_KERNEL_CMDLINE), Path::new(PROC_CMDLINE))?,
        };
        Ok(Settings {
            source_dir: self.kernel_source_dir.clone(),
            target_dir: self.target_dir(),
            vendor_label: self.vendor_label(),
            kernel_options,
            architecture: self.architecture.clone(),
        })
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// `etc_cmdline` verbatim if present, else `proc_cmdline` without the
/// boot loader's `BOOT_IMAGE=` and `initrd=` arguments.
pub fn host_kernel_options(etc_cmdline: &Path, proc_cmdline: &Path) -> io::Result<String> {
    if let Some(s) = read_optional(etc_cmdline)? {
        return Ok(s.split_whitespace().collect::<Vec<_>>().join(" "));
    }
    match read_optional(proc_cmdline)? {
        Some(s) => Ok(s
            .split_whitespace()
            .filter(|arg| !arg.starts_with("BOOT_IMAGE=") && !arg.starts_with("initrd="))
            .collect::<Vec<_>>()
            .join(" ")),
        None => {
            warn!("no kernel command line found, booting without options");
            Ok(String::new())
        }
    }
}
