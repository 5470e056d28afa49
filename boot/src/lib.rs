//! bootsync — Kernel + Boot Entry Lifecycle for the EFI System Partition
//!
//! Keeps the kernels in an ESP vendor directory in step with a staging
//! directory written by the package manager, and keeps the shim fallback
//! configuration and the firmware boot variables pointing at them.
//!
//! # Layout
//! - [`version`] — Debian package-version ordering for kernel ABIs
//! - [`fs`] — filesystem seam (real + in-memory) and the idempotent copy primitive
//! - [`efi`] — GUIDs, device paths, load options and the variable stores
//! - [`kernel`] — the kernel manager: enumerate, install, retire, commit
//! - [`shim`] — `BOOT<ARCH>.CSV` writer for shim's fallback loader
//! - [`bootmgr`] — `Boot####` / `BootOrder` management
//! - [`config`] — TOML configuration with host defaults
//!
//! # Run sequence
//! A caller builds a [`kernel::KernelManager`], then runs
//! `install_kernels`, `commit_to_boot_loader`, `remove_obsolete_kernels`,
//! `commit_to_boot_loader`. Only construction and firmware commits return
//! hard errors; per-kernel failures come back in the reports.

pub mod bootmgr;
pub mod config;
pub mod efi;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod shim;
pub mod version;

pub use error::{Error, Result};

/// EFI architecture tag for the build target, as used in loader names
/// (`shimx64.efi`) and fallback configs (`BOOTX64.CSV`).
pub fn efi_architecture() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "x64"
    } else if cfg!(target_arch = "x86") {
        "ia32"
    } else if cfg!(target_arch = "aarch64") {
        "aa64"
    } else if cfg!(target_arch = "arm") {
        "arm"
    } else if cfg!(target_arch = "riscv64") {
        "riscv64"
    } else {
        "unknown"
    }
}
