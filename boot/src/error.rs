//! error.rs — Hard failures of a bootsync run
//!
//! Anything in here aborts the run. Per-kernel copy/remove failures and
//! fallback config write failures are not errors at this level; they are
//! reported through [`crate::kernel::AssetFailure`] and logged.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::efi::{UefiError, VarError};
use crate::version::VersionError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kernel directory {} does not exist", .0.display())]
    MissingDirectory(PathBuf),

    #[error("could not determine kernels in {}: {source}", path.display())]
    ListDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse kernel version of {file}: {source}")]
    InvalidKernelVersion {
        file: String,
        #[source]
        source: VersionError,
    },

    #[error("efi variables: {0}")]
    Variables(#[from] VarError),

    #[error("no free Boot#### variable number")]
    NoFreeBootEntry,

    #[error("malformed uefi data: {0}")]
    Uefi(#[from] UefiError),

    #[error("invalid configuration {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}
