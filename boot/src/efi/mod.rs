//! efi — UEFI value types and firmware variable access
//!
//! The binary structures here ([`DevicePath`], [`LoadOption`]) are plain
//! values with explicit little-endian encodings. Variable access goes
//! through the [`EfiVariables`] capability; which implementation a run gets
//! is the caller's decision:
//! - [`NoEfiVariables`] — firmware variables disabled or not a UEFI boot
//! - [`MockEfiVariables`] — in-memory store for tests
//! - [`EfivarfsVariables`] — Linux efivarfs

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use bitflags::bitflags;
use thiserror::Error;
use uuid::Uuid;

pub mod device_path;
#[cfg(target_os = "linux")]
pub mod efivarfs;
pub mod load_option;
pub mod vars;

pub use device_path::{DevicePath, DevicePathNode, MbrType, SignatureType};
#[cfg(target_os = "linux")]
pub use efivarfs::EfivarfsVariables;
pub use load_option::{LoadOption, LoadOptionAttributes};
pub use vars::{MockEfiVariables, NoEfiVariables};

/// 8be4df61-93ca-11d2-aa0d-00e098032b8c, owner of `Boot####`, `BootOrder`, ...
pub const GLOBAL_VARIABLE: Guid = Guid(Uuid::from_u128(0x8be4df61_93ca_11d2_aa0d_00e098032b8c));

/// An EFI GUID.
///
/// On the wire the first three fields are little-endian (the "mixed-endian"
/// EFI layout); `Display` is the usual lowercase hyphenated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid(pub Uuid);

impl Guid {
    pub const fn from_u128(v: u128) -> Self {
        Guid(Uuid::from_u128(v))
    }

    pub fn from_efi_bytes(b: [u8; 16]) -> Self {
        Guid(Uuid::from_bytes_le(b))
    }

    pub fn to_efi_bytes(&self) -> [u8; 16] {
        self.0.to_bytes_le()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Guid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Guid)
    }
}

/// Identifies one firmware variable. Two variables may share a name under
/// different GUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableDescriptor {
    pub name: String,
    pub guid: Guid,
}

impl VariableDescriptor {
    pub fn new(name: impl Into<String>, guid: Guid) -> Self {
        Self { name: name.into(), guid }
    }

    /// A variable under [`GLOBAL_VARIABLE`].
    pub fn global(name: impl Into<String>) -> Self {
        Self::new(name, GLOBAL_VARIABLE)
    }
}

impl fmt::Display for VariableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.guid)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VariableAttributes: u32 {
        const NON_VOLATILE = 0x0000_0001;
        const BOOTSERVICE_ACCESS = 0x0000_0002;
        const RUNTIME_ACCESS = 0x0000_0004;
        const HARDWARE_ERROR_RECORD = 0x0000_0008;
        const AUTHENTICATED_WRITE_ACCESS = 0x0000_0010;
        const TIME_BASED_AUTHENTICATED_WRITE_ACCESS = 0x0000_0020;
        const APPEND_WRITE = 0x0000_0040;
    }
}

impl VariableAttributes {
    /// NV | BS | RT, what boot manager variables are written with.
    pub const BOOT_DEFAULT: Self = Self::from_bits_retain(
        Self::NON_VOLATILE.bits() | Self::BOOTSERVICE_ACCESS.bits() | Self::RUNTIME_ACCESS.bits(),
    );
}

/// How much of the hardware route `new_file_device_path` spells out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDevicePathMode {
    /// Full path from the root bridge.
    Full,
    /// Partition node + file node; firmware searches disks for the partition.
    ShortFormHardDrive,
    /// File node only.
    ShortFormFile,
}

#[derive(Debug, Error)]
pub enum VarError {
    #[error("efi variables are unavailable")]
    Unavailable,
    #[error("efi variable does not exist")]
    NotExist,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Malformed or unencodable UEFI binary data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UefiError {
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("device path node length {0} is invalid")]
    InvalidNodeLength(u16),
    #[error("device path is not terminated")]
    MissingEnd,
    #[error("{0} is not valid UTF-16")]
    InvalidUtf16(&'static str),
    #[error("{0} does not fit its 16-bit length field")]
    TooLong(&'static str),
    #[error("unexpected data after {0}")]
    TrailingData(&'static str),
    #[error("{0} cannot be encoded unambiguously")]
    Unencodable(&'static str),
}

/// Capability surface over a firmware variable namespace.
pub trait EfiVariables {
    fn list_variables(&self) -> Result<Vec<VariableDescriptor>, VarError>;

    fn get_variable(
        &self,
        desc: &VariableDescriptor,
    ) -> Result<(Vec<u8>, VariableAttributes), VarError>;

    /// Writes `data`; an empty `data` deletes the variable.
    fn set_variable(
        &mut self,
        desc: &VariableDescriptor,
        data: &[u8],
        attrs: VariableAttributes,
    ) -> Result<(), VarError>;

    /// Device path for a file that must exist and be openable right now.
    fn new_file_device_path(
        &self,
        path: &Path,
        mode: FileDevicePathMode,
    ) -> Result<DevicePath, VarError>;
}

impl<T: EfiVariables + ?Sized> EfiVariables for Box<T> {
    fn list_variables(&self) -> Result<Vec<VariableDescriptor>, VarError> {
        (**self).list_variables()
    }

    fn get_variable(
        &self,
        desc: &VariableDescriptor,
    ) -> Result<(Vec<u8>, VariableAttributes), VarError> {
        (**self).get_variable(desc)
    }

    fn set_variable(
        &mut self,
        desc: &VariableDescriptor,
        data: &[u8],
        attrs: VariableAttributes,
    ) -> Result<(), VarError> {
        (**self).set_variable(desc, data, attrs)
    }

    fn new_file_device_path(
        &self,
        path: &Path,
        mode: FileDevicePathMode,
    ) -> Result<DevicePath, VarError> {
        (**self).new_file_device_path(path, mode)
    }
}

/// UTF-16LE bytes of `s`, without terminator.
pub fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Decode UTF-16LE `bytes` (even length, no terminator expected).
pub(crate) fn decode_utf16le(bytes: &[u8], what: &'static str) -> Result<String, UefiError> {
    if bytes.len() % 2 != 0 {
        return Err(UefiError::Truncated(what));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| UefiError::InvalidUtf16(what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn global_guid_wire_layout() {
        assert_eq!(GLOBAL_VARIABLE.to_string(), "8be4df61-93ca-11d2-aa0d-00e098032b8c");
        assert_eq!(
            GLOBAL_VARIABLE.to_efi_bytes(),
            [
                0x61, 0xdf, 0xe4, 0x8b, 0xca, 0x93, 0xd2, 0x11, 0xaa, 0x0d, 0x00, 0xe0, 0x98,
                0x03, 0x2b, 0x8c
            ]
        );
        assert_eq!(Guid::from_efi_bytes(GLOBAL_VARIABLE.to_efi_bytes()), GLOBAL_VARIABLE);
    }

    #[test]
    fn descriptor_identity_is_name_and_guid() {
        let other = Guid::from_u128(0x605dab50_e046_4300_abb6_3dd810dd8b23);
        assert_ne!(VariableDescriptor::global("Boot0000"), VariableDescriptor::new("Boot0000", other));
        assert_eq!(
            VariableDescriptor::global("BootOrder").to_string(),
            "BootOrder-8be4df61-93ca-11d2-aa0d-00e098032b8c"
        );
    }

    #[test]
    fn utf16_helpers() {
        let bytes = encode_utf16le("\\kernel");
        assert_eq!(&bytes[..4], &[b'\\', 0, b'k', 0]);
        assert_eq!(decode_utf16le(&bytes, "x").unwrap(), "\\kernel");
        assert_eq!(decode_utf16le(&[0x41], "x"), Err(UefiError::Truncated("x")));
        assert_eq!(decode_utf16le(&[0x00, 0xd8], "x"), Err(UefiError::InvalidUtf16("x")));
    }
}
