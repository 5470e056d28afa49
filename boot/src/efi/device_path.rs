//! device_path.rs — UEFI device paths as values
//!
//! Every node on the wire is `type: u8, subtype: u8, length: u16 LE` followed
//! by `length - 4` bytes of payload. A path ends with the end-entire node
//! `7F FF 04 00`, which is not stored in [`DevicePath`]; it is appended when
//! encoding and consumed when decoding.

use std::fmt;

use super::{decode_utf16le, encode_utf16le, Guid, UefiError};

const HEADER_LEN: usize = 4;

const TYPE_HARDWARE: u8 = 0x01;
const TYPE_ACPI: u8 = 0x02;
const TYPE_MESSAGING: u8 = 0x03;
const TYPE_MEDIA: u8 = 0x04;
const TYPE_END: u8 = 0x7f;

const SUBTYPE_PCI: u8 = 0x01;
const SUBTYPE_ACPI: u8 = 0x01;
const SUBTYPE_USB: u8 = 0x05;
const SUBTYPE_HARD_DRIVE: u8 = 0x01;
const SUBTYPE_FILE_PATH: u8 = 0x04;
const SUBTYPE_END_ENTIRE: u8 = 0xff;

/// EISA id of PNP0A03, the PCI root bridge.
pub const PCI_ROOT_HID: u32 = 0x0a03_41d0;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbrType {
    Legacy = 0x01,
    Gpt = 0x02,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    None = 0x00,
    Mbr = 0x01,
    Guid = 0x02,
}

impl MbrType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Legacy),
            0x02 => Some(Self::Gpt),
            _ => None,
        }
    }
}

impl SignatureType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Mbr),
            0x02 => Some(Self::Guid),
            _ => None,
        }
    }
}

/// One hop on the way to a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePathNode {
    /// ACPI device (`02/01`).
    Acpi { hid: u32, uid: u32 },
    /// PCI function on the parent bus (`01/01`).
    Pci { function: u8, device: u8 },
    /// USB port (`03/05`).
    Usb { parent_port: u8, interface: u8 },
    /// Partition (`04/01`), what short-form boot entries start with.
    HardDrive {
        partition_number: u32,
        partition_start: u64,
        partition_size: u64,
        signature: [u8; 16],
        mbr_type: MbrType,
        signature_type: SignatureType,
    },
    /// File on the partition (`04/04`), `\` separated.
    FilePath(String),
    /// Any node kind not modelled above, kept verbatim.
    Unknown { node_type: u8, sub_type: u8, data: Vec<u8> },
}

impl DevicePathNode {
    fn kind(&self) -> (u8, u8) {
        match self {
            Self::Acpi { .. } => (TYPE_ACPI, SUBTYPE_ACPI),
            Self::Pci { .. } => (TYPE_HARDWARE, SUBTYPE_PCI),
            Self::Usb { .. } => (TYPE_MESSAGING, SUBTYPE_USB),
            Self::HardDrive { .. } => (TYPE_MEDIA, SUBTYPE_HARD_DRIVE),
            Self::FilePath(_) => (TYPE_MEDIA, SUBTYPE_FILE_PATH),
            Self::Unknown { node_type, sub_type, .. } => (*node_type, *sub_type),
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::Acpi { hid, uid } => {
                let mut p = hid.to_le_bytes().to_vec();
                p.extend_from_slice(&uid.to_le_bytes());
                p
            }
            Self::Pci { function, device } => vec![*function, *device],
            Self::Usb { parent_port, interface } => vec![*parent_port, *interface],
            Self::HardDrive {
                partition_number,
                partition_start,
                partition_size,
                signature,
                mbr_type,
                signature_type,
            } => {
                let mut p = Vec::with_capacity(38);
                p.extend_from_slice(&partition_number.to_le_bytes());
                p.extend_from_slice(&partition_start.to_le_bytes());
                p.extend_from_slice(&partition_size.to_le_bytes());
                p.extend_from_slice(signature);
                p.push(*mbr_type as u8);
                p.push(*signature_type as u8);
                p
            }
            Self::FilePath(path) => {
                let mut p = encode_utf16le(path);
                p.extend_from_slice(&[0, 0]);
                p
            }
            Self::Unknown { data, .. } => data.clone(),
        }
    }

    /// Nodes that would not decode back to themselves: a file path with an
    /// embedded NUL, or an unknown node that reads as the end marker or as
    /// one of the modelled kinds.
    fn check_encodable(&self) -> Result<(), UefiError> {
        match self {
            Self::FilePath(path) if path.contains('\0') => {
                Err(UefiError::Unencodable("file path node"))
            }
            Self::Unknown { node_type: TYPE_END, sub_type: SUBTYPE_END_ENTIRE, .. } => {
                Err(UefiError::Unencodable("end node"))
            }
            Self::Unknown { node_type, sub_type, data } => {
                match Self::decode(*node_type, *sub_type, data) {
                    Ok(Self::Unknown { .. }) => Ok(()),
                    _ => Err(UefiError::Unencodable("device path node")),
                }
            }
            _ => Ok(()),
        }
    }

    /// Append the encoded node to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), UefiError> {
        self.check_encodable()?;
        let (node_type, sub_type) = self.kind();
        let payload = self.payload();
        let len = u16::try_from(HEADER_LEN + payload.len())
            .map_err(|_| UefiError::TooLong("device path node"))?;
        out.push(node_type);
        out.push(sub_type);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(())
    }

    fn decode(node_type: u8, sub_type: u8, data: &[u8]) -> Result<Self, UefiError> {
        let node = match (node_type, sub_type, data.len()) {
            (TYPE_ACPI, SUBTYPE_ACPI, 8) => Self::Acpi {
                hid: le_u32(&data[0..4]),
                uid: le_u32(&data[4..8]),
            },
            (TYPE_HARDWARE, SUBTYPE_PCI, 2) => Self::Pci { function: data[0], device: data[1] },
            (TYPE_MESSAGING, SUBTYPE_USB, 2) => Self::Usb { parent_port: data[0], interface: data[1] },
            (TYPE_MEDIA, SUBTYPE_HARD_DRIVE, 38) => {
                match (MbrType::from_u8(data[36]), SignatureType::from_u8(data[37])) {
                    (Some(mbr_type), Some(signature_type)) => {
                        let mut signature = [0u8; 16];
                        signature.copy_from_slice(&data[20..36]);
                        Self::HardDrive {
                            partition_number: le_u32(&data[0..4]),
                            partition_start: le_u64(&data[4..12]),
                            partition_size: le_u64(&data[12..20]),
                            signature,
                            mbr_type,
                            signature_type,
                        }
                    }
                    _ => Self::unknown(node_type, sub_type, data),
                }
            }
            (TYPE_MEDIA, SUBTYPE_FILE_PATH, _) => {
                let text = data.strip_suffix(&[0, 0]).unwrap_or(data);
                Self::FilePath(decode_utf16le(text, "file path node")?)
            }
            _ => Self::unknown(node_type, sub_type, data),
        };
        Ok(node)
    }

    fn unknown(node_type: u8, sub_type: u8, data: &[u8]) -> Self {
        Self::Unknown { node_type, sub_type, data: data.to_vec() }
    }
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_le_bytes(a)
}

/// An ordered route from a controller down to a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePath(pub Vec<DevicePathNode>);

impl DevicePath {
    pub fn new(nodes: Vec<DevicePathNode>) -> Self {
        Self(nodes)
    }

    pub fn nodes(&self) -> &[DevicePathNode] {
        &self.0
    }

    /// Wire encoding, end node included.
    pub fn to_bytes(&self) -> Result<Vec<u8>, UefiError> {
        let mut out = Vec::new();
        for node in &self.0 {
            node.write_to(&mut out)?;
        }
        out.extend_from_slice(&[TYPE_END, SUBTYPE_END_ENTIRE, HEADER_LEN as u8, 0]);
        Ok(out)
    }

    /// Decode one path from the front of `bytes`, returning it and the
    /// number of bytes consumed (end node included).
    pub fn parse_prefix(bytes: &[u8]) -> Result<(Self, usize), UefiError> {
        let mut nodes = Vec::new();
        let mut off = 0;
        loop {
            let header = bytes
                .get(off..off + HEADER_LEN)
                .ok_or(if off == bytes.len() {
                    UefiError::MissingEnd
                } else {
                    UefiError::Truncated("device path node header")
                })?;
            let (node_type, sub_type) = (header[0], header[1]);
            let len = u16::from_le_bytes([header[2], header[3]]);
            if (len as usize) < HEADER_LEN {
                return Err(UefiError::InvalidNodeLength(len));
            }
            let data = bytes
                .get(off + HEADER_LEN..off + len as usize)
                .ok_or(UefiError::Truncated("device path node"))?;
            off += len as usize;

            if node_type == TYPE_END && sub_type == SUBTYPE_END_ENTIRE {
                return Ok((Self(nodes), off));
            }
            nodes.push(DevicePathNode::decode(node_type, sub_type, data)?);
        }
    }

    /// Decode exactly one path occupying all of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UefiError> {
        let (path, used) = Self::parse_prefix(bytes)?;
        if used != bytes.len() {
            return Err(UefiError::TrailingData("device path"));
        }
        Ok(path)
    }

    /// The file node's path, if the route ends in a file.
    pub fn file_path(&self) -> Option<&str> {
        self.0.iter().rev().find_map(|n| match n {
            DevicePathNode::FilePath(p) => Some(p.as_str()),
            _ => None,
        })
    }
}

impl From<Vec<DevicePathNode>> for DevicePath {
    fn from(nodes: Vec<DevicePathNode>) -> Self {
        Self(nodes)
    }
}

impl fmt::Display for DevicePathNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acpi { hid, uid } if *hid == PCI_ROOT_HID => write!(f, "PciRoot(0x{:x})", uid),
            Self::Acpi { hid, uid } => write!(f, "Acpi(0x{:08x},0x{:x})", hid, uid),
            Self::Pci { function, device } => write!(f, "Pci(0x{:x},0x{:x})", device, function),
            Self::Usb { parent_port, interface } => {
                write!(f, "USB(0x{:x},0x{:x})", parent_port, interface)
            }
            Self::HardDrive {
                partition_number,
                partition_start,
                partition_size,
                signature,
                signature_type,
                ..
            } => {
                write!(f, "HD({},", partition_number)?;
                match signature_type {
                    SignatureType::Guid => write!(f, "GPT,{}", Guid::from_efi_bytes(*signature))?,
                    SignatureType::Mbr => write!(f, "MBR,0x{:08x}", le_u32(&signature[..4]))?,
                    SignatureType::None => write!(f, "NONE")?,
                }
                write!(f, ",0x{:x},0x{:x})", partition_start, partition_size)
            }
            Self::FilePath(p) => f.write_str(p),
            Self::Unknown { node_type, sub_type, data } => {
                write!(f, "Path({},{},", node_type, sub_type)?;
                for b in data {
                    write!(f, "{:02x}", b)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", node)?;
        }
        Ok(())
    }
}
