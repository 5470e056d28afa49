//! load_option.rs — EFI_LOAD_OPTION, the payload of `Boot####`
//!
//! Layout (little-endian):
//!   +---------------------------+
//!   | attributes          u32   |
//!   | file path list len  u16   |
//!   | description  UTF-16, NUL  |
//!   | file path list (+ end)    |
//!   | optional data ...         |
//!   +---------------------------+

use bitflags::bitflags;

use super::{decode_utf16le, encode_utf16le, DevicePath, UefiError};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LoadOptionAttributes: u32 {
        const ACTIVE = 0x0000_0001;
        const FORCE_RECONNECT = 0x0000_0002;
        const HIDDEN = 0x0000_0008;
        const CATEGORY_APP = 0x0000_0100;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOption {
    pub attributes: LoadOptionAttributes,
    pub description: String,
    pub file_path: DevicePath,
    pub optional_data: Vec<u8>,
}

impl LoadOption {
    /// Wire encoding. Refuses a description with an embedded NUL, which
    /// would end it early on the way back.
    pub fn to_bytes(&self) -> Result<Vec<u8>, UefiError> {
        if self.description.contains('\0') {
            return Err(UefiError::Unencodable("load option description"));
        }
        let path = self.file_path.to_bytes()?;
        let path_len = u16::try_from(path.len()).map_err(|_| UefiError::TooLong("file path list"))?;

        let mut out = Vec::with_capacity(8 + self.description.len() * 2 + path.len());
        out.extend_from_slice(&self.attributes.bits().to_le_bytes());
        out.extend_from_slice(&path_len.to_le_bytes());
        out.extend_from_slice(&encode_utf16le(&self.description));
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&path);
        out.extend_from_slice(&self.optional_data);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UefiError> {
        let header = bytes.get(0..6).ok_or(UefiError::Truncated("load option header"))?;
        let attributes = LoadOptionAttributes::from_bits_retain(u32::from_le_bytes([
            header[0], header[1], header[2], header[3],
        ]));
        let path_len = u16::from_le_bytes([header[4], header[5]]) as usize;

        // description runs up to the first NUL code unit
        let rest = &bytes[6..];
        let nul = rest
            .chunks_exact(2)
            .position(|c| c == [0, 0])
            .ok_or(UefiError::Truncated("load option description"))?;
        let description = decode_utf16le(&rest[..nul * 2], "load option description")?;
        let rest = &rest[nul * 2 + 2..];

        let path_bytes = rest
            .get(..path_len)
            .ok_or(UefiError::Truncated("load option file path list"))?;
        let (file_path, used) = DevicePath::parse_prefix(path_bytes)?;
        if used != path_len {
            return Err(UefiError::TrailingData("load option file path"));
        }

        Ok(Self {
            attributes,
            description,
            file_path,
            optional_data: rest[path_len..].to_vec(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.attributes.contains(LoadOptionAttributes::ACTIVE)
    }

    /// Optional data read as NUL-terminated UTF-16LE, the way loaders such as
    /// shim take their arguments. `None` if it is not text.
    pub fn optional_data_text(&self) -> Option<String> {
        let data = self.optional_data.strip_suffix(&[0, 0]).unwrap_or(&self.optional_data[..]);
        decode_utf16le(data, "optional data").ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::efi::device_path::PCI_ROOT_HID;
    use crate::efi::{DevicePathNode, MbrType, SignatureType};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn usbr_boot_cdrom() -> LoadOption {
        LoadOption {
            attributes: LoadOptionAttributes::ACTIVE | LoadOptionAttributes::HIDDEN,
            description: "USBR BOOT CDROM".into(),
            file_path: DevicePath::new(vec![
                DevicePathNode::Acpi { hid: PCI_ROOT_HID, uid: 0 },
                DevicePathNode::Pci { function: 0, device: 0x14 },
                DevicePathNode::Usb { parent_port: 0xb, interface: 0x1 },
            ]),
            optional_data: Vec::new(),
        }
    }

    fn usbr_boot_cdrom_bytes() -> Vec<u8> {
        let mut b = vec![0x09, 0x00, 0x00, 0x00, 0x1c, 0x00];
        for c in "USBR BOOT CDROM".bytes() {
            b.extend_from_slice(&[c, 0]);
        }
        b.extend_from_slice(&[0, 0]);
        b.extend_from_slice(&[
            0x02, 0x01, 0x0c, 0x00, 0xd0, 0x41, 0x03, 0x0a, 0x00, 0x00, 0x00, 0x00, 0x01, 0x01,
            0x06, 0x00, 0x00, 0x14, 0x03, 0x05, 0x06, 0x00, 0x0b, 0x01, 0x7f, 0xff, 0x04, 0x00,
        ]);
        b
    }

    #[test]
    fn encodes_firmware_layout() {
        assert_eq!(usbr_boot_cdrom().to_bytes().unwrap(), usbr_boot_cdrom_bytes());
    }

    #[test]
    fn parses_firmware_layout() {
        let opt = LoadOption::from_bytes(&usbr_boot_cdrom_bytes()).unwrap();
        assert_eq!(opt, usbr_boot_cdrom());
        assert!(opt.is_active());
    }

    #[test]
    fn optional_data_is_the_tail() {
        let mut opt = usbr_boot_cdrom();
        opt.optional_data = b"\\\0k\0".to_vec();
        let bytes = opt.to_bytes().unwrap();
        assert_eq!(&bytes[bytes.len() - 4..], b"\\\0k\0");
        assert_eq!(LoadOption::from_bytes(&bytes).unwrap(), opt);
        assert_eq!(opt.optional_data_text().as_deref(), Some("\\k"));

        opt.optional_data = vec![0x41];
        assert_eq!(opt.optional_data_text(), None);
    }

    #[test]
    fn rejects_truncation() {
        let bytes = usbr_boot_cdrom_bytes();
        assert_eq!(LoadOption::from_bytes(&bytes[..4]), Err(UefiError::Truncated("load option header")));
        assert_eq!(
            LoadOption::from_bytes(&bytes[..20]),
            Err(UefiError::Truncated("load option description"))
        );
        assert_eq!(
            LoadOption::from_bytes(&bytes[..bytes.len() - 2]),
            Err(UefiError::Truncated("load option file path list"))
        );
    }

    #[test]
    fn path_list_length_must_match_path() {
        let mut bytes = usbr_boot_cdrom_bytes();
        bytes[4] += 2;
        bytes.extend_from_slice(&[0, 0]);
        assert_eq!(
            LoadOption::from_bytes(&bytes),
            Err(UefiError::TrailingData("load option file path"))
        );
    }

    #[test]
    fn nul_in_description_is_refused() {
        let mut opt = usbr_boot_cdrom();
        opt.description = "USBR\0BOOT".into();
        assert_eq!(opt.to_bytes(), Err(UefiError::Unencodable("load option description")));
    }

    #[test]
    fn unknown_node_shaped_like_pci_is_refused() {
        let mut opt = usbr_boot_cdrom();
        opt.file_path = DevicePath::new(vec![DevicePathNode::Unknown {
            node_type: 0x01,
            sub_type: 0x01,
            data: vec![0x00, 0x14],
        }]);
        assert_eq!(opt.to_bytes(), Err(UefiError::Unencodable("device path node")));

        opt.file_path = DevicePath::new(vec![DevicePathNode::Unknown {
            node_type: 0x7f,
            sub_type: 0xff,
            data: Vec::new(),
        }]);
        assert_eq!(opt.to_bytes(), Err(UefiError::Unencodable("end node")));
    }

    fn text(max: usize) -> impl Strategy<Value = String> {
        proptest::collection::vec(prop_oneof![Just('\0'), Just('\\'), any::<char>()], 0..max)
            .prop_map(String::from_iter)
    }

    fn node() -> impl Strategy<Value = DevicePathNode> {
        prop_oneof![
            (any::<u32>(), any::<u32>()).prop_map(|(hid, uid)| DevicePathNode::Acpi { hid, uid }),
            (any::<u8>(), any::<u8>()).prop_map(|(function, device)| DevicePathNode::Pci { function, device }),
            (any::<u8>(), any::<u8>())
                .prop_map(|(parent_port, interface)| DevicePathNode::Usb { parent_port, interface }),
            (any::<u32>(), any::<u64>(), any::<u64>(), any::<[u8; 16]>()).prop_map(|(n, s, l, sig)| {
                DevicePathNode::HardDrive {
                    partition_number: n,
                    partition_start: s,
                    partition_size: l,
                    signature: sig,
                    mbr_type: MbrType::Gpt,
                    signature_type: SignatureType::Guid,
                }
            }),
            text(24).prop_map(DevicePathNode::FilePath),
            (
                prop_oneof![0u8..6, Just(0x7f), any::<u8>()],
                prop_oneof![0u8..6, Just(0xff), any::<u8>()],
                prop_oneof![
                    proptest::collection::vec(any::<u8>(), 0..16),
                    proptest::collection::vec(0u8..3, 2),
                    proptest::collection::vec(0u8..3, 8),
                    proptest::collection::vec(0u8..3, 38),
                ],
            )
                .prop_map(|(node_type, sub_type, data)| DevicePathNode::Unknown { node_type, sub_type, data }),
        ]
    }

    proptest! {
        #[test]
        fn round_trips_or_refuses(
            attrs in any::<u32>(),
            description in text(32),
            nodes in proptest::collection::vec(node(), 0..6),
            optional_data in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let opt = LoadOption {
                attributes: LoadOptionAttributes::from_bits_retain(attrs),
                description,
                file_path: DevicePath::new(nodes),
                optional_data,
            };
            match opt.to_bytes() {
                Ok(bytes) => {
                    prop_assert_eq!(LoadOption::from_bytes(&bytes).unwrap(), opt);
                }
                Err(e) => {
                    prop_assert!(matches!(e, UefiError::Unencodable(_)), "{:?}", e);
                }
            }
        }
    }
}
