//! vars.rs — Variable stores that do not touch firmware

use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use super::device_path::PCI_ROOT_HID;
use super::{
    DevicePath, DevicePathNode, EfiVariables, FileDevicePathMode, VarError, VariableAttributes,
    VariableDescriptor,
};
use crate::fs::Filesystem;

/// Firmware variables are off: every call fails with [`VarError::Unavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEfiVariables;

impl EfiVariables for NoEfiVariables {
    fn list_variables(&self) -> Result<Vec<VariableDescriptor>, VarError> {
        Err(VarError::Unavailable)
    }

    fn get_variable(
        &self,
        _desc: &VariableDescriptor,
    ) -> Result<(Vec<u8>, VariableAttributes), VarError> {
        Err(VarError::Unavailable)
    }

    fn set_variable(
        &mut self,
        _desc: &VariableDescriptor,
        _data: &[u8],
        _attrs: VariableAttributes,
    ) -> Result<(), VarError> {
        Err(VarError::Unavailable)
    }

    fn new_file_device_path(
        &self,
        _path: &Path,
        _mode: FileDevicePathMode,
    ) -> Result<DevicePath, VarError> {
        Err(VarError::Unavailable)
    }
}

/// In-memory variable store.
///
/// Device paths are synthetic: any file the injected filesystem can open maps
/// to the same USB route, `PciRoot(0x0)/Pci(0x14,0x0)/USB(0xb,0x1)`.
pub struct MockEfiVariables {
    store: BTreeMap<VariableDescriptor, (Vec<u8>, VariableAttributes)>,
    fs: Rc<dyn Filesystem>,
}

impl MockEfiVariables {
    pub fn new(fs: Rc<dyn Filesystem>) -> Self {
        Self {
            store: BTreeMap::new(),
            fs,
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn synthetic_path() -> DevicePath {
        DevicePath::new(vec![
            DevicePathNode::Acpi { hid: PCI_ROOT_HID, uid: 0 },
            DevicePathNode::Pci { function: 0, device: 0x14 },
            DevicePathNode::Usb { parent_port: 0xb, interface: 0x1 },
        ])
    }
}

impl EfiVariables for MockEfiVariables {
    fn list_variables(&self) -> Result<Vec<VariableDescriptor>, VarError> {
        Ok(self.store.keys().cloned().collect())
    }

    fn get_variable(
        &self,
        desc: &VariableDescriptor,
    ) -> Result<(Vec<u8>, VariableAttributes), VarError> {
        self.store.get(desc).cloned().ok_or(VarError::NotExist)
    }

    fn set_variable(
        &mut self,
        desc: &VariableDescriptor,
        data: &[u8],
        attrs: VariableAttributes,
    ) -> Result<(), VarError> {
        if data.is_empty() {
            self.store.remove(desc);
        } else {
            self.store.insert(desc.clone(), (data.to_vec(), attrs));
        }
        Ok(())
    }

    fn new_file_device_path(
        &self,
        path: &Path,
        _mode: FileDevicePathMode,
    ) -> Result<DevicePath, VarError> {
        drop(self.fs.open(path)?);
        Ok(Self::synthetic_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn mock() -> MockEfiVariables {
        MockEfiVariables::new(Rc::new(MemFs::new()))
    }

    #[test]
    fn no_variables_is_unavailable() {
        let mut vars = NoEfiVariables;
        let desc = VariableDescriptor::global("BootOrder");
        assert!(matches!(vars.list_variables(), Err(VarError::Unavailable)));
        assert!(matches!(vars.get_variable(&desc), Err(VarError::Unavailable)));
        assert!(matches!(
            vars.set_variable(&desc, &[1], VariableAttributes::BOOT_DEFAULT),
            Err(VarError::Unavailable)
        ));
        assert!(matches!(
            vars.new_file_device_path(Path::new("/x"), FileDevicePathMode::ShortFormFile),
            Err(VarError::Unavailable)
        ));
    }

    #[test]
    fn missing_variable() {
        let vars = mock();
        assert!(matches!(
            vars.get_variable(&VariableDescriptor::global("Boot0000")),
            Err(VarError::NotExist)
        ));
        assert!(vars.list_variables().unwrap().is_empty());
    }

    #[test]
    fn empty_write_deletes() {
        let mut vars = mock();
        let desc = VariableDescriptor::global("Boot0001");
        vars.set_variable(&desc, &[1, 2], VariableAttributes::BOOT_DEFAULT).unwrap();
        assert_eq!(vars.list_variables().unwrap(), vec![desc.clone()]);

        vars.set_variable(&desc, &[], VariableAttributes::BOOT_DEFAULT).unwrap();
        assert!(matches!(vars.get_variable(&desc), Err(VarError::NotExist)));
        assert!(vars.is_empty());
    }

    #[test]
    fn device_path_needs_openable_file() {
        let fs = Rc::new(MemFs::new());
        fs.add_file("/boot/efi/EFI/ubuntu/shimx64.efi", b"shim".to_vec());
        let vars = MockEfiVariables::new(fs);

        let path = vars
            .new_file_device_path(
                Path::new("/boot/efi/EFI/ubuntu/shimx64.efi"),
                FileDevicePathMode::ShortFormHardDrive,
            )
            .unwrap();
        assert_eq!(path.to_string(), "PciRoot(0x0)/Pci(0x14,0x0)/USB(0xb,0x1)");

        let err = vars
            .new_file_device_path(Path::new("/boot/efi/missing.efi"), FileDevicePathMode::ShortFormFile)
            .unwrap_err();
        assert!(matches!(err, VarError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
    }

    proptest! {
        #[test]
        fn set_then_get_returns_payload(
            name in "[A-Za-z0-9]{1,12}",
            data in proptest::collection::vec(any::<u8>(), 1..64),
            bits in any::<u32>(),
        ) {
            let mut vars = mock();
            let desc = VariableDescriptor::global(name);
            let attrs = VariableAttributes::from_bits_retain(bits);
            vars.set_variable(&desc, &data, attrs).unwrap();
            let (got, got_attrs) = vars.get_variable(&desc).unwrap();
            prop_assert_eq!(got, data);
            prop_assert_eq!(got_attrs, attrs);
        }
    }
}
