//! efivarfs.rs — Firmware variables through Linux efivarfs
//!
//! Each variable is a file `<Name>-<guid>` under the efivarfs mount whose
//! contents are the 4-byte little-endian attributes followed by the payload.
//! The kernel marks most of these files immutable; the flag has to be
//! cleared before a variable can be overwritten or deleted.
//!
//! Device paths for files are built from sysfs (partition geometry) and
//! `/dev/disk/by-partuuid` (GPT partition GUID).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem;
use std::os::raw::{c_int, c_long};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Component, Path, PathBuf};

use log::debug;
use nix::errno::Errno;
use nix::sys::stat::{major, minor};

use super::{
    DevicePath, DevicePathNode, EfiVariables, FileDevicePathMode, Guid, MbrType, SignatureType,
    VarError, VariableAttributes, VariableDescriptor,
};

pub const EFIVARFS_ROOT: &str = "/sys/firmware/efi/efivars";
const SYSFS_ROOT: &str = "/sys";
const DEV_ROOT: &str = "/dev";

const FS_IMMUTABLE_FL: c_int = 0x0000_0010;
const SECTOR_SIZE: u64 = 512;

// FS_IOC_GETFLAGS / FS_IOC_SETFLAGS are declared with a long but move an int.
nix::ioctl_read_bad!(
    fs_ioc_getflags,
    nix::request_code_read!(b'f', 1, mem::size_of::<c_long>()),
    c_int
);
nix::ioctl_write_ptr_bad!(
    fs_ioc_setflags,
    nix::request_code_write!(b'f', 2, mem::size_of::<c_long>()),
    c_int
);

#[derive(Debug, Clone)]
pub struct EfivarfsVariables {
    root: PathBuf,
    sysfs: PathBuf,
    dev: PathBuf,
}

impl Default for EfivarfsVariables {
    fn default() -> Self {
        Self::new()
    }
}

impl EfivarfsVariables {
    pub fn new() -> Self {
        Self::with_roots(EFIVARFS_ROOT, SYSFS_ROOT, DEV_ROOT)
    }

    /// Use alternative mount points, e.g. a chroot's `/sys` and `/dev`.
    pub fn with_roots(
        efivars: impl Into<PathBuf>,
        sysfs: impl Into<PathBuf>,
        dev: impl Into<PathBuf>,
    ) -> Self {
        Self {
            root: efivars.into(),
            sysfs: sysfs.into(),
            dev: dev.into(),
        }
    }

    /// Whether the efivarfs mount exists at all.
    pub fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    fn var_path(&self, desc: &VariableDescriptor) -> PathBuf {
        self.root.join(desc.to_string())
    }

    fn check_available(&self) -> Result<(), VarError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(VarError::Unavailable)
        }
    }
}

/// Split `Name-8be4df61-93ca-11d2-aa0d-00e098032b8c` into its descriptor.
fn parse_var_file_name(file_name: &str) -> Option<VariableDescriptor> {
    const GUID_LEN: usize = 36;
    let split = file_name.len().checked_sub(GUID_LEN + 1)?;
    if !file_name.is_char_boundary(split) || file_name.as_bytes()[split] != b'-' || split == 0 {
        return None;
    }
    let guid = file_name[split + 1..].parse::<Guid>().ok()?;
    Some(VariableDescriptor::new(&file_name[..split], guid))
}

fn clear_immutable(path: &Path) -> io::Result<()> {
    let file = File::open(path)?;
    let fd = file.as_raw_fd();
    let mut flags: c_int = 0;
    // SAFETY: `fd` stays open for the duration of both calls and `flags`
    // outlives them.
    match unsafe { fs_ioc_getflags(fd, &mut flags) } {
        Ok(_) => {}
        // filesystem without inode flags
        Err(Errno::ENOTTY | Errno::EOPNOTSUPP | Errno::EINVAL) => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    if flags & FS_IMMUTABLE_FL == 0 {
        return Ok(());
    }
    flags &= !FS_IMMUTABLE_FL;
    unsafe { fs_ioc_setflags(fd, &flags) }.map_err(io::Error::from)?;
    Ok(())
}

impl EfiVariables for EfivarfsVariables {
    fn list_variables(&self) -> Result<Vec<VariableDescriptor>, VarError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(VarError::Unavailable),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            match name.to_str().and_then(parse_var_file_name) {
                Some(desc) => out.push(desc),
                None => debug!("ignoring efivarfs entry {:?}", name),
            }
        }
        out.sort();
        Ok(out)
    }

    fn get_variable(
        &self,
        desc: &VariableDescriptor,
    ) -> Result<(Vec<u8>, VariableAttributes), VarError> {
        self.check_available()?;
        let mut file = match File::open(self.var_path(desc)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(VarError::NotExist),
            Err(e) => return Err(e.into()),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: shorter than its attribute header", desc),
            )
            .into());
        }
        let attrs = VariableAttributes::from_bits_retain(u32::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3],
        ]));
        Ok((buf.split_off(4), attrs))
    }

    fn set_variable(
        &mut self,
        desc: &VariableDescriptor,
        data: &[u8],
        attrs: VariableAttributes,
    ) -> Result<(), VarError> {
        self.check_available()?;
        let path = self.var_path(desc);

        match clear_immutable(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if data.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        let mut buf = Vec::with_capacity(4 + data.len());
        buf.extend_from_slice(&attrs.bits().to_le_bytes());
        buf.extend_from_slice(data);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(attrs.contains(VariableAttributes::APPEND_WRITE))
            .mode(0o644)
            .open(&path)?;
        // efivarfs takes the whole variable in one write
        let n = file.write(&buf)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("{}: short write ({} of {} bytes)", desc, n, buf.len()),
            )
            .into());
        }
        Ok(())
    }

    fn new_file_device_path(
        &self,
        path: &Path,
        mode: FileDevicePathMode,
    ) -> Result<DevicePath, VarError> {
        if mode == FileDevicePathMode::Full {
            return Err(VarError::Unsupported("full device paths".into()));
        }

        drop(File::open(path)?);
        let path = fs::canonicalize(path)?;
        let dev = fs::metadata(&path)?.dev();
        let mount = mount_point(&path, dev)?;
        let file_node = DevicePathNode::FilePath(efi_file_path(&path, &mount));

        if mode == FileDevicePathMode::ShortFormFile {
            return Ok(DevicePath::new(vec![file_node]));
        }

        let block = self
            .sysfs
            .join("dev/block")
            .join(format!("{}:{}", major(dev), minor(dev)));
        let geometry = read_partition_geometry(&block)?.ok_or_else(|| {
            VarError::Unsupported(format!("{} is not on a disk partition", path.display()))
        })?;
        let guid = self.partition_uuid(dev)?.ok_or_else(|| {
            VarError::Unsupported(format!("{} is not on a GPT partition", path.display()))
        })?;

        Ok(DevicePath::new(vec![
            DevicePathNode::HardDrive {
                partition_number: geometry.number,
                partition_start: geometry.start,
                partition_size: geometry.size,
                signature: guid.to_efi_bytes(),
                mbr_type: MbrType::Gpt,
                signature_type: SignatureType::Guid,
            },
            file_node,
        ]))
    }
}

impl EfivarfsVariables {
    /// GPT partition GUID of the block device `dev`, via the by-partuuid links.
    fn partition_uuid(&self, dev: u64) -> io::Result<Option<Guid>> {
        let dir = self.dev.join("disk/by-partuuid");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let rdev = match fs::metadata(entry.path()) {
                Ok(meta) => meta.rdev(),
                Err(_) => continue,
            };
            if rdev != dev {
                continue;
            }
            // MBR disks show up here too, as `xxxxxxxx-NN`
            if let Some(guid) = entry.file_name().to_str().and_then(|s| s.parse::<Guid>().ok()) {
                return Ok(Some(guid));
            }
        }
        Ok(None)
    }
}

/// Topmost ancestor of `path` still on device `dev`.
fn mount_point(path: &Path, dev: u64) -> io::Result<PathBuf> {
    let mut mount = path.to_path_buf();
    for parent in path.ancestors().skip(1) {
        if fs::metadata(parent)?.dev() != dev {
            break;
        }
        mount = parent.to_path_buf();
    }
    Ok(mount)
}

/// `path` relative to `mount`, in firmware notation: `\EFI\ubuntu\shimx64.efi`.
fn efi_file_path(path: &Path, mount: &Path) -> String {
    let rel = path.strip_prefix(mount).unwrap_or(path);
    let mut out = String::new();
    for c in rel.components() {
        if let Component::Normal(s) = c {
            out.push('\\');
            out.push_str(&s.to_string_lossy());
        }
    }
    if out.is_empty() {
        out.push('\\');
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PartitionGeometry {
    number: u32,
    /// In logical blocks of the disk.
    start: u64,
    size: u64,
}

fn read_sysfs_u64(path: &Path) -> io::Result<Option<u64>> {
    match fs::read_to_string(path) {
        Ok(s) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Partition number, start and size from a sysfs block device directory.
/// `None` if the device is a whole disk rather than a partition.
fn read_partition_geometry(block: &Path) -> io::Result<Option<PartitionGeometry>> {
    let number = match read_sysfs_u64(&block.join("partition"))? {
        Some(n) => u32::try_from(n)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "partition number out of range"))?,
        None => return Ok(None),
    };
    let (start, size) = match (
        read_sysfs_u64(&block.join("start"))?,
        read_sysfs_u64(&block.join("size"))?,
    ) {
        (Some(start), Some(size)) => (start, size),
        _ => return Ok(None),
    };

    // sysfs counts 512-byte sectors; firmware counts the disk's logical blocks
    let block_size = read_sysfs_u64(&block.join("../queue/logical_block_size"))?
        .filter(|&bs| bs >= SECTOR_SIZE)
        .unwrap_or(SECTOR_SIZE);
    let scale = block_size / SECTOR_SIZE;

    Ok(Some(PartitionGeometry {
        number,
        start: start / scale,
        size: size / scale,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::efi::GLOBAL_VARIABLE;
    use pretty_assertions::assert_eq;

    fn vars(dir: &Path) -> EfivarfsVariables {
        EfivarfsVariables::with_roots(dir.join("efivars"), dir.join("sys"), dir.join("dev"))
    }

    #[test]
    fn parses_var_file_names() {
        assert_eq!(
            parse_var_file_name("Boot0001-8be4df61-93ca-11d2-aa0d-00e098032b8c"),
            Some(VariableDescriptor::global("Boot0001"))
        );
        assert_eq!(
            parse_var_file_name("A-B-8be4df61-93ca-11d2-aa0d-00e098032b8c"),
            Some(VariableDescriptor::new("A-B", GLOBAL_VARIABLE))
        );
        assert_eq!(parse_var_file_name("-8be4df61-93ca-11d2-aa0d-00e098032b8c"), None);
        assert_eq!(parse_var_file_name("Boot0001"), None);
        assert_eq!(parse_var_file_name("Boot0001-not-a-guid-at-all-but-long-enough"), None);
    }

    #[test]
    fn missing_mount_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = vars(dir.path());
        let desc = VariableDescriptor::global("BootOrder");
        assert!(matches!(v.list_variables(), Err(VarError::Unavailable)));
        assert!(matches!(v.get_variable(&desc), Err(VarError::Unavailable)));
        assert!(matches!(
            v.set_variable(&desc, &[0, 0], VariableAttributes::BOOT_DEFAULT),
            Err(VarError::Unavailable)
        ));
    }

    #[test]
    fn write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("efivars")).unwrap();
        let mut v = vars(dir.path());
        let desc = VariableDescriptor::global("BootOrder");

        assert!(matches!(v.get_variable(&desc), Err(VarError::NotExist)));

        v.set_variable(&desc, &[1, 0, 0, 0], VariableAttributes::BOOT_DEFAULT).unwrap();
        let raw = fs::read(dir.path().join("efivars/BootOrder-8be4df61-93ca-11d2-aa0d-00e098032b8c")).unwrap();
        assert_eq!(raw, vec![0x07, 0, 0, 0, 1, 0, 0, 0]);

        let (data, attrs) = v.get_variable(&desc).unwrap();
        assert_eq!(data, vec![1, 0, 0, 0]);
        assert_eq!(attrs, VariableAttributes::BOOT_DEFAULT);
        assert_eq!(v.list_variables().unwrap(), vec![desc.clone()]);

        v.set_variable(&desc, &[], VariableAttributes::BOOT_DEFAULT).unwrap();
        assert!(matches!(v.get_variable(&desc), Err(VarError::NotExist)));
    }

    #[test]
    fn short_form_file_is_relative_to_mount() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("EFI").join("ubuntu").join("shimx64.efi");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"shim").unwrap();

        let path = vars(dir.path())
            .new_file_device_path(&file, FileDevicePathMode::ShortFormFile)
            .unwrap();
        let [DevicePathNode::FilePath(p)] = path.nodes() else {
            panic!("unexpected path {}", path);
        };
        assert!(p.ends_with("\\EFI\\ubuntu\\shimx64.efi"), "{}", p);
        assert!(p.starts_with('\\'));
    }

    #[test]
    fn full_paths_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let err = vars(dir.path())
            .new_file_device_path(dir.path(), FileDevicePathMode::Full)
            .unwrap_err();
        assert!(matches!(err, VarError::Unsupported(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = vars(dir.path())
            .new_file_device_path(&dir.path().join("nope.efi"), FileDevicePathMode::ShortFormFile)
            .unwrap_err();
        assert!(matches!(err, VarError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn efi_file_path_notation() {
        assert_eq!(
            efi_file_path(Path::new("/boot/efi/EFI/ubuntu/shimx64.efi"), Path::new("/boot/efi")),
            "\\EFI\\ubuntu\\shimx64.efi"
        );
        assert_eq!(efi_file_path(Path::new("/boot/efi"), Path::new("/boot/efi")), "\\");
    }

    #[test]
    fn partition_geometry_from_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("sda");
        let part = disk.join("sda1");
        fs::create_dir_all(&part).unwrap();
        fs::create_dir_all(disk.join("queue")).unwrap();
        fs::write(part.join("partition"), "1\n").unwrap();
        fs::write(part.join("start"), "2048\n").unwrap();
        fs::write(part.join("size"), "1048576\n").unwrap();

        assert_eq!(
            read_partition_geometry(&part).unwrap(),
            Some(PartitionGeometry { number: 1, start: 2048, size: 1_048_576 })
        );

        fs::write(disk.join("queue/logical_block_size"), "4096\n").unwrap();
        assert_eq!(
            read_partition_geometry(&part).unwrap(),
            Some(PartitionGeometry { number: 1, start: 256, size: 131_072 })
        );

        assert_eq!(read_partition_geometry(&disk).unwrap(), None);
    }
}
