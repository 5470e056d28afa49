//! shim.rs — `BOOT<ARCH>.CSV` for shim's fallback loader
//!
//! When firmware boots `\EFI\BOOT\BOOT<ARCH>.EFI` (shim), its fallback loader
//! scans vendor directories for `BOOT<ARCH>.CSV`, recreates the boot entries
//! listed there and boots the first one. One record per line:
//!
//! ```text
//! shimx64.efi,Ubuntu with kernel 5.4.0-10,\kernel.efi-5.4.0-10 root=...,Ubuntu entry for kernel 5.4.0-10
//! ```
//!
//! The file is UTF-16LE with a byte order mark; fallback rejects anything else.

use std::io;
use std::path::Path;

use log::debug;

use crate::efi::encode_utf16le;
use crate::fs::Filesystem;
use crate::kernel::BootEntry;

const BOM: [u8; 2] = [0xff, 0xfe];

/// Fallback config file name for an architecture tag: `x64` -> `BOOTX64.CSV`.
pub fn fallback_file_name(arch: &str) -> String {
    format!("BOOT{}.CSV", arch.to_uppercase())
}

/// The CSV text, one line per entry, in entry order.
pub fn render_fallback(entries: &[BootEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        out.push_str(&e.filename);
        out.push(',');
        out.push_str(&e.label);
        out.push(',');
        out.push_str(&e.options);
        out.push(',');
        out.push_str(&e.description);
        out.push('\n');
    }
    out
}

/// The on-disk bytes: BOM + UTF-16LE of [`render_fallback`].
pub fn encode_fallback(entries: &[BootEntry]) -> Vec<u8> {
    let text = render_fallback(entries);
    let mut out = Vec::with_capacity(2 + text.len() * 2);
    out.extend_from_slice(&BOM);
    out.extend_from_slice(&encode_utf16le(&text));
    out
}

/// Replace the fallback config at `path` with `entries`, atomically.
pub fn write_fallback(fs: &dyn Filesystem, path: &Path, entries: &[BootEntry]) -> io::Result<()> {
    let bytes = encode_fallback(entries);
    debug!("writing {} ({} entries)", path.display(), entries.len());
    fs.write_atomic(path, &mut bytes.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use pretty_assertions::assert_eq;

    fn entry(abi: &str) -> BootEntry {
        BootEntry {
            filename: "shimx64.efi".into(),
            label: format!("Ubuntu with kernel {}", abi),
            options: format!("\\kernel.efi-{} root=/dev/sda2 ro", abi),
            description: format!("Ubuntu entry for kernel {}", abi),
        }
    }

    #[test]
    fn file_name_is_upper_case() {
        assert_eq!(fallback_file_name("x64"), "BOOTX64.CSV");
        assert_eq!(fallback_file_name("aa64"), "BOOTAA64.CSV");
    }

    #[test]
    fn renders_one_line_per_entry() {
        assert_eq!(
            render_fallback(&[entry("5.4.0-10"), entry("5.4.0-9")]),
            "shimx64.efi,Ubuntu with kernel 5.4.0-10,\\kernel.efi-5.4.0-10 root=/dev/sda2 ro,Ubuntu entry for kernel 5.4.0-10\n\
             shimx64.efi,Ubuntu with kernel 5.4.0-9,\\kernel.efi-5.4.0-9 root=/dev/sda2 ro,Ubuntu entry for kernel 5.4.0-9\n"
        );
        assert_eq!(render_fallback(&[]), "");
    }

    #[test]
    fn encoding_is_utf16le_with_bom() {
        let bytes = encode_fallback(&[entry("1")]);
        assert_eq!(&bytes[..6], &[0xff, 0xfe, b's', 0, b'h', 0]);
        assert_eq!(&bytes[bytes.len() - 2..], &[b'\n', 0]);
        assert_eq!(encode_fallback(&[]), vec![0xff, 0xfe]);
    }

    #[test]
    fn rewrites_are_byte_identical() {
        let fs = MemFs::new();
        fs.add_dir("/esp/EFI/ubuntu");
        let path = Path::new("/esp/EFI/ubuntu/BOOTX64.CSV");
        let entries = [entry("5.4.0-10"), entry("5.4.0-9")];

        write_fallback(&fs, path, &entries).unwrap();
        let first = fs.contents(path).unwrap();
        write_fallback(&fs, path, &entries).unwrap();
        assert_eq!(fs.contents(path).unwrap(), first);
    }

    #[test]
    fn write_failure_is_reported() {
        let fs = MemFs::new();
        fs.add_dir("/esp/EFI/ubuntu");
        let path = Path::new("/esp/EFI/ubuntu/BOOTX64.CSV");
        fs.fail_write(path);
        assert!(write_fallback(&fs, path, &[entry("1")]).is_err());
    }
}
