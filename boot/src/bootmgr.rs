//! bootmgr.rs — Firmware boot entries (`Boot####`) and `BootOrder`
//!
//! The boot manager loads every `Boot####` variable under the global GUID
//! once, keeps an in-memory view, and writes through to the variable store
//! on each change. Entries we cannot parse are left alone: their numbers
//! stay reserved and keep their place in `BootOrder`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use log::{info, warn};
use serde::Serialize;

use crate::efi::{
    encode_utf16le, DevicePath, EfiVariables, FileDevicePathMode, LoadOption,
    LoadOptionAttributes, VarError, VariableAttributes, VariableDescriptor, GLOBAL_VARIABLE,
};
use crate::error::{Error, Result};
use crate::kernel::BootEntry;

const BOOT_ORDER: &str = "BootOrder";

fn boot_var(number: u16) -> VariableDescriptor {
    VariableDescriptor::global(format!("Boot{:04X}", number))
}

/// `Boot001A` -> 0x1a. Anything else (`BootOrder`, `BootNext`, lowercase
/// `Boot001a`, ...) is `None`.
fn parse_boot_var(name: &str) -> Option<u16> {
    let digits = name.strip_prefix("Boot")?;
    if digits.len() != 4
        || !digits.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
    {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

/// One loaded `Boot####` variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntryVariable {
    pub number: u16,
    /// Raw payload as stored in firmware.
    pub data: Vec<u8>,
    pub attributes: VariableAttributes,
    pub option: LoadOption,
}

/// What one [`BootManager::commit`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootCommit {
    /// Entry numbers for the committed entries, in boot order.
    pub entries: Vec<u16>,
    pub created: Vec<u16>,
    pub deleted: Vec<u16>,
}

pub struct BootManager {
    vars: Box<dyn EfiVariables>,
    entries: BTreeMap<u16, BootEntryVariable>,
    /// `Boot####` variables present in firmware that did not parse.
    foreign: BTreeSet<u16>,
    boot_order: Vec<u16>,
}

impl BootManager {
    /// Load all boot entries and the boot order from `vars`.
    pub fn new(vars: Box<dyn EfiVariables>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut foreign = BTreeSet::new();

        for desc in vars.list_variables()? {
            if desc.guid != GLOBAL_VARIABLE {
                continue;
            }
            let Some(number) = parse_boot_var(&desc.name) else {
                continue;
            };
            let (data, attributes) = match vars.get_variable(&desc) {
                Ok(v) => v,
                Err(VarError::NotExist) => continue,
                Err(e) => return Err(e.into()),
            };
            match LoadOption::from_bytes(&data) {
                Ok(option) => {
                    entries.insert(
                        number,
                        BootEntryVariable { number, data, attributes, option },
                    );
                }
                Err(e) => {
                    warn!("skipping {}: {}", desc.name, e);
                    foreign.insert(number);
                }
            }
        }

        let boot_order = match vars.get_variable(&VariableDescriptor::global(BOOT_ORDER)) {
            Ok((data, _)) => {
                if data.len() % 2 != 0 {
                    warn!("BootOrder has odd length {}, ignoring last byte", data.len());
                }
                data.chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect()
            }
            Err(VarError::NotExist) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { vars, entries, foreign, boot_order })
    }

    pub fn entries(&self) -> impl Iterator<Item = &BootEntryVariable> {
        self.entries.values()
    }

    pub fn entry(&self, number: u16) -> Option<&BootEntryVariable> {
        self.entries.get(&number)
    }

    pub fn boot_order(&self) -> &[u16] {
        &self.boot_order
    }

    fn exists(&self, number: u16) -> bool {
        self.entries.contains_key(&number) || self.foreign.contains(&number)
    }

    fn next_free_number(&self) -> Option<u16> {
        (0..=u16::MAX).find(|&n| !self.exists(n))
    }

    fn loader_path(&self, dir: &Path, filename: &str) -> Result<DevicePath> {
        Ok(self
            .vars
            .new_file_device_path(&dir.join(filename), FileDevicePathMode::ShortFormHardDrive)?)
    }

    /// Load option for `entry`: loader in `dir`, label as description,
    /// kernel options as NUL-terminated UTF-16LE optional data.
    pub fn load_option_for(&self, entry: &BootEntry, dir: &Path) -> Result<LoadOption> {
        let mut optional_data = encode_utf16le(&entry.options);
        optional_data.extend_from_slice(&[0, 0]);
        Ok(LoadOption {
            attributes: LoadOptionAttributes::ACTIVE,
            description: entry.label.clone(),
            file_path: self.loader_path(dir, &entry.filename)?,
            optional_data,
        })
    }

    /// Number of the `Boot####` variable matching `entry`, creating it if no
    /// byte-identical one exists. The second value is true if it was created.
    pub fn find_or_create_entry(&mut self, entry: &BootEntry, dir: &Path) -> Result<(u16, bool)> {
        let option = self.load_option_for(entry, dir)?;
        let data = option.to_bytes()?;

        if let Some(existing) = self.entries.values().find(|e| e.data == data) {
            return Ok((existing.number, false));
        }

        let number = self.next_free_number().ok_or(Error::NoFreeBootEntry)?;
        let attributes = VariableAttributes::BOOT_DEFAULT;
        self.vars.set_variable(&boot_var(number), &data, attributes)?;
        info!("created Boot{:04X} \"{}\"", number, option.description);
        self.entries.insert(
            number,
            BootEntryVariable { number, data, attributes, option },
        );
        Ok((number, true))
    }

    pub fn delete_entry(&mut self, number: u16) -> Result<()> {
        self.vars
            .set_variable(&boot_var(number), &[], VariableAttributes::BOOT_DEFAULT)?;
        self.entries.remove(&number);
        self.foreign.remove(&number);
        info!("deleted Boot{:04X}", number);
        Ok(())
    }

    pub fn set_boot_order(&mut self, order: &[u16]) -> Result<()> {
        let data: Vec<u8> = order.iter().flat_map(|n| n.to_le_bytes()).collect();
        self.vars.set_variable(
            &VariableDescriptor::global(BOOT_ORDER),
            &data,
            VariableAttributes::BOOT_DEFAULT,
        )?;
        self.boot_order = order.to_vec();
        Ok(())
    }

    /// Put `head` first, followed by the previous order minus duplicates and
    /// minus numbers that no longer have an entry.
    pub fn prepend_and_set_boot_order(&mut self, head: &[u16]) -> Result<()> {
        self.reorder(head, &[])
    }

    /// As [`Self::prepend_and_set_boot_order`], also leaving out `dropped`.
    fn reorder(&mut self, head: &[u16], dropped: &[u16]) -> Result<()> {
        let mut seen = BTreeSet::new();
        let order: Vec<u16> = head
            .iter()
            .chain(self.boot_order.iter())
            .copied()
            .filter(|&n| self.exists(n) && !dropped.contains(&n) && seen.insert(n))
            .collect();
        if order == self.boot_order {
            return Ok(());
        }
        self.set_boot_order(&order)
    }

    /// Make firmware boot `entries` (in that order) from loaders in `dir`.
    ///
    /// Entries that point at one of the same loader binaries but are no
    /// longer wanted (an old kernel's entry) are deleted. `BootOrder` is
    /// written before any deletion so it never names a missing entry.
    pub fn commit(&mut self, dir: &Path, entries: &[BootEntry]) -> Result<BootCommit> {
        let mut out = BootCommit::default();

        for entry in entries {
            let (number, created) = self.find_or_create_entry(entry, dir)?;
            if created {
                out.created.push(number);
            }
            if !out.entries.contains(&number) {
                out.entries.push(number);
            }
        }

        let mut loaders = Vec::new();
        for filename in entries.iter().map(|e| e.filename.as_str()).collect::<BTreeSet<_>>() {
            loaders.push(self.loader_path(dir, filename)?);
        }
        let stale: Vec<u16> = self
            .entries
            .values()
            .filter(|e| !out.entries.contains(&e.number) && loaders.contains(&e.option.file_path))
            .map(|e| e.number)
            .collect();

        self.reorder(&out.entries, &stale)?;
        for number in stale {
            self.delete_entry(number)?;
            out.deleted.push(number);
        }
        Ok(out)
    }
}
