//! Per-section runtime addresses for the current module.
//!
//! Live kernels expose one file per allocatable section under
//! `/sys/module/<name>/sections/`, each holding a single hex address.
//! For a core dump the same data is read from `mod->sect_attrs`.

use super::CrashModules;
use crate::domain::errors::{DiscoveryError, Result};
use crate::target::{read_c_string, read_pointer, read_unsigned, Field, KernelData, SystemRoot};
use log::debug;
use std::fs;
use std::path::PathBuf;

/// Upper bound on a section name read out of kernel memory.
const SECTION_NAME_MAX: usize = 256;

/// Lending iterator over `(section name, runtime address)` pairs.
pub struct SectionIter<'a, K: KernelData> {
    source: SectionSource<'a, K>,
    name: String,
}

enum SectionSource<'a, K: KernelData> {
    Live {
        dir: fs::ReadDir,
        dir_path: PathBuf,
    },
    Crash {
        kernel: &'a K,
        /// Address of `mod->sect_attrs->attrs[0]`.
        attrs: u64,
        elem_size: u64,
        nsections: u64,
        index: u64,
        address_field: Field,
        /// Offset of the `char *` section name within one attr entry.
        name_ptr_offset: u64,
    },
}

impl<K: KernelData> SectionIter<'_, K> {
    /// Next `(name, address)` pair, or `None` when exhausted. The name
    /// borrows an iterator-owned buffer and is invalidated by the next
    /// call.
    pub fn next_section(&mut self) -> Result<Option<(&str, u64)>> {
        let (name, address) = match &mut self.source {
            SectionSource::Live { dir, dir_path } => loop {
                let Some(entry) = dir.next() else { return Ok(None) };
                let entry = entry
                    .map_err(|e| DiscoveryError::os("readdir", dir_path.display().to_string(), e))?;
                let path = entry.path();
                // DirEntry::file_type falls back to a stat when the
                // directory entry type is unknown.
                let file_type = entry
                    .file_type()
                    .map_err(|e| DiscoveryError::os("stat", path.display().to_string(), e))?;
                if file_type.is_dir() {
                    continue;
                }
                let address = read_hex_file(&path)?;
                break (entry.file_name().to_string_lossy().into_owned(), address);
            },
            SectionSource::Crash {
                kernel,
                attrs,
                elem_size,
                nsections,
                index,
                address_field,
                name_ptr_offset,
            } => {
                if *index >= *nsections {
                    return Ok(None);
                }
                let element = *attrs + *index * *elem_size;
                *index += 1;
                let address =
                    read_unsigned(*kernel, element + address_field.offset, address_field.size)?;
                let name_ptr = read_pointer(*kernel, element + *name_ptr_offset)?;
                let bytes = read_c_string(*kernel, name_ptr, SECTION_NAME_MAX)?;
                (String::from_utf8_lossy(&bytes).into_owned(), address)
            }
        };
        self.name = name;
        Ok(Some((&self.name, address)))
    }
}

fn read_hex_file(path: &std::path::Path) -> Result<u64> {
    let text = fs::read_to_string(path)
        .map_err(|e| DiscoveryError::os("read", path.display().to_string(), e))?;
    let value = text.trim();
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|_| DiscoveryError::other(format!("could not parse {}", path.display())))
}

pub(super) fn live_sections<'a, K: KernelData>(
    root: &SystemRoot,
    name: &str,
) -> Result<SectionIter<'a, K>> {
    let dir_path = root.path(&format!("/sys/module/{name}/sections"));
    let dir = fs::read_dir(&dir_path)
        .map_err(|e| DiscoveryError::os("opendir", dir_path.display().to_string(), e))?;
    Ok(SectionIter { source: SectionSource::Live { dir, dir_path }, name: String::new() })
}

pub(super) fn crash_sections<'k, K: KernelData>(
    crash: &CrashModules<'k, K>,
) -> Result<SectionIter<'k, K>> {
    let kernel = crash.kernel;

    let sect_attrs_field = kernel.field("struct module", "sect_attrs")?;
    let sect_attrs = read_pointer(kernel, crash.module_addr + sect_attrs_field.offset)?;
    let nsections_field = kernel.field("struct module_sect_attrs", "nsections")?;
    let nsections = read_unsigned(kernel, sect_attrs + nsections_field.offset, nsections_field.size)?;
    let attrs_field = kernel.field("struct module_sect_attrs", "attrs")?;
    let elem_size = kernel.type_size("struct module_sect_attr")?;
    let address_field = kernel.field("struct module_sect_attr", "address")?;

    // v5.8 turned the section attribute into a bin attribute, moving
    // the name to battr.attr.name.
    let name_ptr_offset = match kernel.field("struct module_sect_attr", "battr") {
        Ok(battr) => {
            let attr = kernel.field("struct bin_attribute", "attr")?;
            let name = kernel.field("struct attribute", "name")?;
            battr.offset + attr.offset + name.offset
        }
        Err(err) if err.is_lookup() => {
            debug!("module_sect_attr has no battr; using the name member");
            kernel.field("struct module_sect_attr", "name")?.offset
        }
        Err(err) => return Err(err),
    };

    Ok(SectionIter {
        source: SectionSource::Crash {
            kernel,
            attrs: sect_attrs + attrs_field.offset,
            elem_size,
            nsections,
            index: 0,
            address_field,
            name_ptr_offset,
        },
        name: String::new(),
    })
}
