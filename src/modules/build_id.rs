//! GNU build-ID extraction for the current module of a
//! [`KernelModuleIterator`](super::KernelModuleIterator).
//!
//! Live kernels expose raw note streams as files under
//! `/sys/module/<name>/notes/`; for a core dump the same buffers are
//! read out of kernel memory via `mod->notes_attrs`. Either way the
//! first matching note wins, and the result lands in the iterator's
//! reusable scratch buffer.

use super::CrashModules;
use crate::domain::errors::{DiscoveryError, Result};
use crate::notes::gnu_build_id_range;
use crate::target::{read_pointer, read_unsigned, KernelData, SystemRoot};
use std::fs::{self, File};
use std::io::Read;
use std::ops::Range;

pub(super) fn live_build_id(
    root: &SystemRoot,
    name: &str,
    buf: &mut Vec<u8>,
) -> Result<Option<Range<usize>>> {
    let dir_path = root.path(&format!("/sys/module/{name}/notes"));
    let label = dir_path.display().to_string();
    let entries =
        fs::read_dir(&dir_path).map_err(|e| DiscoveryError::os("opendir", label.clone(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| DiscoveryError::os("readdir", label.clone(), e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| DiscoveryError::os("stat", path.display().to_string(), e))?;
        if file_type.is_dir() {
            continue;
        }
        buf.clear();
        let mut file =
            File::open(&path).map_err(|e| DiscoveryError::os("open", path.display().to_string(), e))?;
        file.read_to_end(buf)
            .map_err(|e| DiscoveryError::os("read", path.display().to_string(), e))?;
        // Note files are written by the running kernel, so they are in
        // host byte order.
        if let Some(range) = gnu_build_id_range(buf, cfg!(target_endian = "little")) {
            return Ok(Some(range));
        }
    }
    Ok(None)
}

pub(super) fn crash_build_id<K: KernelData>(
    crash: &CrashModules<'_, K>,
    buf: &mut Vec<u8>,
) -> Result<Option<Range<usize>>> {
    let kernel = crash.kernel;

    // count = mod->notes_attrs->notes
    let notes_attrs_field = kernel.field("struct module", "notes_attrs")?;
    let notes_attrs = read_pointer(kernel, crash.module_addr + notes_attrs_field.offset)?;
    let count_field = kernel.field("struct module_notes_attrs", "notes")?;
    let count = read_unsigned(kernel, notes_attrs + count_field.offset, count_field.size)?;

    // the bin_attribute array at mod->notes_attrs->attrs
    let attrs_field = kernel.field("struct module_notes_attrs", "attrs")?;
    let attrs = notes_attrs + attrs_field.offset;
    let attr_size = kernel.type_size("struct bin_attribute")?;
    let private_field = kernel.field("struct bin_attribute", "private")?;
    let size_field = kernel.field("struct bin_attribute", "size")?;

    for i in 0..count {
        let attr = attrs + i * attr_size;
        let address = read_pointer(kernel, attr + private_field.offset)?;
        let size = read_unsigned(kernel, attr + size_field.offset, size_field.size)?;
        buf.clear();
        buf.resize(size as usize, 0);
        kernel.read_memory(address, buf, false)?;
        if let Some(range) = gnu_build_id_range(buf, kernel.is_little_endian()) {
            return Ok(Some(range));
        }
    }
    Ok(None)
}
