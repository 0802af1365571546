//! Loaded-kernel-module enumeration.
//!
//! Two back-ends behind one contract: live kernels are walked via
//! `/proc/modules`; core dumps are walked through the in-kernel
//! `modules` list, chasing `struct module` fields with DWARF-derived
//! layouts. Each [`KernelModuleIterator::advance`] exposes the next
//! module's name and `[start, end)` address range; the name and
//! build-ID buffers are owned by the iterator and overwritten by the
//! next advance.

pub mod build_id;
pub mod sections;

use crate::domain::errors::{DiscoveryError, Result};
use crate::target::{read_c_string, read_pointer, read_unsigned, Field, KernelData, SystemRoot};
use log::debug;
use std::fs::File;
use std::io::{BufRead, BufReader};

pub use sections::SectionIter;

pub struct KernelModuleIterator<'k, K: KernelData> {
    source: ModuleSource<'k, K>,
    name: String,
    start: u64,
    end: u64,
    build_id_buf: Vec<u8>,
}

enum ModuleSource<'k, K: KernelData> {
    Live(LiveModules),
    Crash(CrashModules<'k, K>),
}

struct LiveModules {
    reader: BufReader<File>,
    line: String,
    path: String,
    root: SystemRoot,
}

struct CrashModules<'k, K: KernelData> {
    kernel: &'k K,
    /// Address of the global `modules` list head; the list is circular
    /// and iteration stops when a link points back here.
    head: u64,
    node: u64,
    module_addr: u64,
    next_offset: u64,
    list_offset: u64,
    name_field: Field,
    layout: Option<LayoutFields>,
}

/// Resolved offsets for a module's base address and size. The kernel
/// moved these fields into `struct module_layout` in v4.5.
#[derive(Clone, Copy)]
struct LayoutFields {
    base_offset: u64,
    base_size: u64,
    size_offset: u64,
    size_size: u64,
}

impl<'k, K: KernelData> KernelModuleIterator<'k, K> {
    /// Live mode reads `/proc/modules`; crash mode locates the global
    /// `modules` list head in the kernel image.
    pub fn new(kernel: &'k K, root: &SystemRoot, use_proc_and_sys: bool) -> Result<Self> {
        let source = if use_proc_and_sys {
            let path = root.path("/proc/modules");
            let label = path.display().to_string();
            let file =
                File::open(&path).map_err(|e| DiscoveryError::os("open", label.clone(), e))?;
            ModuleSource::Live(LiveModules {
                reader: BufReader::new(file),
                line: String::new(),
                path: label,
                root: root.clone(),
            })
        } else {
            ModuleSource::Crash(CrashModules::new(kernel)?)
        };
        Ok(KernelModuleIterator {
            source,
            name: String::new(),
            start: 0,
            end: 0,
            build_id_buf: Vec::new(),
        })
    }

    /// Step to the next loaded module. Returns `false` when the list
    /// is exhausted. The iterator must not be advanced again after an
    /// error.
    pub fn advance(&mut self) -> Result<bool> {
        let next = match &mut self.source {
            ModuleSource::Live(live) => advance_live(live)?,
            ModuleSource::Crash(crash) => advance_crash(crash)?,
        };
        match next {
            Some((name, start, end)) => {
                self.name = name;
                self.start = start;
                self.end = end;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Name of the current module. Overwritten by the next advance.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Exclusive upper bound of the module's code+data range.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// The current module's GNU build ID, if it has one. The slice
    /// borrows an iterator-owned scratch buffer and is invalidated by
    /// the next advance.
    pub fn build_id(&mut self) -> Result<Option<&[u8]>> {
        let range = match &mut self.source {
            ModuleSource::Live(live) => {
                build_id::live_build_id(&live.root, &self.name, &mut self.build_id_buf)?
            }
            ModuleSource::Crash(crash) => {
                build_id::crash_build_id(crash, &mut self.build_id_buf)?
            }
        };
        Ok(range.map(|r| &self.build_id_buf[r]))
    }

    /// Iterate `(section name, runtime address)` pairs for the current
    /// module.
    pub fn sections(&mut self) -> Result<SectionIter<'_, K>> {
        match &mut self.source {
            ModuleSource::Live(live) => sections::live_sections(&live.root, &self.name),
            ModuleSource::Crash(crash) => sections::crash_sections(crash),
        }
    }
}

fn advance_live(live: &mut LiveModules) -> Result<Option<(String, u64, u64)>> {
    live.line.clear();
    let n = live
        .reader
        .read_line(&mut live.line)
        .map_err(|e| DiscoveryError::os("read", live.path.clone(), e))?;
    if n == 0 {
        return Ok(None);
    }
    let (name, start, end) = parse_proc_modules_line(&live.line)?;
    Ok(Some((name.to_owned(), start, end)))
}

/// `<name> <size> <refcount> <deps> <state> <address>`; size is
/// decimal bytes, address is the hex load address.
fn parse_proc_modules_line(line: &str) -> Result<(&str, u64, u64)> {
    let malformed = || DiscoveryError::other("could not parse /proc/modules");
    let mut fields = line.split_ascii_whitespace();
    let name = fields.next().ok_or_else(malformed)?;
    let size: u64 = fields.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
    let _refcount = fields.next().ok_or_else(malformed)?;
    let _deps = fields.next().ok_or_else(malformed)?;
    let _state = fields.next().ok_or_else(malformed)?;
    let address = fields.next().ok_or_else(malformed)?;
    let start = u64::from_str_radix(address.trim_start_matches("0x"), 16)
        .map_err(|_| malformed())?;
    Ok((name, start, start.wrapping_add(size)))
}

impl<'k, K: KernelData> CrashModules<'k, K> {
    fn new(kernel: &'k K) -> Result<Self> {
        let next_offset = kernel.field("struct list_head", "next")?.offset;
        let list_offset = kernel.field("struct module", "list")?.offset;
        let name_field = kernel.field("struct module", "name")?;
        let head = kernel.variable_address("modules")?;
        Ok(CrashModules {
            kernel,
            head,
            node: head,
            module_addr: 0,
            next_offset,
            list_offset,
            name_field,
            layout: None,
        })
    }
}

fn advance_crash<K: KernelData>(
    crash: &mut CrashModules<'_, K>,
) -> Result<Option<(String, u64, u64)>> {
    let kernel = crash.kernel;
    let next = read_pointer(kernel, crash.node + crash.next_offset)?;
    if next == crash.head {
        return Ok(None);
    }
    crash.node = next;
    // container-of: the list node is embedded in the module struct
    crash.module_addr = next.wrapping_sub(crash.list_offset);

    let layout = match crash.layout {
        Some(layout) => layout,
        None => {
            let layout = resolve_layout(kernel)?;
            crash.layout = Some(layout);
            layout
        }
    };
    let start = read_unsigned(kernel, crash.module_addr + layout.base_offset, layout.base_size)?;
    let size = read_unsigned(kernel, crash.module_addr + layout.size_offset, layout.size_size)?;

    let name_bytes = read_c_string(
        kernel,
        crash.module_addr + crash.name_field.offset,
        crash.name_field.size.max(1) as usize,
    )?;
    let name = String::from_utf8_lossy(&name_bytes).into_owned();
    Ok(Some((name, start, start.wrapping_add(size))))
}

fn resolve_layout<K: KernelData>(kernel: &K) -> Result<LayoutFields> {
    match kernel.field("struct module", "core_layout") {
        Ok(core_layout) => {
            // v4.5 and later: base and size live in the embedded
            // `struct module_layout core_layout`.
            let base = kernel.field("struct module_layout", "base")?;
            let size = kernel.field("struct module_layout", "size")?;
            Ok(LayoutFields {
                base_offset: core_layout.offset + base.offset,
                base_size: base.size,
                size_offset: core_layout.offset + size.offset,
                size_size: size.size,
            })
        }
        Err(err) if err.is_lookup() => {
            debug!("struct module has no core_layout; using module_core/core_size");
            let base = kernel.field("struct module", "module_core")?;
            let size = kernel.field("struct module", "core_size")?;
            Ok(LayoutFields {
                base_offset: base.offset,
                base_size: base.size,
                size_offset: size.offset,
                size_size: size.size,
            })
        }
        Err(err) => Err(err),
    }
}
