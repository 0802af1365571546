//! Shared fixtures: a minimal ELF builder, a mock kernel image, a
//! recording indexer, and sysfs/procfs scaffolding.
#![allow(dead_code)]

use kernel_scope::discovery::DebugIndexer;
use kernel_scope::domain::errors::{DiscoveryError, Result};
use kernel_scope::elf::ElfResource;
use kernel_scope::target::{Field, KernelData};
use object::{Object, ObjectSection};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

// ── minimal ELF64 builder ───────────────────────────────────────────

pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_NOTE: u32 = 7;
pub const SHF_ALLOC: u64 = 2;

struct SectionSpec {
    name: String,
    sh_type: u32,
    flags: u64,
    addr: u64,
    data: Vec<u8>,
}

/// Builds little-endian ELF64 images good enough for `object` to
/// parse: header, optional PT_LOAD segments, sections, .shstrtab.
pub struct ElfBuilder {
    e_type: u16,
    sections: Vec<SectionSpec>,
    segments: Vec<(u64, u64)>,
}

impl ElfBuilder {
    pub fn new(e_type: u16) -> Self {
        ElfBuilder { e_type, sections: Vec::new(), segments: Vec::new() }
    }

    pub fn section(
        mut self,
        name: &str,
        sh_type: u32,
        flags: u64,
        addr: u64,
        data: &[u8],
    ) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_owned(),
            sh_type,
            flags,
            addr,
            data: data.to_vec(),
        });
        self
    }

    pub fn alloc_section(self, name: &str) -> Self {
        self.section(name, SHT_PROGBITS, SHF_ALLOC, 0, &[0u8; 16])
    }

    pub fn build_id_note(self, build_id: &[u8]) -> Self {
        let note = gnu_note_bytes(build_id);
        self.section(".note.gnu.build-id", SHT_NOTE, SHF_ALLOC, 0, &note)
    }

    pub fn segment(mut self, vaddr: u64, memsz: u64) -> Self {
        self.segments.push((vaddr, memsz));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut shstrtab = vec![0u8];
        let mut name_offset = |name: &str| -> u32 {
            let offset = shstrtab.len() as u32;
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
            offset
        };

        let phnum = self.segments.len();
        let phoff = if phnum > 0 { 64usize } else { 0 };
        let mut out = vec![0u8; 64 + 56 * phnum];

        // Section data blobs, then .shstrtab, then the header table
        let mut headers: Vec<[u8; 64]> = vec![[0u8; 64]]; // NULL section
        for section in &self.sections {
            let offset = out.len() as u64;
            out.extend_from_slice(&section.data);
            headers.push(section_header(
                name_offset(&section.name),
                section.sh_type,
                section.flags,
                section.addr,
                offset,
                section.data.len() as u64,
            ));
        }
        let shstrtab_name = name_offset(".shstrtab");
        let shstrtab_offset = out.len() as u64;
        out.extend_from_slice(&shstrtab);
        headers.push(section_header(
            shstrtab_name,
            3, // SHT_STRTAB
            0,
            0,
            shstrtab_offset,
            shstrtab.len() as u64,
        ));

        while out.len() % 8 != 0 {
            out.push(0);
        }
        let shoff = out.len() as u64;
        for header in &headers {
            out.extend_from_slice(header);
        }

        // ELF header
        out[..4].copy_from_slice(b"\x7fELF");
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little-endian
        out[6] = 1; // EV_CURRENT
        out[0x10..0x12].copy_from_slice(&self.e_type.to_le_bytes());
        out[0x12..0x14].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        out[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
        out[0x20..0x28].copy_from_slice(&(phoff as u64).to_le_bytes());
        out[0x28..0x30].copy_from_slice(&shoff.to_le_bytes());
        out[0x34..0x36].copy_from_slice(&64u16.to_le_bytes());
        out[0x36..0x38].copy_from_slice(&56u16.to_le_bytes());
        out[0x38..0x3a].copy_from_slice(&(phnum as u16).to_le_bytes());
        out[0x3a..0x3c].copy_from_slice(&64u16.to_le_bytes());
        out[0x3c..0x3e].copy_from_slice(&(headers.len() as u16).to_le_bytes());
        out[0x3e..0x40].copy_from_slice(&((headers.len() - 1) as u16).to_le_bytes());

        // Program headers
        for (i, &(vaddr, memsz)) in self.segments.iter().enumerate() {
            let base = 64 + 56 * i;
            out[base..base + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
            out[base + 4..base + 8].copy_from_slice(&5u32.to_le_bytes()); // R+X
            out[base + 16..base + 24].copy_from_slice(&vaddr.to_le_bytes());
            out[base + 24..base + 32].copy_from_slice(&vaddr.to_le_bytes());
            out[base + 40..base + 48].copy_from_slice(&memsz.to_le_bytes());
            out[base + 48..base + 56].copy_from_slice(&0x1000u64.to_le_bytes());
        }
        out
    }

    pub fn write(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, self.build()).unwrap();
    }
}

fn section_header(
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
) -> [u8; 64] {
    let mut header = [0u8; 64];
    header[0..4].copy_from_slice(&name.to_le_bytes());
    header[4..8].copy_from_slice(&sh_type.to_le_bytes());
    header[8..16].copy_from_slice(&flags.to_le_bytes());
    header[16..24].copy_from_slice(&addr.to_le_bytes());
    header[24..32].copy_from_slice(&offset.to_le_bytes());
    header[32..40].copy_from_slice(&size.to_le_bytes());
    header[56..64].copy_from_slice(&1u64.to_le_bytes()); // addralign
    header
}

/// A raw GNU build-ID note stream in host (little-endian) byte order.
pub fn gnu_note_bytes(build_id: &[u8]) -> Vec<u8> {
    let mut note = Vec::new();
    note.extend_from_slice(&4u32.to_le_bytes());
    note.extend_from_slice(&(build_id.len() as u32).to_le_bytes());
    note.extend_from_slice(&3u32.to_le_bytes()); // NT_GNU_BUILD_ID
    note.extend_from_slice(b"GNU\0");
    note.extend_from_slice(build_id);
    while note.len() % 4 != 0 {
        note.push(0);
    }
    note
}

/// A typical kernel-module ELF: module marker, a couple of
/// relocatable text/data sections, and a build-ID note.
pub fn module_elf(build_id: &[u8]) -> ElfBuilder {
    ElfBuilder::new(ET_REL)
        .alloc_section(".text")
        .alloc_section(".data")
        .alloc_section(".gnu.linkonce.this_module")
        .build_id_note(build_id)
}

/// A vmlinux-shaped ELF: executable with `.init.text` and one
/// loadable segment.
pub fn vmlinux_elf(start: u64, size: u64) -> ElfBuilder {
    ElfBuilder::new(ET_EXEC)
        .section(".init.text", SHT_PROGBITS, SHF_ALLOC, start, &[0u8; 16])
        .segment(start, size)
}

/// Parse an ELF image and return a section's `sh_addr` by name.
pub fn section_address(data: &[u8], name: &str) -> Option<u64> {
    let obj = object::File::parse(data).unwrap();
    obj.sections().find(|s| s.name() == Ok(name)).map(|s| s.address())
}

// ── mock kernel ─────────────────────────────────────────────────────

pub struct MockKernel {
    pub little_endian: bool,
    pub segments: Vec<(u64, Vec<u8>)>,
    pub physical: Vec<(u64, Vec<u8>)>,
    pub variables: HashMap<String, u64>,
    pub fields: HashMap<(String, String), Field>,
    pub sizes: HashMap<String, u64>,
}

impl Default for MockKernel {
    fn default() -> Self {
        MockKernel {
            little_endian: true,
            segments: Vec::new(),
            physical: Vec::new(),
            variables: HashMap::new(),
            fields: HashMap::new(),
            sizes: HashMap::new(),
        }
    }
}

impl KernelData for MockKernel {
    fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    fn address_size(&self) -> usize {
        8
    }

    fn read_memory(&self, address: u64, buf: &mut [u8], physical: bool) -> Result<()> {
        let pool = if physical { &self.physical } else { &self.segments };
        for (base, bytes) in pool {
            let end = base + bytes.len() as u64;
            if address >= *base && address + buf.len() as u64 <= end {
                let offset = (address - base) as usize;
                buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
                return Ok(());
            }
        }
        Err(DiscoveryError::Fault { address })
    }

    fn variable_address(&self, name: &str) -> Result<u64> {
        self.variables
            .get(name)
            .copied()
            .ok_or_else(|| DiscoveryError::lookup("variable", name))
    }

    fn field(&self, type_name: &str, member: &str) -> Result<Field> {
        self.fields
            .get(&(type_name.to_owned(), member.to_owned()))
            .copied()
            .ok_or_else(|| DiscoveryError::lookup("member", format!("{type_name}.{member}")))
    }

    fn type_size(&self, type_name: &str) -> Result<u64> {
        self.sizes
            .get(type_name)
            .copied()
            .ok_or_else(|| DiscoveryError::lookup("type", type_name))
    }
}

// ── fake kernel image ───────────────────────────────────────────────
//
// Struct layouts used by the image (all offsets in bytes):
//   struct list_head          { next@0, prev@8 }                  (16)
//   struct module             { list@8, name@24 (56 bytes),
//                               core_layout@88 { base@0, size@8 },
//                               notes_attrs@112, sect_attrs@120 } (128)
//   struct module_notes_attrs { notes@0, attrs@8 (inline array) }
//   struct bin_attribute      { attr@0 { name@0 }, size@16,
//                               private@24 }                      (40)
//   struct module_sect_attrs  { nsections@8, attrs@16 (inline) }
//   struct module_sect_attr   { battr@0, address@40 }             (48)

pub const KERNEL_BASE: u64 = 0xffff_ffff_c000_0000;

#[derive(Clone)]
pub struct ModuleSpec {
    pub name: String,
    pub start: u64,
    pub size: u64,
    pub build_id: Vec<u8>,
    pub sections: Vec<(String, u64)>,
}

impl ModuleSpec {
    pub fn new(name: &str, start: u64, size: u64, build_id: &[u8]) -> Self {
        ModuleSpec {
            name: name.to_owned(),
            start,
            size,
            build_id: build_id.to_vec(),
            sections: Vec::new(),
        }
    }

    pub fn with_section(mut self, name: &str, address: u64) -> Self {
        self.sections.push((name.to_owned(), address));
        self
    }
}

struct Arena {
    base: u64,
    mem: Vec<u8>,
}

impl Arena {
    fn alloc(&mut self, size: usize) -> u64 {
        while self.mem.len() % 8 != 0 {
            self.mem.push(0);
        }
        let addr = self.base + self.mem.len() as u64;
        self.mem.resize(self.mem.len() + size, 0);
        addr
    }

    fn write_u64(&mut self, addr: u64, value: u64) {
        let offset = (addr - self.base) as usize;
        self.mem[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, addr: u64, value: u32) {
        let offset = (addr - self.base) as usize;
        self.mem[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        let offset = (addr - self.base) as usize;
        self.mem[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// Lay out a fake kernel image holding the given loaded modules.
///
/// `legacy_core` drops `core_layout` in favour of the pre-4.5
/// `module_core`/`core_size` members; `direct_sect_name` drops
/// `battr` in favour of the pre-5.8 `module_sect_attr.name`. The
/// in-memory layout is the same either way, only the advertised debug
/// info changes.
pub fn build_kernel(
    modules: &[ModuleSpec],
    legacy_core: bool,
    direct_sect_name: bool,
) -> MockKernel {
    let mut arena = Arena { base: KERNEL_BASE, mem: Vec::new() };
    let head = arena.alloc(16);

    let mut nodes = Vec::new();
    for spec in modules {
        let module = arena.alloc(128);
        nodes.push(module + 8);

        let mut name = spec.name.as_bytes().to_vec();
        name.truncate(55);
        arena.write_bytes(module + 24, &name);
        arena.write_u64(module + 88, spec.start);
        arena.write_u64(module + 96, spec.size);

        // One note stream holding the build ID
        let note = gnu_note_bytes(&spec.build_id);
        let note_addr = arena.alloc(note.len());
        arena.write_bytes(note_addr, &note);
        let notes_attrs = arena.alloc(8 + 40);
        arena.write_u64(notes_attrs, 1); // notes count
        arena.write_u64(notes_attrs + 8 + 16, note.len() as u64);
        arena.write_u64(notes_attrs + 8 + 24, note_addr);
        arena.write_u64(module + 112, notes_attrs);

        // Section attribute array
        let sect_attrs = arena.alloc(16 + 48 * spec.sections.len());
        arena.write_u32(sect_attrs + 8, spec.sections.len() as u32);
        for (i, (section_name, address)) in spec.sections.iter().enumerate() {
            let mut cstr = section_name.as_bytes().to_vec();
            cstr.push(0);
            let name_addr = arena.alloc(cstr.len());
            arena.write_bytes(name_addr, &cstr);
            let element = sect_attrs + 16 + 48 * i as u64;
            arena.write_u64(element, name_addr);
            arena.write_u64(element + 40, *address);
        }
        arena.write_u64(module + 120, sect_attrs);
    }

    // Circular list: head -> nodes... -> head
    let mut link = head;
    for &node in &nodes {
        arena.write_u64(link, node);
        link = node;
    }
    arena.write_u64(link, head);

    let mut kernel = MockKernel::default();
    kernel.segments.push((KERNEL_BASE, arena.mem));
    kernel.variables.insert("modules".into(), head);

    let mut field = |t: &str, m: &str, offset: u64, size: u64| {
        kernel.fields.insert((t.to_owned(), m.to_owned()), Field { offset, size });
    };
    field("struct list_head", "next", 0, 8);
    field("struct module", "list", 8, 16);
    field("struct module", "name", 24, 56);
    if legacy_core {
        field("struct module", "module_core", 88, 8);
        field("struct module", "core_size", 96, 8);
    } else {
        field("struct module", "core_layout", 88, 16);
        field("struct module_layout", "base", 0, 8);
        field("struct module_layout", "size", 8, 8);
    }
    field("struct module", "notes_attrs", 112, 8);
    field("struct module", "sect_attrs", 120, 8);
    field("struct module_notes_attrs", "notes", 0, 8);
    field("struct module_notes_attrs", "attrs", 8, 0);
    field("struct bin_attribute", "attr", 0, 16);
    field("struct attribute", "name", 0, 8);
    field("struct bin_attribute", "size", 16, 8);
    field("struct bin_attribute", "private", 24, 8);
    field("struct module_sect_attrs", "nsections", 8, 4);
    field("struct module_sect_attrs", "attrs", 16, 0);
    if direct_sect_name {
        field("struct module_sect_attr", "name", 0, 8);
    } else {
        field("struct module_sect_attr", "battr", 0, 40);
    }
    field("struct module_sect_attr", "address", 40, 8);

    kernel.sizes.insert("struct bin_attribute".into(), 40);
    kernel.sizes.insert("struct module_sect_attr".into(), 48);
    kernel
}

// ── live sysroot scaffolding ────────────────────────────────────────

/// Write `/proc/modules` and `/sys/module/<name>/{notes,sections}`
/// below `root` for the given modules.
pub fn write_live_sysroot(root: &Path, modules: &[ModuleSpec]) {
    fs::create_dir_all(root.join("proc")).unwrap();
    let mut proc_modules = String::new();
    for spec in modules {
        proc_modules.push_str(&format!(
            "{} {} 1 - Live 0x{:x}\n",
            spec.name, spec.size, spec.start
        ));

        let notes = root.join(format!("sys/module/{}/notes", spec.name));
        fs::create_dir_all(&notes).unwrap();
        fs::write(notes.join(".note.gnu.build-id"), gnu_note_bytes(&spec.build_id)).unwrap();

        let sections = root.join(format!("sys/module/{}/sections", spec.name));
        fs::create_dir_all(&sections).unwrap();
        for (name, address) in &spec.sections {
            fs::write(sections.join(name), format!("0x{address:x}\n")).unwrap();
        }
    }
    fs::write(root.join("proc/modules"), proc_modules).unwrap();
}

// ── depmod index builder ────────────────────────────────────────────

/// Write a single-prefix-node `modules.dep.bin` mapping each module
/// name to its path. Uses one chain of prefix nodes; fine for the
/// handful of names the tests need, as long as no name is a prefix of
/// another.
pub fn write_depmod_index(root: &Path, osrelease: &str, entries: &[(&str, &str)]) {
    const MAGIC: u32 = 0xB007_F457;
    const VERSION: u32 = 0x0002_0001;
    const PREFIX: u32 = 0x8000_0000;
    const VALUES: u32 = 0x4000_0000;
    const CHILDS: u32 = 0x2000_0000;

    let mut data = Vec::new();
    data.extend_from_slice(&MAGIC.to_be_bytes());
    data.extend_from_slice(&VERSION.to_be_bytes());
    data.extend_from_slice(&[0u8; 4]); // root pointer placeholder

    let root_pointer = if entries.len() == 1 {
        let (name, path) = entries[0];
        let node = data.len() as u32;
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(path.as_bytes());
        data.extend_from_slice(b":\0");
        node | PREFIX | VALUES
    } else {
        // Root with an empty prefix and one child per distinct first
        // byte; each child is a prefix+values node.
        let mut by_first: Vec<(u8, &str, &str)> = entries
            .iter()
            .map(|&(name, path)| (name.as_bytes()[0], name, path))
            .collect();
        by_first.sort_by_key(|&(b, _, _)| b);
        let first = by_first.first().unwrap().0;
        let last = by_first.last().unwrap().0;

        let mut children = vec![0u32; (last - first + 1) as usize];
        for &(byte, name, path) in &by_first {
            let node = data.len() as u32;
            data.extend_from_slice(&name.as_bytes()[1..]);
            data.push(0);
            data.extend_from_slice(&1u32.to_be_bytes());
            data.extend_from_slice(&0u32.to_be_bytes());
            data.extend_from_slice(path.as_bytes());
            data.extend_from_slice(b":\0");
            children[(byte - first) as usize] = node | PREFIX | VALUES;
        }
        let root_node = data.len() as u32;
        data.push(first);
        data.push(last);
        for child in children {
            data.extend_from_slice(&child.to_be_bytes());
        }
        root_node | CHILDS
    };
    data[8..12].copy_from_slice(&root_pointer.to_be_bytes());

    let dir = root.join(format!("lib/modules/{osrelease}"));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("modules.dep.bin"), data).unwrap();
}

// ── recording indexer ───────────────────────────────────────────────

#[derive(Debug)]
pub enum Event {
    Elf { path: PathBuf, start: u64, end: u64, name: Option<String> },
    Flush,
    Error { name: Option<String>, message: Option<String>, cause: Option<String> },
}

pub struct ReportedElf {
    pub elf: ElfResource,
    pub start: u64,
    pub end: u64,
    pub name: Option<String>,
}

#[derive(Default)]
pub struct RecordingIndexer {
    pub events: Vec<Event>,
    pub elfs: Vec<ReportedElf>,
    pub indexed: HashSet<String>,
    pub fatal_errors: bool,
}

impl RecordingIndexer {
    pub fn reported_names(&self) -> Vec<Option<String>> {
        self.elfs.iter().map(|r| r.name.clone()).collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Error { name, message, cause } => Some(format!(
                    "{}: {}: {}",
                    name.as_deref().unwrap_or("-"),
                    message.as_deref().unwrap_or("-"),
                    cause.as_deref().unwrap_or("-"),
                )),
                _ => None,
            })
            .collect()
    }
}

impl DebugIndexer for RecordingIndexer {
    fn report_elf(
        &mut self,
        elf: ElfResource,
        start: u64,
        end: u64,
        name: Option<&str>,
    ) -> Result<bool> {
        let is_new = match name {
            Some(name) => self.indexed.insert(name.to_owned()),
            None => true,
        };
        self.events.push(Event::Elf {
            path: elf.path().to_owned(),
            start,
            end,
            name: name.map(str::to_owned),
        });
        self.elfs.push(ReportedElf { elf, start, end, name: name.map(str::to_owned) });
        Ok(is_new)
    }

    fn is_indexed(&self, name: &str) -> bool {
        self.indexed.contains(name)
    }

    fn flush(&mut self) -> Result<()> {
        self.events.push(Event::Flush);
        Ok(())
    }

    fn report_error(
        &mut self,
        name: Option<&str>,
        message: Option<&str>,
        cause: Option<DiscoveryError>,
    ) -> Result<()> {
        self.events.push(Event::Error {
            name: name.map(str::to_owned),
            message: message.map(str::to_owned),
            cause: cause.map(|e| e.to_string()),
        });
        if self.fatal_errors {
            Err(DiscoveryError::other("fatal error reported"))
        } else {
            Ok(())
        }
    }
}

/// A VMCOREINFO record for tests that do not care about its values.
pub fn test_vmcoreinfo(osrelease: &str) -> kernel_scope::vmcoreinfo::Vmcoreinfo {
    kernel_scope::vmcoreinfo::Vmcoreinfo {
        osrelease: osrelease.to_owned(),
        page_size: 4096,
        kaslr_offset: 0,
        swapper_pg_dir: 0xffff_ffff_81c0_a000,
        pgtable_l5_enabled: false,
    }
}
