//! ELF file identification, ownership, and section-address patching.
//!
//! An [`ElfResource`] owns an opened debug file: the descriptor, a
//! private copy-on-write mapping of its contents, and its
//! classification. Relocation writes live section addresses into the
//! mapped section headers so a downstream DWARF consumer sees kernel
//! load addresses; the file on disk is never modified.

use crate::buffer::BinaryBuffer;
use crate::domain::errors::{DiscoveryError, Result};
use crate::domain::types::ElfKind;
use memmap2::{MmapMut, MmapOptions};
use object::{Object, ObjectSection, ObjectSegment, SectionFlags};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

pub struct ElfResource {
    path: PathBuf,
    #[allow(dead_code)] // Held so the descriptor outlives the mapping handed downstream
    file: File,
    map: MmapMut,
    kind: ElfKind,
}

impl ElfResource {
    /// Open and classify an ELF file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let label = path.display().to_string();
        let file = File::open(&path).map_err(|e| DiscoveryError::os("open", label.clone(), e))?;
        // Safety: the mapping is private copy-on-write; concurrent
        // modification of the underlying file is not supported.
        let map = unsafe { MmapOptions::new().map_copy(&file) }
            .map_err(|e| DiscoveryError::os("mmap", label, e))?;
        let kind = classify(&map, &path)?;
        Ok(ElfResource { path, file, map, kind })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn kind(&self) -> ElfKind {
        self.kind
    }

    /// The mapped contents, including any section-address patches
    /// applied so far.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.map
    }

    fn parse(&self) -> Result<object::File<'_>> {
        object::File::parse(&*self.map).map_err(|e| parse_error(&self.path, &e))
    }

    /// The GNU build ID, if the file carries one.
    pub fn build_id(&self) -> Result<Option<&[u8]>> {
        self.parse()?.build_id().map_err(|e| parse_error(&self.path, &e))
    }

    /// `[start, end)` over the loadable segments, biased by `bias`
    /// (the KASLR offset for vmlinux).
    pub fn address_range(&self, bias: u64) -> Result<(u64, u64)> {
        let obj = self.parse()?;
        let mut start = u64::MAX;
        let mut end = 0;
        for segment in obj.segments() {
            let size = segment.size();
            if size == 0 {
                continue;
            }
            let address = segment.address();
            start = start.min(address);
            end = end.max(address.wrapping_add(size));
        }
        if start >= end {
            return Err(parse_error(&self.path, &"no loadable segments"));
        }
        Ok((start.wrapping_add(bias), end.wrapping_add(bias)))
    }

    /// Name to section-table index for allocatable sections. The first
    /// section with a given name wins; later duplicates are ignored.
    pub fn alloc_section_indexes(&self) -> Result<HashMap<String, usize>> {
        let obj = self.parse()?;
        let mut indexes = HashMap::new();
        for section in obj.sections() {
            let SectionFlags::Elf { sh_flags } = section.flags() else {
                continue;
            };
            if sh_flags & u64::from(object::elf::SHF_ALLOC) == 0 {
                continue;
            }
            let Ok(name) = section.name() else {
                continue;
            };
            indexes.entry(name.to_owned()).or_insert(section.index().0);
        }
        Ok(indexes)
    }

    /// Patch `sh_addr` of the section header at `index` in the mapped
    /// copy.
    pub fn set_section_address(&mut self, index: usize, address: u64) -> Result<()> {
        let ident = self
            .map
            .get(..6)
            .ok_or_else(|| parse_error(&self.path, &"file too small"))?;
        let class = ident[4];
        let little_endian = ident[5] == 1;

        let (position, width) = {
            let mut bb = BinaryBuffer::with_label(
                &self.map,
                little_endian,
                self.path.display().to_string(),
            );
            let (shoff, shentsize, shnum, field_offset, width) = match class {
                2 => {
                    bb.seek(0x28)?;
                    let shoff = bb.read_u64()? as usize;
                    bb.seek(0x3a)?;
                    let shentsize = bb.read_u16()? as usize;
                    let shnum = bb.read_u16()? as usize;
                    (shoff, shentsize, shnum, 16usize, 8usize)
                }
                1 => {
                    bb.seek(0x20)?;
                    let shoff = bb.read_u32()? as usize;
                    bb.seek(0x2e)?;
                    let shentsize = bb.read_u16()? as usize;
                    let shnum = bb.read_u16()? as usize;
                    (shoff, shentsize, shnum, 12usize, 4usize)
                }
                _ => return Err(parse_error(&self.path, &"unrecognized ELF class")),
            };
            if index >= shnum {
                return Err(parse_error(
                    &self.path,
                    &format_args!("section index {index} out of range"),
                ));
            }
            let position = index
                .checked_mul(shentsize)
                .and_then(|n| n.checked_add(shoff))
                .and_then(|n| n.checked_add(field_offset))
                .and_then(|n| (n.checked_add(width)? <= self.map.len()).then_some(n))
                .ok_or_else(|| parse_error(&self.path, &"section header out of bounds"))?;
            (position, width)
        };

        let mut scratch = [0u8; 8];
        let encoded: &[u8] = if width == 8 {
            scratch = if little_endian { address.to_le_bytes() } else { address.to_be_bytes() };
            &scratch
        } else {
            let narrow = u32::try_from(address).map_err(|_| {
                parse_error(&self.path, &format_args!("address {address:#x} does not fit"))
            })?;
            scratch[..4].copy_from_slice(&if little_endian {
                narrow.to_le_bytes()
            } else {
                narrow.to_be_bytes()
            });
            &scratch[..4]
        };
        self.map[position..position + width].copy_from_slice(encoded);
        Ok(())
    }
}

impl fmt::Debug for ElfResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElfResource")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("len", &self.map.len())
            .finish()
    }
}

fn parse_error(path: &Path, message: &dyn fmt::Display) -> DiscoveryError {
    DiscoveryError::other(format!("{}: {message}", path.display()))
}

/// Classify by section name: `.gnu.linkonce.this_module` marks a
/// kernel module; `.init.text` without the module marker is vmlinux.
fn classify(data: &[u8], path: &Path) -> Result<ElfKind> {
    let obj = object::File::parse(data).map_err(|e| parse_error(path, &e))?;
    let mut have_init_text = false;
    for section in obj.sections() {
        match section.name() {
            Ok(".gnu.linkonce.this_module") => return Ok(ElfKind::Module),
            Ok(".init.text") => have_init_text = true,
            _ => {}
        }
    }
    Ok(if have_init_text { ElfKind::Vmlinux } else { ElfKind::Other })
}
