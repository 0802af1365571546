//! Lookup in `modules.dep.bin`, the index written by `depmod`.
//!
//! `/lib/modules/<release>/modules.dep.bin` maps every installed
//! module name to its path (and dependency list, which is not needed
//! here). The file is a serialized radix tree: node pointers are
//! 32-bit big-endian words whose low 28 bits are a file offset and
//! whose top bits tag which parts the node carries (a prefix string,
//! a child table, a value list). The format has been stable since
//! 2009; parsing it directly beats pulling in libkmod for one lookup.

use crate::buffer::BinaryBuffer;
use crate::domain::errors::{DiscoveryError, Result};
use crate::target::SystemRoot;
use log::debug;
use memmap2::Mmap;
use std::fs::File;
use std::path::PathBuf;

const INDEX_MAGIC: u32 = 0xB007_F457;
const INDEX_VERSION: u32 = 0x0002_0001;

const INDEX_NODE_MASK: u32 = 0x0FFF_FFFF;
const INDEX_NODE_CHILDS: u32 = 0x2000_0000;
const INDEX_NODE_VALUES: u32 = 0x4000_0000;
const INDEX_NODE_PREFIX: u32 = 0x8000_0000;

/// A read-only mapping of `modules.dep.bin`. Unmapped on drop.
#[derive(Debug)]
pub struct DepmodIndex {
    map: Mmap,
    path: PathBuf,
}

impl DepmodIndex {
    /// Map `/lib/modules/<osrelease>/modules.dep.bin` and validate its
    /// magic and version.
    pub fn open(root: &SystemRoot, osrelease: &str) -> Result<Self> {
        let path = root.path(&format!("/lib/modules/{osrelease}/modules.dep.bin"));
        let label = path.display().to_string();
        let file = File::open(&path).map_err(|e| DiscoveryError::os("open", label.clone(), e))?;
        // Safety: mapped read-only; depmod replaces the file atomically
        // rather than rewriting it in place.
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| DiscoveryError::os("mmap", label.clone(), e))?;
        debug!("mapped depmod index {label} ({} bytes)", map.len());
        let index = DepmodIndex { map, path };
        index.validate()?;
        Ok(index)
    }

    fn buffer(&self) -> BinaryBuffer<'_> {
        // The index is written big-endian regardless of host.
        BinaryBuffer::with_label(&self.map, false, self.path.display().to_string())
    }

    fn validate(&self) -> Result<()> {
        let mut bb = self.buffer();
        let magic = bb.read_u32()?;
        if magic != INDEX_MAGIC {
            return Err(bb.error(format_args!("invalid magic {magic:#x}")));
        }
        let version = bb.read_u32()?;
        if version != INDEX_VERSION {
            return Err(bb.error(format_args!("unknown version {version:#x}")));
        }
        Ok(())
    }

    /// Path of the module `name` relative to `/lib/modules/<release>`,
    /// without the trailing dependency list. `Ok(None)` when the name
    /// is not in the index.
    pub fn find(&self, name: &str) -> Result<Option<&[u8]>> {
        let mut bb = self.buffer();
        let mut name = name.as_bytes();

        // The root node pointer sits right after the validated header.
        bb.seek(8)?;
        let mut node;
        loop {
            node = bb.read_u32()?;
            let offset = (node & INDEX_NODE_MASK) as usize;
            if offset > self.map.len() {
                return Err(bb.error("offset is out of bounds"));
            }
            bb.seek(offset)?;

            if node & INDEX_NODE_PREFIX != 0 {
                let prefix = bb.read_cstr()?;
                if !name.starts_with(prefix) {
                    return Ok(None);
                }
                name = &name[prefix.len()..];
            }

            if node & INDEX_NODE_CHILDS != 0 {
                let first = bb.read_u8()?;
                let last = bb.read_u8()?;
                if last < first {
                    return Err(bb.error("invalid child range"));
                }
                if let Some((&current, rest)) = name.split_first() {
                    if current < first || current > last {
                        return Ok(None);
                    }
                    bb.skip(4 * usize::from(current - first))?;
                    name = rest;
                    // The next loop iteration reads the child pointer.
                } else {
                    // Name exhausted: skip the child table and use this
                    // node's values, if any.
                    bb.skip(4 * (usize::from(last - first) + 1))?;
                    break;
                }
            } else if !name.is_empty() {
                return Ok(None);
            } else {
                break;
            }
        }

        if node & INDEX_NODE_VALUES == 0 {
            return Ok(None);
        }
        let value_count = bb.read_u32()?;
        if value_count == 0 {
            // Possibly malformed, but treated as absent.
            return Ok(None);
        }
        // Skip the first value's priority.
        bb.skip(4)?;
        let value = bb.read_cstr()?;
        let Some(colon) = value.iter().position(|&b| b == b':') else {
            return Err(bb.error("expected string containing ':'"));
        };
        Ok(Some(&value[..colon]))
    }
}
