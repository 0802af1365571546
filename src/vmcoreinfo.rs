//! VMCOREINFO: the kernel's self-describing metadata note.
//!
//! The note descriptor is newline-separated `KEY=value` text carrying
//! the kernel release, page size, KASLR offset, and key symbol
//! addresses. Cores and `/proc/kcore` (since v4.19) embed it as an ELF
//! note; older live kernels only export its physical address in sysfs,
//! so there is a fallback that pulls the note out of physical memory.

use crate::buffer::BinaryBuffer;
use crate::domain::errors::{DiscoveryError, Result};
use crate::target::{KernelData, SystemRoot};
use log::debug;
use std::fs;
use std::num::IntErrorKind;

/// Upper bound on the OSRELEASE value, including its terminator.
const OSRELEASE_MAX: usize = 128;

/// Parsed VMCOREINFO. Constructed once per program and immutable
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vmcoreinfo {
    pub osrelease: String,
    pub page_size: u64,
    /// Runtime displacement of the kernel image (KASLR). Optional in
    /// the note; zero when absent.
    pub kaslr_offset: u64,
    pub swapper_pg_dir: u64,
    pub pgtable_l5_enabled: bool,
}

impl Vmcoreinfo {
    /// Parse a VMCOREINFO note descriptor.
    ///
    /// Unknown keys are skipped; a trailing line without a newline is
    /// ignored. `OSRELEASE`, `PAGESIZE`, and `SYMBOL(swapper_pg_dir)`
    /// are required.
    pub fn parse(desc: &[u8]) -> Result<Self> {
        let mut osrelease = String::new();
        let mut page_size = 0;
        let mut kaslr_offset = 0;
        let mut swapper_pg_dir = 0;
        let mut pgtable_l5_enabled = false;

        let mut rest = desc;
        while let Some(newline) = rest.iter().position(|&b| b == b'\n') {
            let line = &rest[..newline];
            rest = &rest[newline + 1..];

            if let Some(value) = strip_prefix(line, "OSRELEASE=") {
                if value.len() >= OSRELEASE_MAX {
                    return Err(DiscoveryError::other("OSRELEASE in VMCOREINFO is too long"));
                }
                osrelease = String::from_utf8_lossy(value).into_owned();
            } else if let Some(value) = strip_prefix(line, "PAGESIZE=") {
                page_size = line_to_u64(value, 0)?;
            } else if let Some(value) = strip_prefix(line, "KERNELOFFSET=") {
                kaslr_offset = line_to_u64(value, 16)?;
            } else if let Some(value) = strip_prefix(line, "SYMBOL(swapper_pg_dir)=") {
                swapper_pg_dir = line_to_u64(value, 16)?;
            } else if let Some(value) = strip_prefix(line, "NUMBER(pgtable_l5_enabled)=") {
                pgtable_l5_enabled = line_to_u64(value, 0)? != 0;
            }
        }

        if osrelease.is_empty() {
            return Err(DiscoveryError::other("VMCOREINFO does not contain valid OSRELEASE"));
        }
        if page_size == 0 {
            return Err(DiscoveryError::other("VMCOREINFO does not contain valid PAGESIZE"));
        }
        if swapper_pg_dir == 0 {
            return Err(DiscoveryError::other(
                "VMCOREINFO does not contain valid swapper_pg_dir",
            ));
        }
        Ok(Vmcoreinfo { osrelease, page_size, kaslr_offset, swapper_pg_dir, pgtable_l5_enabled })
    }
}

fn strip_prefix<'a>(line: &'a [u8], prefix: &str) -> Option<&'a [u8]> {
    line.strip_prefix(prefix.as_bytes())
}

/// `strtoull`-style conversion. Base 0 auto-detects `0x` (hex) and a
/// leading `0` (octal); the entire value must be consumed.
fn line_to_u64(value: &[u8], base: u32) -> Result<u64> {
    let invalid = || DiscoveryError::Overflow("number in VMCOREINFO is invalid".into());
    let s = std::str::from_utf8(value).map_err(|_| invalid())?;
    let (digits, radix) = match base {
        0 => {
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                (hex, 16)
            } else if s.len() > 1 && s.starts_with('0') {
                (&s[1..], 8)
            } else {
                (s, 10)
            }
        }
        16 => (s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s), 16),
        _ => (s, base),
    };
    if digits.is_empty() {
        return Err(invalid());
    }
    u64::from_str_radix(digits, radix).map_err(|e| {
        if matches!(e.kind(), IntErrorKind::PosOverflow) {
            DiscoveryError::Overflow("number in VMCOREINFO is too large".into())
        } else {
            invalid()
        }
    })
}

/// Recover VMCOREINFO on a live kernel that predates the note in
/// `/proc/kcore` (v4.19): `/sys/kernel/vmcoreinfo` holds the physical
/// address and size of the note, which is then read out of physical
/// memory and parsed.
pub fn read_vmcoreinfo_fallback<K: KernelData>(
    kernel: &K,
    root: &SystemRoot,
) -> Result<Vmcoreinfo> {
    let path = root.path("/sys/kernel/vmcoreinfo");
    let label = path.display().to_string();
    let text =
        fs::read_to_string(&path).map_err(|e| DiscoveryError::os("open", label.clone(), e))?;

    let mut fields = text.split_ascii_whitespace();
    let (Some(addr_text), Some(size_text)) = (fields.next(), fields.next()) else {
        return Err(DiscoveryError::other("could not parse /sys/kernel/vmcoreinfo"));
    };
    let parse_hex = |s: &str| {
        u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|_| DiscoveryError::other("could not parse /sys/kernel/vmcoreinfo"))
    };
    let address = parse_hex(addr_text)?;
    let size = parse_hex(size_text)?;
    debug!("reading VMCOREINFO note from physical memory at {address:#x} ({size} bytes)");

    let mut buf = vec![0u8; size as usize];
    kernel.read_memory(address, &mut buf, true)?;

    // The first 12 bytes are the note header (identical in ELF32 and
    // ELF64); the name "VMCOREINFO\0" is padded to 4 bytes, so the
    // descriptor starts at byte 24.
    let invalid = || DiscoveryError::other("VMCOREINFO is invalid");
    if buf.len() < 24 {
        return Err(invalid());
    }
    let mut bb = BinaryBuffer::with_label(&buf, kernel.is_little_endian(), label);
    let namesz = bb.read_u32()?;
    let descsz = bb.read_u32()? as usize;
    let _ntype = bb.read_u32()?;
    let name = bb.read_bytes(12)?;
    if namesz != 11 || &name[..10] != b"VMCOREINFO" || descsz > buf.len() - 24 {
        return Err(invalid());
    }
    Vmcoreinfo::parse(&buf[24..24 + descsz])
}
