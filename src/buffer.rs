//! Bounded, endian-aware cursor over an immutable byte range.
//!
//! Used by the depmod parser, the ELF note scanner, the VMCOREINFO
//! fallback, and the section-header patcher. Every out-of-bounds read
//! produces an error carrying the byte offset it happened at, prefixed
//! with the buffer's label (usually a file path).

use crate::domain::errors::{DiscoveryError, Result};
use std::fmt;

pub struct BinaryBuffer<'a> {
    data: &'a [u8],
    pos: usize,
    little_endian: bool,
    label: String,
}

impl<'a> BinaryBuffer<'a> {
    #[must_use]
    pub fn new(data: &'a [u8], little_endian: bool) -> Self {
        BinaryBuffer { data, pos: 0, little_endian, label: String::new() }
    }

    #[must_use]
    pub fn with_label(data: &'a [u8], little_endian: bool, label: impl Into<String>) -> Self {
        BinaryBuffer { data, pos: 0, little_endian, label: label.into() }
    }

    #[must_use]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Build an error tagged with the current byte offset.
    pub fn error(&self, message: impl fmt::Display) -> DiscoveryError {
        if self.label.is_empty() {
            DiscoveryError::other(format!("{:#x}: {message}", self.pos))
        } else {
            DiscoveryError::other(format!("{}: {:#x}: {message}", self.label, self.pos))
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(self.error(format_args!(
                "expected at least {n} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(self.error(format_args!("offset {pos:#x} is out of bounds")));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes: [u8; 2] = self.take(2)?.try_into().unwrap();
        Ok(if self.little_endian { u16::from_le_bytes(bytes) } else { u16::from_be_bytes(bytes) })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(if self.little_endian { u32::from_le_bytes(bytes) } else { u32::from_be_bytes(bytes) })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(if self.little_endian { u64::from_le_bytes(bytes) } else { u64::from_be_bytes(bytes) })
    }

    /// Read a NUL-terminated string, returning the bytes before the
    /// terminator and advancing past it.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let Some(nul) = rest.iter().position(|&b| b == 0) else {
            return Err(self.error("expected NUL-terminated string"));
        };
        self.pos += nul + 1;
        Ok(&rest[..nul])
    }
}
