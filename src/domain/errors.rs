//! Structured error types for kernel-scope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Iterator exhaustion and lookup misses that are pure control flow
//! ("no more modules", "name not in the depmod index") are expressed as
//! `Option` return values, not error variants, so they can never escape
//! their caller by accident.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// A syscall-level failure, with the path it happened on.
    #[error("{syscall}: {path}: {source}")]
    Os {
        syscall: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Numeric parse overflow or a malformed integer.
    #[error("{0}")]
    Overflow(String),

    /// A named type, member, or variable is absent from the debug info.
    ///
    /// Kernel struct layouts changed across releases; iterators treat a
    /// lookup miss on the first probe of a versioned field as the signal
    /// to try the older layout.
    #[error("could not find {what} '{name}'")]
    Lookup { what: &'static str, name: String },

    /// A kernel memory read failed.
    #[error("could not read memory at {address:#x}")]
    Fault { address: u64 },

    /// Malformed metadata: VMCOREINFO, `/proc/modules`, the depmod
    /// index, an ELF note, or section data.
    #[error("{0}")]
    Other(String),
}

impl DiscoveryError {
    pub fn os(syscall: &'static str, path: impl Into<String>, source: std::io::Error) -> Self {
        DiscoveryError::Os { syscall, path: path.into(), source }
    }

    pub fn lookup(what: &'static str, name: impl Into<String>) -> Self {
        DiscoveryError::Lookup { what, name: name.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        DiscoveryError::Other(message.into())
    }

    /// True for lookup misses, which drive kernel-version fallbacks.
    #[must_use]
    pub fn is_lookup(&self) -> bool {
        matches!(self, DiscoveryError::Lookup { .. })
    }
}
