//! # kernel-scope - Linux kernel debug-info discovery
//!
//! kernel-scope locates the debug files that describe a Linux kernel,
//! whether the target is the running kernel or a core dump. It parses
//! the kernel's VMCOREINFO note, enumerates loaded modules together
//! with their load addresses and section layout, matches modules to
//! on-disk ELF files by GNU build ID, patches section headers with
//! live addresses, and hands the results to a downstream DWARF
//! indexer.
//!
//! ## Architecture Overview
//!
//! ```text
//! user paths ──► identify (vmlinux / module / other)
//!                     │
//!                     ▼
//!        report vmlinux (supplied, or searched on disk)
//!                     │
//!                     ▼
//!        loaded-module iterator ──► live:  /proc/modules + /sys
//!                     │             crash: in-kernel `modules` list
//!                     ▼
//!        match by GNU build ID ──► miss: depmod index fallback
//!                     │
//!                     ▼
//!        section relocation ──► report to the DWARF indexer
//! ```
//!
//! ## Module Structure
//!
//! - [`discovery`]: the pipeline above, plus the [`discovery::DebugIndexer`]
//!   trait the downstream consumer implements
//! - [`modules`]: loaded-module, build-ID, and section-address
//!   iterators with live and crash back-ends
//! - [`vmcoreinfo`]: VMCOREINFO parsing and the sysfs/physical-memory
//!   fallback for old live kernels
//! - [`depmod`]: lookup in the `modules.dep.bin` radix tree
//! - [`elf`]: ELF classification, ownership, and section-address
//!   patching
//! - [`notes`]: raw ELF note-stream scanning
//! - [`buffer`]: the bounded endian-aware cursor shared by the binary
//!   parsers
//! - [`target`]: seams to the inspected kernel (memory, type layouts)
//!   and the host filesystem
//! - [`domain`]: error and classification types
//!
//! The pipeline is single-threaded and non-suspending; all mappings,
//! tables, and handles are scoped to one
//! [`discovery::report_debug_info`] call.

pub mod buffer;
pub mod depmod;
pub mod discovery;
pub mod domain;
pub mod elf;
pub mod modules;
pub mod notes;
pub mod target;
pub mod vmcoreinfo;
