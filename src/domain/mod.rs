//! Core domain types shared across the discovery pipeline.

pub mod errors;
pub mod types;

pub use errors::{DiscoveryError, Result};
pub use types::ElfKind;
