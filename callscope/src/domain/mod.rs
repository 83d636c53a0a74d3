//! Domain model for callscope
//!
//! Identifier newtypes and the error enums shared by the patcher, collector
//! and bridge.

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{ModuleId, PatchId, Rva, ThreadId};

pub use errors::{BridgeError, CollectorError, PatchError};
