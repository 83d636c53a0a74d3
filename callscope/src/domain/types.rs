//! Newtype identifiers used across the profiler
//!
//! Each id is a plain `u32` underneath; the wrappers keep thread, module and
//! patch ids from being mixed up in signatures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Profiler-assigned thread id (dense, starting at 0)
///
/// Not the OS thread id; see [`crate::collector::ThreadInfo::native_id`] for that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Identifier of a loaded module (executable or shared object)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Per-manager patch identifier, assigned incrementally from 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchId(pub u32);

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Relative virtual address of a function inside its module
pub type Rva = u64;
