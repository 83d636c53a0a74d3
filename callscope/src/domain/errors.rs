//! Structured error types for callscope
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{ModuleId, ThreadId};
use thiserror::Error;

/// Reasons a single function install or removal can fail
///
/// These end up inside per-function results rather than aborting a bulk
/// apply, so the enum is `Clone` and comparable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("inconsistent function range: {0}")]
    InconsistentFunctionRange(String),

    #[error("function body jumps into the patched prologue at offset {0:#x}")]
    OffsetProhibited(u64),

    #[error("function is {size} bytes, at least {required} are needed for the detour")]
    FunctionTooShort { size: usize, required: usize },

    #[error("no function at rva {0:#x}")]
    UnknownFunction(u64),

    #[error("no patch installed at rva {0:#x}")]
    NotFound(u64),

    #[error("failed to change protection at {address:#x}: {reason}")]
    ProtectionFailed { address: usize, reason: String },

    #[error("allocation of {requested} bytes exceeds the {block_size}-byte block")]
    AllocationTooLarge { requested: usize, block_size: usize },

    #[error("failed to reserve executable memory: {0}")]
    ReservationFailed(String),

    #[error("module {0} is not loaded")]
    ModuleNotLoaded(ModuleId),

    #[error("relocated displacement to {target:#x} does not fit in 32 bits")]
    RelocationOutOfRange { target: u64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectorError {
    #[error("invalid buffering policy: {0}")]
    InvalidPolicy(String),

    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Collector(#[from] CollectorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_error_display() {
        let err = PatchError::FunctionTooShort { size: 3, required: 5 };
        assert_eq!(err.to_string(), "function is 3 bytes, at least 5 are needed for the detour");

        let err = PatchError::ModuleNotLoaded(ModuleId(4));
        assert_eq!(err.to_string(), "module M4 is not loaded");
    }

    #[test]
    fn test_bridge_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: BridgeError = io.into();
        assert!(err.to_string().contains("pipe closed"));
    }
}
