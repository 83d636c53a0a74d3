//! # Shared Data Structures (hot path ↔ analysis ↔ frontend)
//!
//! Defines the record layout written by the instrumentation hooks and the
//! constants both sides of the statistics wire agree on. All record types use
//! `#[repr(C)]` so the layout written by the thunks' hooks is stable.
//!
//! ## Key Types
//!
//! - [`CallRecord`] - One enter or exit event, as buffered per thread
//!
//! ## Conventions
//!
//! A record whose `callee` is `0` is an **exit** event. The analyzer pops its
//! shadow stack on these; every other value is the address of the function
//! being entered.

#![no_std]

// ============================================================================
// Buffering Constants
// ============================================================================

/// Number of call records held by one thread trace buffer.
///
/// Buffers are handed from the instrumented thread to the reader as a whole,
/// so this is also the granularity of the producer/reader hand-off.
pub const BUFFER_SIZE: usize = 384;

// ============================================================================
// Wire Versions
// ============================================================================

/// Version of the message envelope sent to the frontend.
pub const PROTOCOL_VERSION: u32 = 1;

/// Schema version attached to every serialized call-graph node.
///
/// Bump when fields are added so older consumers can skip what they don't know.
pub const CALL_GRAPH_NODE_VERSION: u32 = 1;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Enter/exit event recorded by the collector hooks
///
/// **Memory Layout**: `#[repr(C)]`, 16 bytes on 64-bit targets.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct CallRecord {
    /// Address of the entered function, or `0` for a return.
    pub callee: usize,

    /// Tick counter value when the event was recorded.
    pub timestamp: u64,
}

impl CallRecord {
    /// Entry into `callee` at `timestamp`.
    #[must_use]
    pub const fn enter(callee: usize, timestamp: u64) -> Self {
        Self { callee, timestamp }
    }

    /// Return from the innermost active function at `timestamp`.
    #[must_use]
    pub const fn exit(timestamp: u64) -> Self {
        Self { callee: 0, timestamp }
    }

    /// Whether this record is a return event.
    #[must_use]
    pub const fn is_exit(&self) -> bool {
        self.callee == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_sentinel() {
        assert!(CallRecord::exit(10).is_exit());
        assert!(!CallRecord::enter(0x1000, 10).is_exit());
        assert_eq!(CallRecord::default(), CallRecord::exit(0));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_record_layout() {
        assert_eq!(core::mem::size_of::<CallRecord>(), 16);
    }
}
