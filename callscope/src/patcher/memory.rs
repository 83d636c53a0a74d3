//! Scoped write access to code pages
//!
//! [`ScopedUnprotect`] makes a range of code writable for its lifetime and puts
//! the original page protections back on drop. It also holds the process-wide
//! code modification lock, so concurrent installs and removals never interleave
//! their protection changes.

// mprotect and raw code writes
#![allow(unsafe_code)]

use super::allocator::page_size;
use crate::domain::PatchError;
use crate::modules::memory_maps::{mappings_overlapping, MemoryRange};
use std::sync::{Mutex, MutexGuard, PoisonError};

static CODE_LOCK: Mutex<()> = Mutex::new(());

pub struct ScopedUnprotect {
    /// Original protections, page-aligned
    regions: Vec<(usize, usize, i32)>,
    _lock: MutexGuard<'static, ()>,
}

impl ScopedUnprotect {
    /// Make `[address, address + len)` readable, writable and executable
    ///
    /// # Errors
    /// [`PatchError::ProtectionFailed`] if the range is not mapped or
    /// `mprotect` refuses.
    pub fn new(address: usize, len: usize) -> Result<Self, PatchError> {
        let lock = CODE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let page = page_size();
        let start = address & !(page - 1);
        let end = (address + len.max(1)).next_multiple_of(page);
        let failed = |reason: String| PatchError::ProtectionFailed { address, reason };

        let range = MemoryRange { start: start as u64, end: end as u64 };
        let mappings = mappings_overlapping(range).map_err(|e| failed(format!("{e:#}")))?;
        let covered: u64 = mappings
            .iter()
            .map(|m| m.range.end.min(range.end) - m.range.start.max(range.start))
            .sum();
        if covered != range.end - range.start {
            return Err(failed("range is not fully mapped".into()));
        }

        let regions = mappings
            .iter()
            .map(|m| {
                let from = m.range.start.max(range.start) as usize;
                let to = m.range.end.min(range.end) as usize;
                (from, to - from, m.protection())
            })
            .collect();

        // SAFETY: page-aligned range that /proc/self/maps reports as mapped
        let rc = unsafe {
            libc::mprotect(
                start as *mut libc::c_void,
                end - start,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(failed(std::io::Error::last_os_error().to_string()));
        }

        Ok(Self { regions, _lock: lock })
    }
}

impl Drop for ScopedUnprotect {
    fn drop(&mut self) {
        for &(start, len, prot) in &self.regions {
            // SAFETY: restores a protection this process had on a mapped range
            if unsafe { libc::mprotect(start as *mut libc::c_void, len, prot) } != 0 {
                log::warn!(
                    "failed to restore protection {prot:#x} at {start:#x}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

/// Make freshly written code visible to instruction fetch
///
/// x86 keeps instruction and data caches coherent; a full fence orders the
/// stores before any subsequent execution on this thread.
pub fn flush_instruction_cache(_address: usize, _len: usize) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Overwrite code at `address` with `code`, returning the replaced bytes
///
/// # Errors
/// Propagates [`ScopedUnprotect::new`] failures; nothing is written then.
///
/// # Safety
/// `address` must point at code no thread is executing inside the replaced
/// range, and `code` must leave it a valid instruction stream.
pub unsafe fn replace_code(address: usize, code: &[u8]) -> Result<Vec<u8>, PatchError> {
    let _unprotect = ScopedUnprotect::new(address, code.len())?;
    let target = address as *mut u8;
    // SAFETY: the range is mapped and writable for the guard's lifetime
    let previous = unsafe { std::slice::from_raw_parts(target, code.len()) }.to_vec();
    unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), target, code.len()) };
    flush_instruction_cache(address, code.len());
    Ok(previous)
}
