//! Executable memory for thunks
//!
//! Thunks are carved out of RWX blocks reserved close to the code being
//! patched, so a 5-byte `jmp rel32` can reach them. A block is unmapped when
//! the last [`ThunkHandle`] pointing into it goes away.

// mmap/munmap and raw writes into the mapped blocks
#![allow(unsafe_code)]

use crate::domain::PatchError;
use std::sync::{Arc, Mutex, PoisonError};

/// Default block size: plenty of room for a few dozen thunks
pub const DEFAULT_BLOCK_SIZE: usize = 0x10000;

const THUNK_ALIGNMENT: usize = 16;
/// Reach of a rel32 displacement, with some headroom for the block itself
const NEAR_RANGE: usize = 0x7000_0000;
const HINT_STEP: usize = 0x0400_0000;

struct Block {
    base: usize,
    size: usize,
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: (base, size) is exactly what mmap returned
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.size) };
        if rc != 0 {
            log::warn!("munmap of thunk block {:#x} failed: {}", self.base, std::io::Error::last_os_error());
        }
    }
}

/// A range of executable memory, keeping its block mapped
pub struct ThunkHandle {
    block: Arc<Block>,
    offset: usize,
    len: usize,
}

impl ThunkHandle {
    #[must_use]
    pub fn address(&self) -> usize {
        self.block.base + self.offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `code` to the start of the range
    ///
    /// # Panics
    /// If `code` is longer than the range.
    pub fn write(&self, code: &[u8]) {
        assert!(code.len() <= self.len, "thunk overflow: {} > {}", code.len(), self.len);
        // SAFETY: the range is mapped RWX and owned by this handle alone
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.address() as *mut u8, code.len());
        }
    }

    /// Current contents of the range
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: mapped and readable for as long as `self` holds the block
        unsafe { std::slice::from_raw_parts(self.address() as *const u8, self.len) }
    }
}

impl std::fmt::Debug for ThunkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ThunkHandle({:#x}+{})", self.address(), self.len)
    }
}

struct Cursor {
    block: Arc<Block>,
    used: usize,
}

/// Bump allocator over executable blocks near a reference address
pub struct ExecutableAllocator {
    reference: usize,
    block_size: usize,
    current: Mutex<Option<Cursor>>,
}

impl ExecutableAllocator {
    #[must_use]
    pub fn new(reference: usize, block_size: usize) -> Self {
        let block_size = block_size.max(1).next_multiple_of(page_size());
        Self { reference, block_size, current: Mutex::new(None) }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Reserve `size` bytes of executable memory
    ///
    /// # Errors
    /// - [`PatchError::AllocationTooLarge`] if `size` exceeds the block size
    /// - [`PatchError::ReservationFailed`] if no new block can be mapped
    pub fn allocate(&self, size: usize) -> Result<ThunkHandle, PatchError> {
        if size > self.block_size {
            return Err(PatchError::AllocationTooLarge { requested: size, block_size: self.block_size });
        }

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let fits = current.as_ref().is_some_and(|c| c.used + size <= c.block.size);
        if !fits {
            let block = Arc::new(self.reserve_block()?);
            log::debug!("reserved thunk block {:#x} ({} bytes)", block.base, block.size);
            *current = Some(Cursor { block, used: 0 });
        }

        let cursor = current.as_mut().ok_or_else(|| PatchError::ReservationFailed("no block".into()))?;
        let offset = cursor.used;
        cursor.used = (offset + size).next_multiple_of(THUNK_ALIGNMENT).min(cursor.block.size);
        Ok(ThunkHandle { block: Arc::clone(&cursor.block), offset, len: size })
    }

    fn reserve_block(&self) -> Result<Block, PatchError> {
        let page = page_size();
        let base = self.reference & !(page - 1);

        // Walk outwards from the reference, below first, then above.
        let mut distance = HINT_STEP;
        while distance < NEAR_RANGE {
            for hint in [base.checked_sub(distance), base.checked_add(distance)].into_iter().flatten() {
                if let Some(block) = map_block(hint, self.block_size) {
                    if block.base.abs_diff(self.reference) < NEAR_RANGE {
                        return Ok(block);
                    }
                }
            }
            distance += HINT_STEP;
        }

        log::debug!("no block within rel32 reach of {:#x}; using any address", self.reference);
        map_block(0, self.block_size).ok_or_else(|| {
            PatchError::ReservationFailed(std::io::Error::last_os_error().to_string())
        })
    }
}

fn map_block(hint: usize, size: usize) -> Option<Block> {
    // SAFETY: anonymous private mapping; the hint is advisory (no MAP_FIXED)
    let ptr = unsafe {
        libc::mmap(
            hint as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    (ptr != libc::MAP_FAILED).then(|| Block { base: ptr as usize, size })
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|s| s.is_power_of_two()).unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> usize {
        reference as usize
    }

    #[test]
    fn test_block_size_rounds_to_pages() {
        let allocator = ExecutableAllocator::new(reference(), 100);
        assert_eq!(allocator.block_size(), page_size());
    }

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let allocator = ExecutableAllocator::new(reference(), DEFAULT_BLOCK_SIZE);
        let a = allocator.allocate(10).unwrap();
        let b = allocator.allocate(33).unwrap();
        assert_eq!(b.address() % THUNK_ALIGNMENT, 0);
        assert!(b.address() >= a.address() + a.len());
    }

    #[test]
    fn test_too_large_allocation_fails() {
        let allocator = ExecutableAllocator::new(reference(), 4096);
        let size = allocator.block_size() + 1;
        assert_eq!(
            allocator.allocate(size).unwrap_err(),
            PatchError::AllocationTooLarge { requested: size, block_size: allocator.block_size() }
        );
    }

    #[test]
    fn test_full_block_moves_to_next() {
        let allocator = ExecutableAllocator::new(reference(), 4096);
        let whole = allocator.allocate(allocator.block_size()).unwrap();
        let next = allocator.allocate(16).unwrap();
        assert_ne!(whole.address(), next.address());
    }

    #[test]
    fn test_handle_outlives_allocator() {
        let handle = {
            let allocator = ExecutableAllocator::new(reference(), DEFAULT_BLOCK_SIZE);
            allocator.allocate(4).unwrap()
        };
        handle.write(&[0xC3, 0x90, 0x90, 0xC3]);
        assert_eq!(handle.bytes(), [0xC3, 0x90, 0x90, 0xC3]);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_block_is_within_rel32_reach() {
        let allocator = ExecutableAllocator::new(reference(), DEFAULT_BLOCK_SIZE);
        let handle = allocator.allocate(64).unwrap();
        assert!(handle.address().abs_diff(reference()) < 0x8000_0000);
    }
}
