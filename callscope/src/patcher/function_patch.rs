//! Detour of a single function
//!
//! A [`FunctionPatch`] owns everything one instrumented function needs: the
//! thunk (enter-hook call, relocated prologue, jump back) and the original
//! prologue bytes. Dropping it puts the bytes back.

// Reads the target's code through a raw pointer
#![allow(unsafe_code)]

use super::allocator::{ExecutableAllocator, ThunkHandle};
use super::disasm::{calculate_fragment_length, move_function, validate_displaced_references};
use super::emitter::{CodeEmitter, Interceptor};
use super::memory::replace_code;
use crate::domain::PatchError;

/// Longest x86 instruction; the relocated prologue can overshoot the
/// redirect by at most this much minus one.
const MAX_INSTRUCTION_LEN: usize = 15;

pub struct FunctionPatch {
    target: usize,
    backup: Vec<u8>,
    fragment_len: usize,
    // Must outlive the redirect; dropped after `backup` is written back.
    thunk: ThunkHandle,
}

impl FunctionPatch {
    /// Install a detour at `target`
    ///
    /// The callee id reported to the enter hook is `target` itself.
    ///
    /// # Errors
    /// - [`PatchError::FunctionTooShort`] if the redirect jump does not fit
    /// - errors from fragment decoding and relocation, see [`super::disasm`]
    /// - allocation and protection errors
    ///
    /// Nothing is modified in the target on error.
    ///
    /// # Safety
    /// `[target, target + function_size)` must be the readable code of one
    /// function, and no other thread may be executing its first bytes while
    /// they are overwritten.
    pub unsafe fn new(
        target: usize,
        function_size: usize,
        interceptor: &Interceptor,
        exit_stub: usize,
        allocator: &ExecutableAllocator,
        emitter: &dyn CodeEmitter,
    ) -> Result<Self, PatchError> {
        let shortest = emitter.redirect_len(target, target);
        if function_size < shortest {
            return Err(PatchError::FunctionTooShort { size: function_size, required: shortest });
        }

        let mut code = Vec::new();
        emitter.emit_enter_call(&mut code, interceptor, target, exit_stub);
        let enter_len = code.len();

        let thunk = allocator
            .allocate(enter_len + emitter.max_jump_len() + MAX_INSTRUCTION_LEN + emitter.max_jump_len())?;
        let footprint = emitter.redirect_len(target, thunk.address());
        if function_size < footprint {
            return Err(PatchError::FunctionTooShort { size: function_size, required: footprint });
        }

        // SAFETY: caller guarantees the function's code is readable
        let function = unsafe { std::slice::from_raw_parts(target as *const u8, function_size) };
        let bitness = emitter.bitness();
        let fragment_len = calculate_fragment_length(function, target as u64, bitness, footprint)?;
        validate_displaced_references(function, target as u64, fragment_len, bitness)?;

        let moved = move_function((thunk.address() + enter_len) as u64, target as u64, &function[..fragment_len], bitness)?;
        code.extend_from_slice(&moved);
        let resume_at = thunk.address() + code.len();
        emitter.emit_jump(&mut code, resume_at, target + fragment_len);
        thunk.write(&code);

        let mut redirect = Vec::with_capacity(footprint);
        emitter.emit_jump(&mut redirect, target, thunk.address());
        // SAFETY: caller guarantees nobody executes the prologue right now
        let backup = unsafe { replace_code(target, &redirect)? };

        log::debug!("patched {target:#x}: {fragment_len} bytes moved to thunk {:#x}", thunk.address());
        Ok(Self { target, backup, fragment_len, thunk })
    }

    #[must_use]
    pub fn target(&self) -> usize {
        self.target
    }

    #[must_use]
    pub fn thunk_address(&self) -> usize {
        self.thunk.address()
    }

    /// Bytes of the original prologue executed from the thunk
    #[must_use]
    pub fn fragment_len(&self) -> usize {
        self.fragment_len
    }
}

impl Drop for FunctionPatch {
    fn drop(&mut self) {
        // SAFETY: writes back exactly the bytes this patch replaced
        match unsafe { replace_code(self.target, &self.backup) } {
            Ok(_) => log::debug!("restored {:#x}", self.target),
            Err(e) => log::warn!("failed to restore {:#x}: {e}", self.target),
        }
    }
}

impl std::fmt::Debug for FunctionPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionPatch")
            .field("target", &format_args!("{:#x}", self.target))
            .field("fragment_len", &self.fragment_len)
            .field("thunk", &self.thunk)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patcher::allocator::DEFAULT_BLOCK_SIZE;
    use crate::patcher::emitter::X64Emitter;

    const INTERCEPTOR: Interceptor = Interceptor { context: 0x1111, on_enter: 0x2222, on_exit: 0x3333 };

    fn code_page(code: &[u8]) -> ThunkHandle {
        // Lives in executable memory so replace_code sees a real mapping.
        let handle = ExecutableAllocator::new(0, DEFAULT_BLOCK_SIZE).allocate(64).unwrap();
        handle.write(code);
        handle
    }

    #[test]
    fn test_too_short_function_is_rejected() {
        let target = code_page(&[0x31, 0xC0, 0xC3]); // xor eax, eax; ret
        let allocator = ExecutableAllocator::new(target.address(), DEFAULT_BLOCK_SIZE);
        let result = unsafe { FunctionPatch::new(target.address(), 3, &INTERCEPTOR, 0, &allocator, &X64Emitter) };
        assert!(matches!(result, Err(PatchError::FunctionTooShort { size: 3, required: 5 })));
        assert_eq!(&target.bytes()[..3], [0x31, 0xC0, 0xC3]);
    }

    #[test]
    fn test_prologue_with_escaping_short_branch_is_rejected() {
        // test rdi, rdi; je +0x10; ...
        let code = [0x48, 0x85, 0xFF, 0x74, 0x10, 0x90, 0x90, 0x90, 0x90, 0x90, 0xC3];
        let target = code_page(&code);
        let allocator = ExecutableAllocator::new(target.address(), DEFAULT_BLOCK_SIZE);
        let result =
            unsafe { FunctionPatch::new(target.address(), code.len(), &INTERCEPTOR, 0, &allocator, &X64Emitter) };
        assert!(matches!(result, Err(PatchError::InconsistentFunctionRange(_))));
        assert_eq!(&target.bytes()[..code.len()], code);
    }

    #[test]
    fn test_install_writes_redirect_and_drop_restores() {
        // push rbp; mov rbp, rsp; mov eax, 7; pop rbp; ret
        let code = [0x55, 0x48, 0x89, 0xE5, 0xB8, 0x07, 0x00, 0x00, 0x00, 0x5D, 0xC3];
        let target = code_page(&code);
        let allocator = ExecutableAllocator::new(target.address(), DEFAULT_BLOCK_SIZE);

        let patch =
            unsafe { FunctionPatch::new(target.address(), code.len(), &INTERCEPTOR, 0x4444, &allocator, &X64Emitter) }
                .unwrap();
        assert_eq!(patch.target(), target.address());
        assert_eq!(patch.fragment_len(), 9);

        let mut expected = Vec::new();
        X64Emitter.emit_jump(&mut expected, target.address(), patch.thunk_address());
        assert_eq!(&target.bytes()[..expected.len()], expected);

        let mut enter = Vec::new();
        X64Emitter.emit_enter_call(&mut enter, &INTERCEPTOR, target.address(), 0x4444);
        let thunk = unsafe { std::slice::from_raw_parts(patch.thunk_address() as *const u8, enter.len() + 9) };
        assert_eq!(&thunk[..enter.len()], enter);
        assert_eq!(&thunk[enter.len()..], &code[..9]);

        drop(patch);
        assert_eq!(&target.bytes()[..code.len()], code);
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    mod native {
        use super::*;
        use crate::collector::{on_enter, on_exit, BufferingPolicy, CallsAcceptor, CallsCollector, ThreadMonitor};
        use crate::domain::ThreadId;
        use callscope_common::CallRecord;
        use std::sync::Arc;

        /// `n * n + 1` with a frame-pointer prologue and no branches:
        /// push rbp; mov rbp, rsp; mov rax, rdi; imul rax, rdi; add rax, 1; pop rbp; ret
        const SQUARE_PLUS_ONE: [u8; 17] = [
            0x55, 0x48, 0x89, 0xE5, 0x48, 0x89, 0xF8, 0x48, 0x0F, 0xAF, 0xC7, 0x48, 0x83, 0xC0, 0x01, 0x5D, 0xC3,
        ];

        #[derive(Default)]
        struct Recorded(Vec<CallRecord>);

        impl CallsAcceptor for Recorded {
            fn accept_calls(&mut self, _: ThreadId, calls: &[CallRecord]) {
                self.0.extend_from_slice(calls);
            }
        }

        #[test]
        fn test_patched_function_still_works_and_reports_calls() {
            let collector = Arc::new(CallsCollector::new(Arc::new(ThreadMonitor::new()), BufferingPolicy::default()));
            let interceptor = Interceptor {
                context: Arc::as_ptr(&collector) as usize,
                on_enter: on_enter as usize,
                on_exit: on_exit as usize,
            };

            let routine = code_page(&SQUARE_PLUS_ONE);
            let target = routine.address();
            let allocator = ExecutableAllocator::new(target, DEFAULT_BLOCK_SIZE);
            let mut stub_code = Vec::new();
            X64Emitter.emit_exit_stub(&mut stub_code, &interceptor);
            let exit_stub = allocator.allocate(stub_code.len()).unwrap();
            exit_stub.write(&stub_code);

            // SAFETY: the page holds a complete System V function
            let call: extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute::<usize, _>(target) };
            assert_eq!(call(2), 5);

            let patch = unsafe {
                FunctionPatch::new(
                    target,
                    SQUARE_PLUS_ONE.len(),
                    &interceptor,
                    exit_stub.address(),
                    &allocator,
                    &X64Emitter,
                )
            }
            .unwrap();
            assert_ne!(&routine.bytes()[..SQUARE_PLUS_ONE.len()], SQUARE_PLUS_ONE);
            assert_eq!(call(4), 17);
            assert_eq!(call(10), 101);
            drop(patch);
            assert_eq!(call(3), 10);
            assert_eq!(&routine.bytes()[..SQUARE_PLUS_ONE.len()], SQUARE_PLUS_ONE);

            let mut recorded = Recorded::default();
            collector.read_collected(&mut recorded);
            let callees: Vec<usize> = recorded.0.iter().map(|r| r.callee).collect();
            assert_eq!(callees, [target, 0, target, 0]);
            assert!(recorded.0.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }
    }
}
