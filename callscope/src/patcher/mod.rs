//! # Binary Patching
//!
//! Redirects the entry of a function to a thunk that reports the call to the
//! collector, runs the displaced prologue and continues in the original body.
//!
//! ## Layers
//!
//! - [`disasm`] - instruction-aligned prologue lengths and relocated copies
//! - [`emitter`] - architecture specific machine code ([`CodeEmitter`])
//! - [`allocator`] - executable blocks for thunks, near the patched code
//! - [`memory`] - temporary write access to code pages
//! - [`function_patch`] - one installed detour ([`FunctionPatch`])
//! - [`image_patch`] - per-module bookkeeping ([`ImagePatchManager`])

pub mod allocator;
pub mod disasm;
pub mod emitter;
pub mod function_patch;
pub mod image_patch;
pub mod memory;

pub use allocator::{ExecutableAllocator, ThunkHandle, DEFAULT_BLOCK_SIZE};
pub use emitter::{CodeEmitter, Interceptor, NativeEmitter, X64Emitter, X86Emitter};
pub use function_patch::FunctionPatch;
pub use image_patch::{
    ImagePatchManager, ModuleResolver, PatchActivity, PatchChangeResult, PatchManager, PatchState, PatchStatus,
};
