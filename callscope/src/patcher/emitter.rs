//! Machine code for thunks, exit stubs and redirect jumps
//!
//! Everything architecture specific about a detour lives behind
//! [`CodeEmitter`]. [`X64Emitter`] targets the System V AMD64 ABI,
//! [`X86Emitter`] targets 32-bit cdecl. [`NativeEmitter`] is the one matching
//! the build target.
//!
//! ## Thunk layout
//!
//! ```text
//! thunk:  save argument registers
//!         call on_enter(context, callee, &return_slot, exit_stub)
//!         restore argument registers
//!         <relocated prologue of the target>
//!         jmp target + prologue_len
//!
//! exit stub:
//!         reserve a slot and save return registers
//!         rax = on_exit(context, &original_return_slot)
//!         store rax in the reserved slot, restore, ret
//! ```

// Addresses are encoded as immediates; narrowing is intended for 32-bit code.
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

/// Addresses of the collector context and hook functions baked into thunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interceptor {
    pub context: usize,
    pub on_enter: usize,
    pub on_exit: usize,
}

pub trait CodeEmitter: Send + Sync {
    /// Decoder bitness (32 or 64)
    fn bitness(&self) -> u32;

    /// Size of the jump [`CodeEmitter::emit_jump`] produces from `from` to `to`
    fn redirect_len(&self, from: usize, to: usize) -> usize;

    /// Largest possible [`CodeEmitter::redirect_len`]
    fn max_jump_len(&self) -> usize;

    /// Unconditional jump placed at address `at`, landing on `to`
    fn emit_jump(&self, out: &mut Vec<u8>, at: usize, to: usize);

    /// Register save, enter-hook call and register restore (position independent)
    fn emit_enter_call(&self, out: &mut Vec<u8>, interceptor: &Interceptor, callee: usize, exit_stub: usize);

    /// Exit stub shared by every thunk of one interceptor (position independent)
    fn emit_exit_stub(&self, out: &mut Vec<u8>, interceptor: &Interceptor);
}

fn rel32(at: usize, len: usize, to: usize) -> Option<i32> {
    let next = (at as i64).wrapping_add(len as i64);
    i32::try_from((to as i64).wrapping_sub(next)).ok()
}

// ============================================================================
// x86_64
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct X64Emitter;

const X64_JMP_REL32_LEN: usize = 5;
const X64_JMP_ABS_LEN: usize = 14;

/// Caller-saved general purpose registers, as (push, pop) encodings
const X64_VOLATILE: [&[u8]; 9] = [
    &[0x57],       // rdi
    &[0x56],       // rsi
    &[0x52],       // rdx
    &[0x51],       // rcx
    &[0x41, 0x50], // r8
    &[0x41, 0x51], // r9
    &[0x50],       // rax
    &[0x41, 0x52], // r10
    &[0x41, 0x53], // r11
];

impl X64Emitter {
    /// `movdqu [rsp + disp8], xmmN`
    fn save_xmm(out: &mut Vec<u8>, register: u8, disp: u8) {
        out.extend_from_slice(&[0xF3, 0x0F, 0x7F, 0x44 | (register << 3), 0x24, disp]);
    }

    /// `movdqu xmmN, [rsp + disp8]`
    fn load_xmm(out: &mut Vec<u8>, register: u8, disp: u8) {
        out.extend_from_slice(&[0xF3, 0x0F, 0x6F, 0x44 | (register << 3), 0x24, disp]);
    }

    /// `mov r64, imm64` for rax/rcx/rdx/rsi/rdi (opcode B8+r)
    fn mov_imm64(out: &mut Vec<u8>, opcode: u8, value: usize) {
        out.extend_from_slice(&[0x48, opcode]);
        out.extend_from_slice(&(value as u64).to_le_bytes());
    }

    fn pop_encoding(push: &[u8]) -> Vec<u8> {
        let mut pop = push.to_vec();
        if let Some(last) = pop.last_mut() {
            *last += 8;
        }
        pop
    }
}

const MOV_RAX: u8 = 0xB8;
const MOV_RCX: u8 = 0xB9;
const MOV_RSI: u8 = 0xBE;
const MOV_RDI: u8 = 0xBF;

impl CodeEmitter for X64Emitter {
    fn bitness(&self) -> u32 {
        64
    }

    fn redirect_len(&self, from: usize, to: usize) -> usize {
        if rel32(from, X64_JMP_REL32_LEN, to).is_some() {
            X64_JMP_REL32_LEN
        } else {
            X64_JMP_ABS_LEN
        }
    }

    fn max_jump_len(&self) -> usize {
        X64_JMP_ABS_LEN
    }

    fn emit_jump(&self, out: &mut Vec<u8>, at: usize, to: usize) {
        if let Some(displacement) = rel32(at, X64_JMP_REL32_LEN, to) {
            out.push(0xE9);
            out.extend_from_slice(&displacement.to_le_bytes());
        } else {
            // jmp [rip+0]; dq target
            out.extend_from_slice(&[0xFF, 0x25, 0, 0, 0, 0]);
            out.extend_from_slice(&(to as u64).to_le_bytes());
        }
    }

    fn emit_enter_call(&self, out: &mut Vec<u8>, interceptor: &Interceptor, callee: usize, exit_stub: usize) {
        // Entry: rsp points at the return slot, rsp % 16 == 8. Nine pushes
        // realign to 16; 0x80 bytes hold xmm0-7.
        for push in X64_VOLATILE {
            out.extend_from_slice(push);
        }
        out.extend_from_slice(&[0x48, 0x81, 0xEC, 0x80, 0x00, 0x00, 0x00]); // sub rsp, 0x80
        for register in 0..8u8 {
            Self::save_xmm(out, register, register * 16);
        }

        Self::mov_imm64(out, MOV_RDI, interceptor.context);
        Self::mov_imm64(out, MOV_RSI, callee);
        // lea rdx, [rsp + 0x80 + 9 * 8]: the return slot
        out.extend_from_slice(&[0x48, 0x8D, 0x94, 0x24, 0xC8, 0x00, 0x00, 0x00]);
        Self::mov_imm64(out, MOV_RCX, exit_stub);
        Self::mov_imm64(out, MOV_RAX, interceptor.on_enter);
        out.extend_from_slice(&[0xFF, 0xD0]); // call rax

        for register in 0..8u8 {
            Self::load_xmm(out, register, register * 16);
        }
        out.extend_from_slice(&[0x48, 0x81, 0xC4, 0x80, 0x00, 0x00, 0x00]); // add rsp, 0x80
        for push in X64_VOLATILE.iter().rev() {
            out.extend_from_slice(&Self::pop_encoding(push));
        }
    }

    fn emit_exit_stub(&self, out: &mut Vec<u8>, interceptor: &Interceptor) {
        // Entry: the function just returned here, so rsp = slot + 8, rsp % 16 == 0.
        out.push(0x50); // push rax: placeholder, lands on the original slot
        out.push(0x50); // push rax
        out.push(0x52); // push rdx
        out.extend_from_slice(&[0x48, 0x83, 0xEC, 0x28]); // sub rsp, 0x28
        Self::save_xmm(out, 0, 0x00);
        Self::save_xmm(out, 1, 0x10);

        Self::mov_imm64(out, MOV_RDI, interceptor.context);
        out.extend_from_slice(&[0x48, 0x8D, 0x74, 0x24, 0x38]); // lea rsi, [rsp + 0x38]
        Self::mov_imm64(out, MOV_RAX, interceptor.on_exit);
        out.extend_from_slice(&[0xFF, 0xD0]); // call rax
        out.extend_from_slice(&[0x48, 0x89, 0x44, 0x24, 0x38]); // mov [rsp + 0x38], rax

        Self::load_xmm(out, 0, 0x00);
        Self::load_xmm(out, 1, 0x10);
        out.extend_from_slice(&[0x48, 0x83, 0xC4, 0x28]); // add rsp, 0x28
        out.push(0x5A); // pop rdx
        out.push(0x58); // pop rax
        out.push(0xC3); // ret
    }
}

// ============================================================================
// x86 (cdecl)
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct X86Emitter;

const X86_JMP_LEN: usize = 5;

fn imm32(out: &mut Vec<u8>, value: usize) {
    out.extend_from_slice(&(value as u32).to_le_bytes());
}

impl CodeEmitter for X86Emitter {
    fn bitness(&self) -> u32 {
        32
    }

    fn redirect_len(&self, _from: usize, _to: usize) -> usize {
        X86_JMP_LEN
    }

    fn max_jump_len(&self) -> usize {
        X86_JMP_LEN
    }

    fn emit_jump(&self, out: &mut Vec<u8>, at: usize, to: usize) {
        // The 32-bit address space wraps, so rel32 always reaches.
        let displacement = (to as u32).wrapping_sub((at as u32).wrapping_add(X86_JMP_LEN as u32));
        out.push(0xE9);
        out.extend_from_slice(&displacement.to_le_bytes());
    }

    fn emit_enter_call(&self, out: &mut Vec<u8>, interceptor: &Interceptor, callee: usize, exit_stub: usize) {
        out.extend_from_slice(&[0x50, 0x51, 0x52]); // push eax, ecx, edx
        out.extend_from_slice(&[0x8D, 0x44, 0x24, 0x0C]); // lea eax, [esp + 12]: the return slot
        out.push(0x68); // push exit_stub
        imm32(out, exit_stub);
        out.push(0x50); // push eax
        out.push(0x68); // push callee
        imm32(out, callee);
        out.push(0x68); // push context
        imm32(out, interceptor.context);
        out.push(0xB8); // mov eax, on_enter
        imm32(out, interceptor.on_enter);
        out.extend_from_slice(&[0xFF, 0xD0]); // call eax
        out.extend_from_slice(&[0x83, 0xC4, 0x10]); // add esp, 16
        out.extend_from_slice(&[0x5A, 0x59, 0x58]); // pop edx, ecx, eax
    }

    fn emit_exit_stub(&self, out: &mut Vec<u8>, interceptor: &Interceptor) {
        out.extend_from_slice(&[0x50, 0x50, 0x52]); // placeholder, push eax, push edx
        out.extend_from_slice(&[0x8D, 0x44, 0x24, 0x08]); // lea eax, [esp + 8]: the original slot
        out.push(0x50); // push eax
        out.push(0x68); // push context
        imm32(out, interceptor.context);
        out.push(0xB8); // mov eax, on_exit
        imm32(out, interceptor.on_exit);
        out.extend_from_slice(&[0xFF, 0xD0]); // call eax
        out.extend_from_slice(&[0x83, 0xC4, 0x08]); // add esp, 8
        out.extend_from_slice(&[0x89, 0x44, 0x24, 0x08]); // mov [esp + 8], eax
        out.extend_from_slice(&[0x5A, 0x58, 0xC3]); // pop edx, pop eax, ret
    }
}

#[cfg(target_arch = "x86_64")]
pub type NativeEmitter = X64Emitter;

#[cfg(target_arch = "x86")]
pub type NativeEmitter = X86Emitter;

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

    const INTERCEPTOR: Interceptor = Interceptor { context: 0x1111_2222, on_enter: 0x3333_4444, on_exit: 0x5555_6666 };

    fn decode(code: &[u8], bitness: u32) -> Vec<Instruction> {
        let mut decoder = Decoder::with_ip(bitness, code, 0, DecoderOptions::NONE);
        let instructions: Vec<_> = decoder.iter().collect();
        assert!(instructions.iter().all(|i| !i.is_invalid()), "invalid instruction in {code:02x?}");
        instructions
    }

    fn count(instructions: &[Instruction], mnemonic: Mnemonic) -> usize {
        instructions.iter().filter(|i| i.mnemonic() == mnemonic).count()
    }

    fn has_lea(instructions: &[Instruction], target: Register, base: Register, displacement: u64) -> bool {
        instructions.iter().any(|i| {
            i.mnemonic() == Mnemonic::Lea
                && i.op0_register() == target
                && i.memory_base() == base
                && i.memory_displacement64() == displacement
        })
    }

    fn has_mov_imm(instructions: &[Instruction], target: Register, value: u64) -> bool {
        instructions.iter().any(|i| {
            i.mnemonic() == Mnemonic::Mov
                && i.op0_register() == target
                && matches!(i.op1_kind(), OpKind::Immediate64 | OpKind::Immediate32)
                && i.immediate(1) == value
        })
    }

    #[test]
    fn test_x64_near_jump_uses_rel32() {
        let mut out = Vec::new();
        X64Emitter.emit_jump(&mut out, 0x1000, 0x2000);
        assert_eq!(out, [0xE9, 0xFB, 0x0F, 0x00, 0x00]);
        assert_eq!(X64Emitter.redirect_len(0x1000, 0x2000), 5);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_x64_far_jump_is_absolute() {
        let far = 0x7FFF_0000_0000;
        let mut out = Vec::new();
        X64Emitter.emit_jump(&mut out, 0x1000, far);
        assert_eq!(out.len(), X64Emitter.redirect_len(0x1000, far));
        assert_eq!(out[..6], [0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(u64::from_le_bytes(out[6..].try_into().unwrap()), far as u64);
    }

    #[test]
    fn test_x64_enter_call_passes_hook_arguments() {
        let mut out = Vec::new();
        X64Emitter.emit_enter_call(&mut out, &INTERCEPTOR, 0xABCD, 0xEEEE);
        let code = decode(&out, 64);

        assert_eq!(code.first().map(Instruction::op0_register), Some(Register::RDI));
        assert!(has_mov_imm(&code, Register::RDI, 0x1111_2222));
        assert!(has_mov_imm(&code, Register::RSI, 0xABCD));
        assert!(has_lea(&code, Register::RDX, Register::RSP, 0xC8));
        assert!(has_mov_imm(&code, Register::RCX, 0xEEEE));
        assert!(has_mov_imm(&code, Register::RAX, 0x3333_4444));
        assert_eq!(count(&code, Mnemonic::Call), 1);
    }

    #[test]
    fn test_x64_enter_call_balances_stack() {
        let mut out = Vec::new();
        X64Emitter.emit_enter_call(&mut out, &INTERCEPTOR, 1, 2);
        let code = decode(&out, 64);
        assert_eq!(count(&code, Mnemonic::Push), 9);
        assert_eq!(count(&code, Mnemonic::Pop), 9);
        assert_eq!(count(&code, Mnemonic::Movdqu), 16);
        assert_eq!(code.last().map(Instruction::op0_register), Some(Register::RDI));
    }

    #[test]
    fn test_x64_exit_stub_shape() {
        let mut out = Vec::new();
        X64Emitter.emit_exit_stub(&mut out, &INTERCEPTOR);
        let code = decode(&out, 64);
        assert!(has_lea(&code, Register::RSI, Register::RSP, 0x38));
        assert!(has_mov_imm(&code, Register::RAX, 0x5555_6666));
        assert_eq!(count(&code, Mnemonic::Push), 3);
        assert_eq!(count(&code, Mnemonic::Pop), 2);
        assert_eq!(code.last().map(Instruction::mnemonic), Some(Mnemonic::Ret));
    }

    #[test]
    fn test_x86_jump_wraps_address_space() {
        let mut out = Vec::new();
        X86Emitter.emit_jump(&mut out, 0xFFFF_FF00, 0x100);
        assert_eq!(out, [0xE9, 0xFB, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_x86_enter_call_shape() {
        let mut out = Vec::new();
        X86Emitter.emit_enter_call(&mut out, &INTERCEPTOR, 0x4000, 0x5000);
        let code = decode(&out, 32);
        assert!(has_lea(&code, Register::EAX, Register::ESP, 0x0C));
        // three saved registers plus four hook arguments
        assert_eq!(count(&code, Mnemonic::Push), 7);
        assert_eq!(count(&code, Mnemonic::Pop), 3);
    }

    #[test]
    fn test_x86_exit_stub_shape() {
        let mut out = Vec::new();
        X86Emitter.emit_exit_stub(&mut out, &INTERCEPTOR);
        let code = decode(&out, 32);
        assert!(has_lea(&code, Register::EAX, Register::ESP, 0x08));
        assert_eq!(code.last().map(Instruction::mnemonic), Some(Mnemonic::Ret));
    }
}
