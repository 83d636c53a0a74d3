//! Relocatable copies of function prologues
//!
//! Installing a detour overwrites the first few bytes of a function. Those
//! instructions are re-emitted in the thunk, so they must be cut at
//! instruction boundaries ([`calculate_fragment_length`]) and their
//! PC-relative operands fixed up for the new address ([`move_function`]).

use crate::domain::PatchError;
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};

fn decoder(source: &[u8], ip: u64, bitness: u32) -> Result<Decoder<'_>, PatchError> {
    Decoder::try_with_ip(bitness, source, ip, DecoderOptions::NONE)
        .map_err(|e| PatchError::InconsistentFunctionRange(format!("decoder: {e}")))
}

fn decode_next(decoder: &mut Decoder<'_>, offset: usize) -> Result<Instruction, PatchError> {
    if !decoder.can_decode() {
        return Err(PatchError::InconsistentFunctionRange(format!(
            "function ends at offset {offset:#x} inside the patched region"
        )));
    }
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return Err(PatchError::InconsistentFunctionRange(format!(
            "undecodable instruction at offset {offset:#x}"
        )));
    }
    Ok(instruction)
}

fn is_short_branch(instruction: &Instruction) -> bool {
    instruction.is_jmp_short()
        || instruction.is_jcc_short()
        || instruction.is_jcx_short()
        || instruction.is_loop()
        || instruction.is_loopcc()
}

fn is_near_branch(instruction: &Instruction) -> bool {
    instruction.is_jmp_near() || instruction.is_jcc_near() || instruction.is_call_near()
}

/// Smallest instruction-aligned length covering at least `min_length` bytes
///
/// # Errors
/// [`PatchError::InconsistentFunctionRange`] if `source` runs out or holds an
/// undecodable instruction before `min_length` is reached.
pub fn calculate_fragment_length(
    source: &[u8],
    source_ip: u64,
    bitness: u32,
    min_length: usize,
) -> Result<usize, PatchError> {
    let mut decoder = decoder(source, source_ip, bitness)?;
    let mut length = 0;
    while length < min_length {
        length += decode_next(&mut decoder, length)?.len();
    }
    Ok(length)
}

/// Copy `source` for execution at `destination`
///
/// `source` is the instruction-aligned fragment that lives at `source_base`.
/// Near relative branches and RIP-relative operands that point outside the
/// fragment are rewritten to reach the same absolute target; references that
/// stay inside the fragment move with it.
///
/// # Errors
/// - [`PatchError::InconsistentFunctionRange`] for a short branch leaving the
///   fragment, an `int3`, or undecodable bytes
/// - [`PatchError::RelocationOutOfRange`] when a rewritten displacement no
///   longer fits in 32 bits
pub fn move_function(
    destination: u64,
    source_base: u64,
    source: &[u8],
    bitness: u32,
) -> Result<Vec<u8>, PatchError> {
    let source_end = source_base + source.len() as u64;
    let inside = |target: u64| (source_base..source_end).contains(&target);
    let mut decoder = decoder(source, source_base, bitness)?;
    let mut output = source.to_vec();

    while decoder.can_decode() {
        let offset = decoder.position();
        let instruction = decode_next(&mut decoder, offset)?;
        let length = instruction.len();
        let new_next_ip = destination + (offset + length) as u64;

        if instruction.mnemonic() == Mnemonic::Int3 {
            return Err(PatchError::InconsistentFunctionRange(format!(
                "int3 at offset {offset:#x} (already patched by a debugger?)"
            )));
        }

        if is_short_branch(&instruction) {
            let target = instruction.near_branch_target();
            if !inside(target) {
                return Err(PatchError::InconsistentFunctionRange(format!(
                    "short branch at offset {offset:#x} leaves the fragment for {target:#x}"
                )));
            }
        } else if is_near_branch(&instruction) {
            let target = instruction.near_branch_target();
            if !inside(target) {
                // rel32 is always the instruction's trailing dword
                write_displacement(&mut output, offset + length - 4, target, new_next_ip, bitness)?;
            }
        } else if instruction.is_ip_rel_memory_operand() {
            let target = instruction.ip_rel_memory_address();
            if !inside(target) {
                let offsets = decoder.get_constant_offsets(&instruction);
                if offsets.displacement_size() != 4 {
                    return Err(PatchError::InconsistentFunctionRange(format!(
                        "unexpected rip-relative displacement size at offset {offset:#x}"
                    )));
                }
                write_displacement(
                    &mut output,
                    offset + offsets.displacement_offset(),
                    target,
                    new_next_ip,
                    bitness,
                )?;
            }
        }
    }
    Ok(output)
}

// Two's-complement arithmetic on addresses; wrapping is intended on 32-bit.
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn write_displacement(
    output: &mut [u8],
    at: usize,
    target: u64,
    next_ip: u64,
    bitness: u32,
) -> Result<(), PatchError> {
    let displacement = target.wrapping_sub(next_ip) as i64;
    let displacement = if bitness == 64 {
        i32::try_from(displacement).map_err(|_| PatchError::RelocationOutOfRange { target })?
    } else {
        displacement as i32
    };
    output[at..at + 4].copy_from_slice(&displacement.to_le_bytes());
    Ok(())
}

/// Reject functions whose body branches back into the overwritten prologue
///
/// `function` is the whole function body starting at `function_ip`. A branch
/// to the very start is fine (it lands on the detour); a branch to any other
/// byte of the first `fragment_len` would execute half of the redirect jump.
/// Decoding stops quietly at the first undecodable byte (padding or data).
///
/// # Errors
/// [`PatchError::OffsetProhibited`] with the offending offset.
pub fn validate_displaced_references(
    function: &[u8],
    function_ip: u64,
    fragment_len: usize,
    bitness: u32,
) -> Result<(), PatchError> {
    let prohibited = (function_ip + 1)..(function_ip + fragment_len as u64);
    let mut decoder = decoder(function, function_ip, bitness)?;

    while decoder.can_decode() {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            break;
        }
        if is_short_branch(&instruction) || is_near_branch(&instruction) {
            let target = instruction.near_branch_target();
            if prohibited.contains(&target) {
                return Err(PatchError::OffsetProhibited(target - function_ip));
            }
        }
    }
    Ok(())
}
