//! Offline patchability check of a binary's functions

use crate::domain::PatchError;
use crate::modules::symbols::{function_bytes, SymbolTable};
use crate::patcher::disasm::{calculate_fragment_length, move_function, validate_displaced_references};
use anyhow::{Context, Result};
use std::path::Path;

/// Length of the shortest redirect (`jmp rel32`)
const NEAR_REDIRECT_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionReport {
    /// Link-time address
    pub address: u64,
    pub name: String,
    pub size: u64,
    /// Prologue length a detour would move, or why it cannot be placed
    pub verdict: Result<usize, PatchError>,
}

/// Check every function of `path` whose name contains `filter`
///
/// # Errors
/// Returns an error if the file cannot be read or parsed
pub fn inspect_binary(path: impl AsRef<Path>, filter: Option<&str>) -> Result<Vec<FunctionReport>> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let table = SymbolTable::from_bytes(&data).with_context(|| format!("Failed to load symbols from {}", path.display()))?;

    let reports = table
        .functions
        .iter()
        .filter(|(_, symbol)| filter.map_or(true, |f| symbol.name.contains(f)))
        .map(|(&address, symbol)| {
            let verdict = match function_bytes(&data, address, symbol.size) {
                Ok(bytes) => assess(bytes, address, table.bitness),
                Err(e) => Err(PatchError::InconsistentFunctionRange(format!("{e:#}"))),
            };
            FunctionReport { address, name: symbol.name.clone(), size: symbol.size, verdict }
        })
        .collect();
    Ok(reports)
}

/// The checks a detour install runs, minus memory allocation and writes
///
/// # Errors
/// The [`PatchError`] the install would fail with.
pub fn assess(function: &[u8], address: u64, bitness: u32) -> Result<usize, PatchError> {
    if function.len() < NEAR_REDIRECT_LEN {
        return Err(PatchError::FunctionTooShort { size: function.len(), required: NEAR_REDIRECT_LEN });
    }
    let fragment_len = calculate_fragment_length(function, address, bitness, NEAR_REDIRECT_LEN)?;
    validate_displaced_references(function, address, fragment_len, bitness)?;
    move_function(address, address, &function[..fragment_len], bitness)?;
    Ok(fragment_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assess_reports_fragment_length() {
        // push rbp; mov rbp, rsp; mov eax, 7; pop rbp; ret
        let code = [0x55, 0x48, 0x89, 0xE5, 0xB8, 0x07, 0x00, 0x00, 0x00, 0x5D, 0xC3];
        assert_eq!(assess(&code, 0x1000, 64), Ok(9));
    }

    #[test]
    fn test_assess_rejects_short_and_looping_functions() {
        assert!(matches!(assess(&[0xC3], 0x1000, 64), Err(PatchError::FunctionTooShort { .. })));

        // nop x2; jmp back to offset 1 (inside the displaced prologue)
        let code = [0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0xEB, 0xF9];
        assert_eq!(assess(&code, 0x1000, 64), Err(PatchError::OffsetProhibited(1)));
    }

    #[test]
    fn test_own_executable_is_inspectable() {
        let exe = std::env::current_exe().unwrap();
        let reports = inspect_binary(&exe, Some(crate::demo::SYMBOL_PREFIX)).unwrap();
        assert!(reports.iter().any(|r| r.name.ends_with("checksum")));
        assert!(reports.iter().all(|r| r.name.contains(crate::demo::SYMBOL_PREFIX)));
    }
}
