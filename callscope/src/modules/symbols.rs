//! Function symbol tables from ELF images
//!
//! Reads `.symtab`/`.dynsym` with `object` and keeps every defined function
//! symbol with a non-zero size, keyed by its link-time address. Names are
//! demangled with `rustc-demangle` (which passes non-Rust names through).

use anyhow::{Context, Result};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SectionKind, SymbolKind};
use rustc_demangle::demangle;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const SEGMENT_ALIGNMENT: u64 = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub bitness: u32,
    /// Position independent (`ET_DYN`): addresses are relative to the load bias.
    pub relocatable: bool,
    /// Lowest loadable address, page aligned
    pub link_base: u64,
    /// Function symbols by link-time address
    pub functions: BTreeMap<u64, Symbol>,
}

impl SymbolTable {
    /// Parse an in-memory ELF image
    ///
    /// # Errors
    /// Returns an error if the data is not a supported object file
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let file = object::File::parse(data).context("Failed to parse object file")?;

        let mut functions = BTreeMap::new();
        for symbol in file.symbols().chain(file.dynamic_symbols()) {
            if symbol.kind() != SymbolKind::Text || !symbol.is_definition() || symbol.size() == 0 {
                continue;
            }
            let Ok(name) = symbol.name() else { continue };
            functions
                .entry(symbol.address())
                .or_insert_with(|| Symbol { name: demangle_symbol(name), size: symbol.size() });
        }

        let link_base =
            file.segments().map(|s| s.address()).min().unwrap_or_default() & !(SEGMENT_ALIGNMENT - 1);

        Ok(Self {
            bitness: if file.is_64() { 64 } else { 32 },
            relocatable: file.kind() == object::ObjectKind::Dynamic,
            link_base,
            functions,
        })
    }

    /// Read and parse an ELF file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_bytes(&data).with_context(|| format!("Failed to load symbols from {}", path.display()))
    }

    #[must_use]
    pub fn function_at(&self, address: u64) -> Option<&Symbol> {
        self.functions.get(&address)
    }

    /// Find a function by exact (demangled) name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<(u64, &Symbol)> {
        self.functions.iter().find(|(_, s)| s.name == name).map(|(a, s)| (*a, s))
    }
}

/// Raw bytes of `[address, address + size)` from the code section holding them
///
/// # Errors
/// Returns an error if no section with file data covers the range
pub fn function_bytes(data: &[u8], address: u64, size: u64) -> Result<&[u8]> {
    let file = object::File::parse(data).context("Failed to parse object file")?;
    for section in file.sections().filter(|s| s.kind() == SectionKind::Text) {
        let start = section.address();
        if address < start || address + size > start + section.size() {
            continue;
        }
        let bytes = section.data().context("Failed to read section data")?;
        let from = usize::try_from(address - start)?;
        let to = from + usize::try_from(size)?;
        return bytes.get(from..to).context("Section has no file data for the function");
    }
    anyhow::bail!("No section contains {address:#x}")
}

/// Demangle a Rust symbol name
#[must_use]
pub fn demangle_symbol(symbol: &str) -> String {
    format!("{:#}", demangle(symbol))
}
