//! # Loaded Modules and Their Functions
//!
//! Finds the executable images mapped into this process and the functions
//! each one defines, so the patch manager can turn a `(module, rva)` pair into
//! a runtime address and a function size.
//!
//! ## Addresses
//!
//! Symbol addresses in a position independent image (`ET_DYN`: shared
//! objects and PIE executables) are relative to a *load bias* chosen by the
//! loader:
//!
//! ```text
//! runtime address = load bias + link-time address
//! load bias       = start of the offset-0 mapping - lowest segment address
//! ```
//!
//! For a fixed-address executable (`ET_EXEC`) the bias is zero. Throughout
//! the crate the link-time address is called the *rva*.

pub mod memory_maps;
pub mod symbols;

use crate::domain::{ModuleId, Rva};
use crate::patcher::ModuleResolver;
use anyhow::Result;
use memory_maps::{read_self_maps, MapEntry, MemoryRange};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
pub use symbols::{Symbol, SymbolTable};

/// A module as seen in `/proc/self/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub id: ModuleId,
    pub path: String,
    /// Span of all the module's mappings
    pub range: MemoryRange,
    /// Start of the mapping at file offset 0
    pub image_start: u64,
}

/// A module with its function table, ready for patching
#[derive(Debug, Clone)]
pub struct ModuleMapping {
    pub id: ModuleId,
    pub path: String,
    /// Load bias: runtime address of rva 0
    pub base: usize,
    pub bitness: u32,
    pub symbols: BTreeMap<Rva, Symbol>,
}

impl ModuleMapping {
    /// Runtime address of `rva`
    #[must_use]
    pub fn address_of(&self, rva: Rva) -> usize {
        self.base.wrapping_add(usize::try_from(rva).unwrap_or(usize::MAX))
    }
}

/// Executable images mapped into the current process
pub struct ProcessModules {
    modules: Vec<LoadedModule>,
    mappings: Mutex<HashMap<ModuleId, Arc<ModuleMapping>>>,
}

impl ProcessModules {
    /// Snapshot the current process's modules
    ///
    /// # Errors
    /// Returns an error if `/proc/self/maps` cannot be read
    pub fn discover() -> Result<Self> {
        Ok(Self::from_maps(&read_self_maps()?))
    }

    /// Group file-backed mappings into modules, keeping those with code
    #[must_use]
    pub fn from_maps(entries: &[MapEntry]) -> Self {
        let mut modules: Vec<LoadedModule> = Vec::new();
        let mut executable: Vec<bool> = Vec::new();

        for entry in entries {
            let Some(path) = entry.path.as_deref().filter(|p| p.starts_with('/')) else {
                continue;
            };
            let index = if let Some(i) = modules.iter().position(|m| m.path == path) {
                i
            } else {
                modules.push(LoadedModule {
                    id: ModuleId(0),
                    path: path.to_string(),
                    range: entry.range,
                    image_start: entry.range.start,
                });
                executable.push(false);
                modules.len() - 1
            };

            let module = &mut modules[index];
            module.range.start = module.range.start.min(entry.range.start);
            module.range.end = module.range.end.max(entry.range.end);
            if entry.offset == 0 {
                module.image_start = module.image_start.min(entry.range.start);
            }
            executable[index] |= entry.executable;
        }

        let modules: Vec<LoadedModule> = modules
            .into_iter()
            .zip(executable)
            .filter_map(|(m, exec)| exec.then_some(m))
            .enumerate()
            .map(|(i, m)| LoadedModule { id: ModuleId(u32::try_from(i).unwrap_or(u32::MAX)), ..m })
            .collect();

        log::debug!("discovered {} modules with code", modules.len());
        Self { modules, mappings: Mutex::new(HashMap::new()) }
    }

    #[must_use]
    pub fn modules(&self) -> &[LoadedModule] {
        &self.modules
    }

    /// Module containing `address`
    #[must_use]
    pub fn module_of(&self, address: usize) -> Option<&LoadedModule> {
        self.modules.iter().find(|m| m.range.contains(address as u64))
    }

    /// Module whose path ends with `suffix`
    #[must_use]
    pub fn find_by_path(&self, suffix: &str) -> Option<&LoadedModule> {
        self.modules.iter().find(|m| m.path.ends_with(suffix))
    }

    fn load_mapping(module: &LoadedModule) -> Result<ModuleMapping> {
        let table = SymbolTable::load(&module.path)?;
        let base = if table.relocatable { module.image_start.wrapping_sub(table.link_base) } else { 0 };
        Ok(ModuleMapping {
            id: module.id,
            path: module.path.clone(),
            base: usize::try_from(base)?,
            bitness: table.bitness,
            symbols: table.functions,
        })
    }
}

impl ModuleResolver for ProcessModules {
    fn lock_module(&self, id: ModuleId) -> Option<Arc<ModuleMapping>> {
        let mut mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mapping) = mappings.get(&id) {
            return Some(Arc::clone(mapping));
        }

        let module = self.modules.iter().find(|m| m.id == id)?;
        match Self::load_mapping(module) {
            Ok(mapping) => {
                log::debug!("{}: {} functions, base {:#x}", mapping.path, mapping.symbols.len(), mapping.base);
                let mapping = Arc::new(mapping);
                mappings.insert(id, Arc::clone(&mapping));
                Some(mapping)
            }
            Err(e) => {
                log::warn!("cannot load symbols for {}: {e:#}", module.path);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_maps::parse_maps;

    const SAMPLE: &str = "\
1000-2000 r--p 00000000 fd:01 1 /opt/app
2000-5000 r-xp 00001000 fd:01 1 /opt/app
5000-6000 rw-p 00004000 fd:01 1 /opt/app
9000-a000 rw-p 00000000 fd:01 2 /opt/data.bin
b000-c000 r-xp 00000000 00:00 0 [vdso]
10000-11000 r--p 00000000 fd:01 3 /lib/libc.so
11000-18000 r-xp 00001000 fd:01 3 /lib/libc.so
";

    #[test]
    fn test_groups_mappings_by_path() {
        let modules = ProcessModules::from_maps(&parse_maps(SAMPLE));
        let list = modules.modules();
        assert_eq!(list.len(), 2);

        assert_eq!(list[0].id, ModuleId(0));
        assert_eq!(list[0].path, "/opt/app");
        assert_eq!(list[0].range, MemoryRange { start: 0x1000, end: 0x6000 });
        assert_eq!(list[0].image_start, 0x1000);

        assert_eq!(list[1].id, ModuleId(1));
        assert_eq!(list[1].path, "/lib/libc.so");
    }

    #[test]
    fn test_module_lookup() {
        let modules = ProcessModules::from_maps(&parse_maps(SAMPLE));
        assert_eq!(modules.module_of(0x2500).map(|m| m.id), Some(ModuleId(0)));
        assert_eq!(modules.module_of(0x9500), None);
        assert_eq!(modules.find_by_path("libc.so").map(|m| m.id), Some(ModuleId(1)));
    }

    #[test]
    fn test_unreadable_module_resolves_to_none() {
        let modules = ProcessModules::from_maps(&parse_maps(SAMPLE));
        assert!(modules.lock_module(ModuleId(0)).is_none());
        assert!(modules.lock_module(ModuleId(7)).is_none());
    }

    #[test]
    fn test_own_functions_resolve_to_runtime_addresses() {
        #[inline(never)]
        fn marker() -> u32 {
            std::hint::black_box(7)
        }

        let modules = ProcessModules::discover().unwrap();
        let here = marker as usize;
        let module = modules.module_of(here).unwrap().clone();
        let mapping = modules.lock_module(module.id).unwrap();

        let found = mapping.symbols.keys().any(|rva| mapping.address_of(*rva) == here);
        assert!(found, "marker at {here:#x} not found in {}", mapping.path);
        assert!(Arc::ptr_eq(&mapping, &modules.lock_module(module.id).unwrap()));
    }
}
