//! # Image Patch Manager
//!
//! Tracks instrumentation of whole modules: which functions (by rva) were
//! asked for, which detours are installed, which failed and why.
//!
//! ## Lifecycle of an entry
//!
//! ```text
//!            apply ok                 remove
//!   (new) ───────────► Active ──────────────────► Dormant
//!     │                  ▲                          │
//!     │ apply failed     │ apply ok                 │
//!     ▼                  │                          │
//!   Failed ──────────────┴──────────────────────────┘
//! ```
//!
//! An entry keeps its [`PatchId`] for the manager's lifetime, so reapplying a
//! dormant or failed patch reports the same id. Requests are handled one
//! function at a time: a failure is reported in that function's result and
//! the rest of the batch carries on.

use super::allocator::{ExecutableAllocator, ThunkHandle};
use super::emitter::{CodeEmitter, Interceptor};
use super::function_patch::FunctionPatch;
use crate::domain::{ModuleId, PatchError, PatchId, Rva};
use crate::modules::ModuleMapping;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Lookup of modules that can be patched
pub trait ModuleResolver: Send + Sync {
    /// Function table and load address of `module`, or `None` if it is not
    /// (or no longer) mapped
    fn lock_module(&self, module: ModuleId) -> Option<Arc<ModuleMapping>>;
}

/// Instrumentation requests against one module at a time
pub trait PatchManager {
    fn query(&self, module: ModuleId) -> Vec<PatchState>;
    fn apply(&mut self, module: ModuleId, rvas: &[Rva]) -> Vec<PatchChangeResult>;
    fn remove(&mut self, module: ModuleId, rvas: &[Rva]) -> Vec<PatchChangeResult>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchStatus {
    Ok,
    /// Already in the requested state
    Unchanged,
    Failed(PatchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchChangeResult {
    /// `None` when the request never produced an entry
    pub id: Option<PatchId>,
    pub rva: Rva,
    pub status: PatchStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchActivity {
    Active,
    Dormant,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchState {
    pub id: PatchId,
    pub rva: Rva,
    pub name: String,
    pub activity: PatchActivity,
}

struct PatchEntry {
    id: PatchId,
    name: String,
    address: usize,
    size: usize,
    patch: Option<FunctionPatch>,
    error: Option<PatchError>,
}

impl PatchEntry {
    fn activity(&self) -> PatchActivity {
        match (&self.patch, &self.error) {
            (Some(_), _) => PatchActivity::Active,
            (None, Some(_)) => PatchActivity::Failed,
            (None, None) => PatchActivity::Dormant,
        }
    }
}

struct ModulePatches {
    // Declared first: patches are restored before the mapping is released.
    entries: BTreeMap<Rva, PatchEntry>,
    allocator: ExecutableAllocator,
    mapping: Arc<ModuleMapping>,
}

pub struct ImagePatchManager {
    modules: HashMap<ModuleId, ModulePatches>,
    resolver: Arc<dyn ModuleResolver>,
    interceptor: Interceptor,
    emitter: Box<dyn CodeEmitter>,
    block_size: usize,
    next_id: u32,
    // Last: returns still in flight land here even after every patch is gone.
    exit_stub: ThunkHandle,
}

impl ImagePatchManager {
    /// Create a manager whose thunks call the hooks in `interceptor`
    ///
    /// # Errors
    /// Fails if the shared exit stub cannot be allocated.
    pub fn new(
        resolver: Arc<dyn ModuleResolver>,
        interceptor: Interceptor,
        emitter: Box<dyn CodeEmitter>,
        block_size: usize,
    ) -> Result<Self, PatchError> {
        let mut code = Vec::new();
        emitter.emit_exit_stub(&mut code, &interceptor);
        let exit_stub = ExecutableAllocator::new(interceptor.on_exit, block_size).allocate(code.len())?;
        exit_stub.write(&code);
        log::debug!("exit stub at {:#x}", exit_stub.address());

        Ok(Self {
            modules: HashMap::new(),
            resolver,
            interceptor,
            emitter,
            block_size,
            next_id: 1,
            exit_stub,
        })
    }

    #[must_use]
    pub fn exit_stub(&self) -> usize {
        self.exit_stub.address()
    }

    /// Number of installed detours across all modules
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.modules
            .values()
            .flat_map(|m| m.entries.values())
            .filter(|e| e.patch.is_some())
            .count()
    }

    fn apply_one(
        patches: &mut ModulePatches,
        next_id: &mut u32,
        rva: Rva,
        install: &dyn Fn(usize, usize, &ExecutableAllocator) -> Result<FunctionPatch, PatchError>,
    ) -> PatchChangeResult {
        if !patches.entries.contains_key(&rva) {
            let Some(symbol) = patches.mapping.symbols.get(&rva) else {
                return PatchChangeResult { id: None, rva, status: PatchStatus::Failed(PatchError::UnknownFunction(rva)) };
            };
            let id = PatchId(*next_id);
            *next_id += 1;
            patches.entries.insert(
                rva,
                PatchEntry {
                    id,
                    name: symbol.name.clone(),
                    address: patches.mapping.address_of(rva),
                    size: usize::try_from(symbol.size).unwrap_or(usize::MAX),
                    patch: None,
                    error: None,
                },
            );
        }

        let Some(entry) = patches.entries.get_mut(&rva) else {
            return PatchChangeResult { id: None, rva, status: PatchStatus::Failed(PatchError::NotFound(rva)) };
        };
        if entry.patch.is_some() {
            return PatchChangeResult { id: Some(entry.id), rva, status: PatchStatus::Unchanged };
        }

        let status = match install(entry.address, entry.size, &patches.allocator) {
            Ok(patch) => {
                log::debug!("{} {} installed at {:#x}", entry.id, entry.name, entry.address);
                entry.patch = Some(patch);
                entry.error = None;
                PatchStatus::Ok
            }
            Err(e) => {
                log::warn!("cannot instrument {} ({:#x}): {e}", entry.name, entry.address);
                entry.error = Some(e.clone());
                PatchStatus::Failed(e)
            }
        };
        PatchChangeResult { id: Some(entry.id), rva, status }
    }
}

impl PatchManager for ImagePatchManager {
    fn query(&self, module: ModuleId) -> Vec<PatchState> {
        self.modules
            .get(&module)
            .map(|patches| {
                patches
                    .entries
                    .iter()
                    .map(|(&rva, entry)| PatchState {
                        id: entry.id,
                        rva,
                        name: entry.name.clone(),
                        activity: entry.activity(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn apply(&mut self, module: ModuleId, rvas: &[Rva]) -> Vec<PatchChangeResult> {
        let interceptor = self.interceptor;
        let exit_stub = self.exit_stub.address();
        let emitter: &dyn CodeEmitter = self.emitter.as_ref();
        let install = |address: usize, size: usize, allocator: &ExecutableAllocator| {
            // SAFETY: address and size come from the module's symbol table
            // and the module is mapped (the resolver just locked it).
            unsafe { FunctionPatch::new(address, size, &interceptor, exit_stub, allocator, emitter) }
        };

        let mut next_id = self.next_id;
        let results: Vec<PatchChangeResult> = match Self::module_patches(&mut self.modules, &*self.resolver, module, self.block_size) {
            Ok(patches) => rvas
                .iter()
                .map(|&rva| Self::apply_one(patches, &mut next_id, rva, &install))
                .collect(),
            Err(e) => rvas
                .iter()
                .map(|&rva| PatchChangeResult { id: None, rva, status: PatchStatus::Failed(e.clone()) })
                .collect(),
        };
        self.next_id = next_id;

        let installed = results.iter().filter(|r| r.status == PatchStatus::Ok).count();
        log::info!("{module}: {installed} of {} functions instrumented", rvas.len());
        results
    }

    fn remove(&mut self, module: ModuleId, rvas: &[Rva]) -> Vec<PatchChangeResult> {
        let mut entries = self.modules.get_mut(&module).map(|m| &mut m.entries);
        rvas.iter()
            .map(|&rva| {
                let Some(entry) = entries.as_mut().and_then(|e| e.get_mut(&rva)) else {
                    return PatchChangeResult { id: None, rva, status: PatchStatus::Failed(PatchError::NotFound(rva)) };
                };
                entry.error = None;
                let status = match entry.patch.take() {
                    Some(patch) => {
                        drop(patch);
                        log::debug!("{} {} removed", entry.id, entry.name);
                        PatchStatus::Ok
                    }
                    None => PatchStatus::Unchanged,
                };
                PatchChangeResult { id: Some(entry.id), rva, status }
            })
            .collect()
    }
}

impl ImagePatchManager {
    // Takes the fields it needs so the install closure can borrow the emitter.
    fn module_patches<'a>(
        modules: &'a mut HashMap<ModuleId, ModulePatches>,
        resolver: &dyn ModuleResolver,
        module: ModuleId,
        block_size: usize,
    ) -> Result<&'a mut ModulePatches, PatchError> {
        let mapping = resolver.lock_module(module).ok_or(PatchError::ModuleNotLoaded(module))?;
        let patches = modules.entry(module).or_insert_with(|| ModulePatches {
            entries: BTreeMap::new(),
            allocator: ExecutableAllocator::new(mapping.base, block_size),
            mapping: Arc::clone(&mapping),
        });
        patches.mapping = mapping;
        Ok(patches)
    }
}
