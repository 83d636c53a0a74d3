//! # Profiler Context
//!
//! [`Profiler`] owns one profiling session: the thread monitor, the calls
//! collector the thunks report to, the loaded-module table and the patch
//! manager. There is no global collector; thunks get the collector's address
//! baked in, and dependents receive `Arc` handles from here.
//!
//! Dropping the profiler removes every patch before the collector goes away.

use crate::bridge::{Frontend, StatisticsBridge};
use crate::clock::ticks_per_second;
use crate::collector::{on_enter, on_exit, CallsCollector, ThreadMonitor};
use crate::config::Config;
use crate::domain::{BridgeError, ModuleId, Rva};
use crate::modules::ProcessModules;
use crate::patcher::{ImagePatchManager, Interceptor, ModuleResolver, NativeEmitter, PatchChangeResult, PatchManager};
use anyhow::{Context, Result};
use std::sync::Arc;

pub struct Profiler {
    // Declared first so patches are removed while the collector is alive.
    patches: ImagePatchManager,
    modules: Arc<ProcessModules>,
    collector: Arc<CallsCollector>,
    monitor: Arc<ThreadMonitor>,
}

impl Profiler {
    /// Start a session for the current process
    ///
    /// # Errors
    /// Fails on an invalid buffering policy, unreadable `/proc/self/maps`, or
    /// if the exit stub cannot be placed in executable memory.
    pub fn new(config: &Config) -> Result<Self> {
        let policy = config.buffering_policy()?;
        let monitor = Arc::new(ThreadMonitor::new());
        let collector = Arc::new(CallsCollector::new(Arc::clone(&monitor), policy));
        let modules = Arc::new(ProcessModules::discover().context("Failed to list loaded modules")?);

        let interceptor = Interceptor {
            context: Arc::as_ptr(&collector) as usize,
            on_enter: on_enter as usize,
            on_exit: on_exit as usize,
        };
        let resolver: Arc<dyn ModuleResolver> = Arc::clone(&modules) as Arc<dyn ModuleResolver>;
        let patches = ImagePatchManager::new(resolver, interceptor, Box::new(NativeEmitter::default()), config.block_size)
            .context("Failed to set up the patch manager")?;

        log::info!("profiler ready: {} modules, {} max buffers per thread", modules.modules().len(), policy.max_buffers());
        Ok(Self { patches, modules, collector, monitor })
    }

    #[must_use]
    pub fn collector(&self) -> &Arc<CallsCollector> {
        &self.collector
    }

    #[must_use]
    pub fn thread_monitor(&self) -> &Arc<ThreadMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn modules(&self) -> &ProcessModules {
        &self.modules
    }

    pub fn patches(&mut self) -> &mut dyn PatchManager {
        &mut self.patches
    }

    /// Rvas of `module`'s functions whose names satisfy `filter`
    #[must_use]
    pub fn find_functions(&self, module: ModuleId, filter: &dyn Fn(&str) -> bool) -> Vec<Rva> {
        self.modules
            .lock_module(module)
            .map(|mapping| mapping.symbols.iter().filter(|(_, s)| filter(&s.name)).map(|(rva, _)| *rva).collect())
            .unwrap_or_default()
    }

    /// Instrument the functions at `rvas`
    pub fn instrument(&mut self, module: ModuleId, rvas: &[Rva]) -> Vec<PatchChangeResult> {
        self.patches.apply(module, rvas)
    }

    /// Bridge that ships this session's statistics to `frontend`
    ///
    /// Calibrates the hook overhead first, which takes a few milliseconds.
    ///
    /// # Errors
    /// Returns the frontend's error if the `init` message cannot be sent.
    pub fn bridge(&self, frontend: Box<dyn Frontend>) -> Result<StatisticsBridge, BridgeError> {
        let executable = std::env::current_exe().map(|p| p.display().to_string()).unwrap_or_default();
        let overhead = CallsCollector::calibrate();
        StatisticsBridge::new(Arc::clone(&self.collector), frontend, &executable, ticks_per_second(), overhead)
    }
}
