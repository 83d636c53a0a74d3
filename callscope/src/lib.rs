//! # callscope - Function-Level Instrumenting Profiler
//!
//! callscope detours selected functions of the running process to a thunk
//! that records every call and return with a tick-counter timestamp, then
//! turns the flat per-thread traces into call-graph statistics: call counts,
//! inclusive and exclusive time, recursion depth, per-callee breakdowns.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Instrumented Function                       │
//! │     jmp thunk ─► on_enter ─► relocated prologue ─► body         │
//! │                         ret ─► exit stub ─► on_exit             │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ CallRecord { callee, timestamp }
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Collector (per-thread buffer queues)               │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ read_collected (reader thread)
//!                         ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Analyzer   │──▶│    Bridge    │──▶│   Frontend   │
//! │ shadow stacks│   │  poll loop   │   │ (JSON lines) │
//! └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Pipeline Modules
//!
//! - [`patcher`]: detours, thunks and their executable memory
//!   - `disasm`: prologue length and relocation (`iced-x86`)
//!   - `emitter`: x86/x86_64 thunk and exit-stub code
//!   - `image_patch`: per-module apply/remove/query with tagged results
//!
//! - [`collector`]: hook entry points and lock-free per-thread buffering
//!
//! - [`analysis`]: shadow-stack reconstruction and call-graph statistics
//!
//! - [`bridge`]: versioned messages and the periodic analyze/update loop
//!
//! ### Supporting Modules
//!
//! - [`modules`]: loaded images from `/proc/self/maps`, ELF function symbols
//! - [`context`]: [`context::Profiler`], owner of one profiling session
//! - [`config`], [`cli`]: configuration file and command line
//! - [`replay`], [`report`], [`inspect`]: offline traces, text reports and
//!   patchability checks
//! - [`clock`]: tick counter and its frequency
//! - [`domain`]: error enums and id newtypes
//!
//! ## Key Concepts
//!
//! - **Thunk**: per-function code that calls the enter hook and then runs the
//!   instructions displaced by the redirect jump
//! - **Exit stub**: shared code the instrumented function returns into; it
//!   reports the return and resumes at the original return address
//! - **Inclusive time**: time between enter and exit, minus hook overhead
//! - **Exclusive time**: inclusive time minus the time spent in callees
//! - **Reentrance**: nesting level of a function within its own call stack

pub mod analysis;
pub mod bridge;
pub mod cli;
pub mod clock;
pub mod collector;
pub mod config;
pub mod context;
pub mod demo;
pub mod domain;
pub mod inspect;
pub mod modules;
pub mod patcher;
pub mod replay;
pub mod report;
