//! # Trace Collection
//!
//! Records every enter/exit of instrumented functions into per-thread buffers
//! and hands them to a reader without blocking the instrumented threads.
//!
//! - [`policy`]: buffer budget ([`BufferingPolicy`])
//! - [`buffers_queue`]: the per-thread single-producer/single-reader queue
//! - [`calls_collector`]: the hooks called from thunks and the reader entry point
//! - [`thread_monitor`]: thread ids, names, start/end and CPU time

pub mod buffers_queue;
pub mod calls_collector;
pub mod policy;
pub mod thread_monitor;

pub use buffers_queue::BuffersQueue;
pub use calls_collector::{on_enter, on_exit, CallsAcceptor, CallsCollector, Overhead};
pub use policy::BufferingPolicy;
pub use thread_monitor::{ThreadInfo, ThreadMonitor};
