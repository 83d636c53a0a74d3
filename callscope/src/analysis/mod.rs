//! Analysis of collected call traces
//!
//! Turns flat, possibly reentrant enter/exit traces into per-thread call-graph
//! statistics. Pure logic: no I/O and no knowledge of how traces were produced.

pub mod analyzer;
pub mod shadow_stack;
pub mod statistics;

pub use analyzer::{Analyzer, AnalyzerTelemetry, ThreadAnalyzer};
pub use shadow_stack::ShadowStack;
pub use statistics::{CallGraphNode, FunctionStatistics, StatisticsMap};
