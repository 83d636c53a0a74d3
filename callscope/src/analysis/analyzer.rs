//! Streaming trace analyzer
//!
//! [`Analyzer`] is the collector's [`CallsAcceptor`]: it keeps one
//! [`ThreadAnalyzer`] per thread id and feeds each chunk through that thread's
//! shadow stack. Statistics can be cleared after each report while the open
//! calls on the stacks are kept, so a call that spans two reports is still
//! paired correctly.

use super::shadow_stack::ShadowStack;
use super::statistics::{CallGraphNode, StatisticsMap};
use crate::collector::{CallsAcceptor, Overhead};
use crate::domain::ThreadId;
use callscope_common::CallRecord;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Call-graph statistics for a single thread
#[derive(Debug, Default)]
pub struct ThreadAnalyzer {
    stack: ShadowStack,
    statistics: StatisticsMap,
}

impl ThreadAnalyzer {
    #[must_use]
    pub fn new(overhead: Overhead) -> Self {
        Self { stack: ShadowStack::new(overhead), statistics: StatisticsMap::new() }
    }

    pub fn accept_calls(&mut self, calls: &[CallRecord]) {
        self.stack.update(calls, &mut self.statistics);
    }

    #[must_use]
    pub fn statistics(&self) -> &StatisticsMap {
        &self.statistics
    }

    /// Calls entered but not yet exited
    #[must_use]
    pub fn open_calls(&self) -> usize {
        self.stack.depth()
    }

    pub fn clear(&mut self) {
        self.statistics.clear();
    }
}

/// Work done since the telemetry was last taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzerTelemetry {
    pub records_analyzed: u64,
    pub analysis_time: Duration,
}

#[derive(Debug, Default)]
pub struct Analyzer {
    overhead: Overhead,
    threads: HashMap<ThreadId, ThreadAnalyzer>,
    telemetry: AnalyzerTelemetry,
}

impl Analyzer {
    #[must_use]
    pub fn new(overhead: Overhead) -> Self {
        Self { overhead, ..Self::default() }
    }

    /// Drop accumulated statistics, keeping every thread's open calls
    pub fn clear(&mut self) {
        for thread in self.threads.values_mut() {
            thread.clear();
        }
    }

    /// True when no thread has any completed call since the last clear
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.values().all(|t| t.statistics.is_empty())
    }

    #[must_use]
    pub fn thread(&self, id: ThreadId) -> Option<&ThreadAnalyzer> {
        self.threads.get(&id)
    }

    pub fn threads(&self) -> impl Iterator<Item = (ThreadId, &ThreadAnalyzer)> {
        self.threads.iter().map(|(id, t)| (*id, t))
    }

    /// Statistics of all threads folded into one map
    #[must_use]
    pub fn merged(&self) -> StatisticsMap {
        let mut merged = StatisticsMap::new();
        for thread in self.threads.values() {
            for (address, node) in &thread.statistics {
                *merged.entry(*address).or_insert_with(CallGraphNode::default) += node;
            }
        }
        merged
    }

    /// Return and reset the work counters
    pub fn take_telemetry(&mut self) -> AnalyzerTelemetry {
        std::mem::take(&mut self.telemetry)
    }
}

impl CallsAcceptor for Analyzer {
    fn accept_calls(&mut self, thread_id: ThreadId, calls: &[CallRecord]) {
        let started = Instant::now();
        let overhead = self.overhead;
        self.threads
            .entry(thread_id)
            .or_insert_with(|| ThreadAnalyzer::new(overhead))
            .accept_calls(calls);
        self.telemetry.records_analyzed += calls.len() as u64;
        self.telemetry.analysis_time += started.elapsed();
    }
}
