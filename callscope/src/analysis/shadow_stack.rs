//! Call-stack reconstruction from a flat enter/exit trace
//!
//! One [`ShadowStack`] per thread replays that thread's records, pairing each
//! exit with the innermost open call and charging the call's time to the
//! function's node and to its caller's callee map.
//!
//! Hook overhead is removed as it goes: every call loses `inner` ticks of its
//! own measurement, and a caller loses `inner + outer` ticks per child call
//! from both its exclusive and inclusive time.

use super::statistics::StatisticsMap;
use crate::collector::Overhead;
use callscope_common::CallRecord;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Frame {
    callee: usize,
    entry: u64,
    level: u32,
    children_time: u64,
    children_overhead: u64,
}

#[derive(Debug, Default)]
pub struct ShadowStack {
    inner_overhead: u64,
    total_overhead: u64,
    stack: Vec<Frame>,
    /// Open calls per function; the next entry's recursion level.
    entrance: HashMap<usize, u32>,
}

impl ShadowStack {
    #[must_use]
    pub fn new(overhead: Overhead) -> Self {
        Self { inner_overhead: overhead.inner, total_overhead: overhead.total(), ..Self::default() }
    }

    /// Number of calls still open
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Replay `calls`, accumulating completed calls into `statistics`
    ///
    /// Open calls stay on the stack across invocations; an exit with nothing
    /// open is ignored.
    pub fn update(&mut self, calls: &[CallRecord], statistics: &mut StatisticsMap) {
        for record in calls {
            if record.is_exit() {
                self.exit(record.timestamp, statistics);
            } else {
                self.enter(record.callee, record.timestamp);
            }
        }
    }

    fn enter(&mut self, callee: usize, timestamp: u64) {
        let counter = self.entrance.entry(callee).or_default();
        let level = *counter;
        *counter += 1;
        self.stack.push(Frame { callee, entry: timestamp, level, children_time: 0, children_overhead: 0 });
    }

    fn exit(&mut self, timestamp: u64, statistics: &mut StatisticsMap) {
        let Some(frame) = self.stack.pop() else {
            return;
        };
        if let Some(counter) = self.entrance.get_mut(&frame.callee) {
            *counter = counter.saturating_sub(1);
        }

        let observed = timestamp.saturating_sub(frame.entry).saturating_sub(self.inner_overhead);
        let inclusive = observed.saturating_sub(frame.children_overhead);
        let exclusive = observed.saturating_sub(frame.children_time).min(inclusive);

        statistics.entry(frame.callee).or_default().stats.add_call(frame.level, inclusive, exclusive);

        if let Some(parent) = self.stack.last_mut() {
            parent.children_time = parent.children_time.saturating_add(observed + self.total_overhead);
            parent.children_overhead =
                parent.children_overhead.saturating_add(self.total_overhead + frame.children_overhead);
            statistics
                .entry(parent.callee)
                .or_default()
                .callees
                .entry(frame.callee)
                .or_default()
                .add_child_call(frame.level, parent.level, inclusive, exclusive);
        }
    }
}
