//! Per-function call statistics and call-graph nodes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::AddAssign;

/// Aggregated timing of one function (or one call site)
///
/// Times are in tick-counter units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionStatistics {
    pub times_called: u64,
    /// Deepest recursion level seen; the outermost call is level 0.
    pub max_reentrance: u32,
    pub inclusive_time: u64,
    pub exclusive_time: u64,
    /// Longest single observed call.
    pub max_call_time: u64,
}

impl FunctionStatistics {
    /// Account one completed call at recursion `level`
    ///
    /// Inclusive time is only added for outermost calls, so nested reentries
    /// are not counted twice. Exclusive time always is.
    pub fn add_call(&mut self, level: u32, inclusive: u64, exclusive: u64) {
        self.record(level, level == 0, inclusive, exclusive);
    }

    /// Account a call seen from a caller frame at recursion `caller_level`
    ///
    /// Used for callee maps: times only count when the caller frame is itself
    /// outermost, which keeps the callees' inclusive sum within the caller's
    /// inclusive time and each entry's exclusive time within its inclusive.
    /// Calls from nested caller frames are counted but carry no time.
    pub fn add_child_call(&mut self, level: u32, caller_level: u32, inclusive: u64, exclusive: u64) {
        if caller_level == 0 {
            self.record(level, true, inclusive, exclusive);
        } else {
            self.times_called += 1;
            self.max_reentrance = self.max_reentrance.max(level);
        }
    }

    fn record(&mut self, level: u32, count_inclusive: bool, inclusive: u64, exclusive: u64) {
        self.times_called += 1;
        self.max_reentrance = self.max_reentrance.max(level);
        if count_inclusive {
            self.inclusive_time += inclusive;
        }
        self.exclusive_time += exclusive;
        self.max_call_time = self.max_call_time.max(inclusive);
    }
}

impl AddAssign<&FunctionStatistics> for FunctionStatistics {
    fn add_assign(&mut self, rhs: &FunctionStatistics) {
        self.times_called += rhs.times_called;
        self.max_reentrance = self.max_reentrance.max(rhs.max_reentrance);
        self.inclusive_time += rhs.inclusive_time;
        self.exclusive_time += rhs.exclusive_time;
        self.max_call_time = self.max_call_time.max(rhs.max_call_time);
    }
}

/// Function statistics plus per-callee breakdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallGraphNode {
    pub stats: FunctionStatistics,
    pub callees: HashMap<usize, FunctionStatistics>,
}

impl AddAssign<&CallGraphNode> for CallGraphNode {
    fn add_assign(&mut self, rhs: &CallGraphNode) {
        self.stats += &rhs.stats;
        for (address, callee) in &rhs.callees {
            *self.callees.entry(*address).or_default() += callee;
        }
    }
}

/// Statistics keyed by function address
pub type StatisticsMap = HashMap<usize, CallGraphNode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_call_counts_inclusive_only_at_level_zero() {
        let mut s = FunctionStatistics::default();
        s.add_call(1, 50, 20);
        s.add_call(0, 100, 30);

        assert_eq!(s.times_called, 2);
        assert_eq!(s.max_reentrance, 1);
        assert_eq!(s.inclusive_time, 100);
        assert_eq!(s.exclusive_time, 50);
        assert_eq!(s.max_call_time, 100);
    }

    #[test]
    fn test_add_child_call_gates_on_caller_level() {
        let mut s = FunctionStatistics::default();
        s.add_child_call(0, 0, 10, 10);
        s.add_child_call(1, 2, 40, 40);

        assert_eq!(s.times_called, 2);
        assert_eq!(s.max_reentrance, 1);
        assert_eq!(s.inclusive_time, 10);
        assert_eq!(s.exclusive_time, 10);
        assert_eq!(s.max_call_time, 10);
    }

    #[test]
    fn test_merge_adds_counts_and_maxes_peaks() {
        let mut a = FunctionStatistics {
            times_called: 3,
            max_reentrance: 2,
            inclusive_time: 100,
            exclusive_time: 60,
            max_call_time: 70,
        };
        let b = FunctionStatistics {
            times_called: 1,
            max_reentrance: 5,
            inclusive_time: 10,
            exclusive_time: 10,
            max_call_time: 10,
        };
        a += &b;
        assert_eq!(
            a,
            FunctionStatistics {
                times_called: 4,
                max_reentrance: 5,
                inclusive_time: 110,
                exclusive_time: 70,
                max_call_time: 70,
            }
        );
    }

    #[test]
    fn test_node_merge_unions_callees() {
        let mut a = CallGraphNode::default();
        a.callees.entry(1).or_default().add_call(0, 5, 5);
        let mut b = CallGraphNode::default();
        b.callees.entry(1).or_default().add_call(0, 7, 7);
        b.callees.entry(2).or_default().add_call(0, 1, 1);

        a += &b;
        assert_eq!(a.callees.len(), 2);
        assert_eq!(a.callees[&1].inclusive_time, 12);
        assert_eq!(a.callees[&2].times_called, 1);
    }
}
