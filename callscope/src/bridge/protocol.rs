//! Messages sent to the frontend
//!
//! Every message carries [`PROTOCOL_VERSION`] and every call-graph node
//! carries [`CALL_GRAPH_NODE_VERSION`], so a consumer can detect (and skip)
//! schema changes. Records are plain structs with nested statistics; maps are
//! sent as lists sorted by address so the output is deterministic.

use crate::analysis::{CallGraphNode, FunctionStatistics, StatisticsMap};
use crate::collector::ThreadInfo;
use crate::domain::ThreadId;
use callscope_common::{CALL_GRAPH_NODE_VERSION, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Init(InitData),
    UpdateStatistics(StatisticsUpdate),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitData {
    pub version: u32,
    pub executable: String,
    /// Tick-counter frequency; every time in [`StatisticsUpdate`] is in ticks
    pub ticks_per_second: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsUpdate {
    pub version: u32,
    pub threads: Vec<ThreadRecord>,
    pub statistics: Vec<ThreadStatistics>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: ThreadId,
    pub info: ThreadInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStatistics {
    pub thread: ThreadId,
    pub functions: Vec<NodeRecord>,
}

/// One call-graph node on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub version: u32,
    pub address: usize,
    pub stats: FunctionStatistics,
    pub callees: Vec<CalleeRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalleeRecord {
    pub address: usize,
    pub stats: FunctionStatistics,
}

impl Message {
    #[must_use]
    pub fn init(executable: impl Into<String>, ticks_per_second: u64) -> Self {
        Self::Init(InitData { version: PROTOCOL_VERSION, executable: executable.into(), ticks_per_second })
    }
}

impl StatisticsUpdate {
    #[must_use]
    pub fn new(threads: Vec<ThreadRecord>, statistics: Vec<ThreadStatistics>) -> Self {
        Self { version: PROTOCOL_VERSION, threads, statistics }
    }
}

impl ThreadStatistics {
    /// Snapshot of one thread's statistics map
    #[must_use]
    pub fn from_map(thread: ThreadId, map: &StatisticsMap) -> Self {
        let mut functions: Vec<NodeRecord> =
            map.iter().map(|(&address, node)| NodeRecord::from_node(address, node)).collect();
        functions.sort_unstable_by_key(|n| n.address);
        Self { thread, functions }
    }
}

impl NodeRecord {
    #[must_use]
    pub fn from_node(address: usize, node: &CallGraphNode) -> Self {
        let mut callees: Vec<CalleeRecord> =
            node.callees.iter().map(|(&address, &stats)| CalleeRecord { address, stats }).collect();
        callees.sort_unstable_by_key(|c| c.address);
        Self { version: CALL_GRAPH_NODE_VERSION, address, stats: node.stats, callees }
    }
}
