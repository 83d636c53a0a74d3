//! Recorded traces for offline analysis
//!
//! A replay file holds raw enter/exit records per thread, as the collector
//! would hand them to the analyzer, plus optional function names:
//!
//! ```json
//! {
//!   "ticks_per_second": 1000000,
//!   "names": { "4096": "main", "8192": "parse" },
//!   "threads": [
//!     { "thread": 0, "calls": [ { "callee": 4096, "timestamp": 0 },
//!                               { "callee": 0, "timestamp": 50 } ] }
//!   ]
//! }
//! ```

use crate::collector::CallsAcceptor;
use crate::domain::ThreadId;
use anyhow::{Context, Result};
use callscope_common::CallRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayTrace {
    /// Tick frequency of the timestamps, if known
    #[serde(default)]
    pub ticks_per_second: Option<u64>,
    #[serde(default)]
    pub names: BTreeMap<usize, String>,
    pub threads: Vec<RecordedThread>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedThread {
    pub thread: ThreadId,
    pub calls: Vec<CallRecord>,
}

impl ReplayTrace {
    /// Parse a replay file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a valid trace
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read trace {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid trace {}", path.display()))
    }

    /// Feed every thread's records to `acceptor`, `chunk` records at a time
    ///
    /// Returns the number of records delivered.
    pub fn replay(&self, acceptor: &mut dyn CallsAcceptor, chunk: usize) -> usize {
        let mut delivered = 0;
        for thread in &self.threads {
            for calls in thread.calls.chunks(chunk.max(1)) {
                acceptor.accept_calls(thread.thread, calls);
                delivered += calls.len();
            }
        }
        delivered
    }

    /// Name for `address`, falling back to its hex form
    #[must_use]
    pub fn name_of(&self, address: usize) -> String {
        self.names.get(&address).cloned().unwrap_or_else(|| format!("{address:#x}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;

    const TRACE: &str = r#"{
        "names": { "4096": "outer" },
        "threads": [
            { "thread": 3, "calls": [
                { "callee": 4096, "timestamp": 0 },
                { "callee": 8192, "timestamp": 10 },
                { "callee": 0, "timestamp": 30 },
                { "callee": 0, "timestamp": 100 }
            ] }
        ]
    }"#;

    #[test]
    fn test_parses_names_and_records() {
        let trace: ReplayTrace = serde_json::from_str(TRACE).unwrap();
        assert_eq!(trace.ticks_per_second, None);
        assert_eq!(trace.threads[0].thread, ThreadId(3));
        assert!(trace.threads[0].calls[2].is_exit());
        assert_eq!(trace.name_of(0x1000), "outer");
        assert_eq!(trace.name_of(0x2000), "0x2000");
    }

    #[test]
    fn test_chunked_replay_matches_whole() {
        let trace: ReplayTrace = serde_json::from_str(TRACE).unwrap();
        let mut whole = Analyzer::default();
        let mut chunked = Analyzer::default();

        assert_eq!(trace.replay(&mut whole, usize::MAX), 4);
        assert_eq!(trace.replay(&mut chunked, 1), 4);

        assert_eq!(whole.merged(), chunked.merged());
        assert_eq!(whole.merged()[&0x1000].stats.exclusive_time, 80);
    }
}
