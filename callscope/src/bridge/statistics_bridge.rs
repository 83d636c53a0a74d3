//! # Statistics Bridge
//!
//! Moves data from the collector to the frontend: drains the per-thread
//! buffers into an [`Analyzer`], then ships the accumulated call graphs and
//! clears them, keeping open calls on the shadow stacks.
//!
//! ## Loop
//!
//! [`StatisticsBridge::run`] drives one analyze + update pass per tick. The
//! loop owns the bridge, so passes never overlap. When `shutdown` resolves a
//! final pass runs, so records published before that point are not lost.

use super::frontend::Frontend;
use super::protocol::{Message, StatisticsUpdate, ThreadRecord, ThreadStatistics};
use crate::analysis::{Analyzer, CallGraphNode, StatisticsMap};
use crate::collector::{CallsCollector, Overhead, ThreadMonitor};
use crate::domain::BridgeError;
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

pub struct StatisticsBridge {
    analyzer: Analyzer,
    collector: Arc<CallsCollector>,
    monitor: Arc<ThreadMonitor>,
    frontend: Box<dyn Frontend>,
    /// Everything sent so far, all threads merged
    totals: StatisticsMap,
}

impl StatisticsBridge {
    /// Create the bridge and announce the session with an `init` message
    ///
    /// # Errors
    /// Returns the frontend's error if `init` cannot be delivered.
    pub fn new(
        collector: Arc<CallsCollector>,
        mut frontend: Box<dyn Frontend>,
        executable: &str,
        ticks_per_second: u64,
        overhead: Overhead,
    ) -> Result<Self, BridgeError> {
        frontend.send(&Message::init(executable, ticks_per_second))?;
        let monitor = Arc::clone(collector.thread_monitor());
        Ok(Self { analyzer: Analyzer::new(overhead), collector, monitor, frontend, totals: StatisticsMap::new() })
    }

    #[must_use]
    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    #[must_use]
    pub fn totals(&self) -> &StatisticsMap {
        &self.totals
    }

    /// Drain the collector into the analyzer, returning the record count
    pub fn analyze(&mut self) -> usize {
        self.collector.read_collected(&mut self.analyzer)
    }

    /// Send accumulated statistics, if any, and clear them
    ///
    /// Returns whether a message was sent. Statistics are kept when sending
    /// fails, so the next update carries them.
    ///
    /// # Errors
    /// Returns the frontend's error.
    pub fn update_frontend(&mut self) -> Result<bool, BridgeError> {
        if self.analyzer.is_empty() {
            return Ok(false);
        }

        let mut statistics: Vec<ThreadStatistics> = self
            .analyzer
            .threads()
            .filter(|(_, thread)| !thread.statistics().is_empty())
            .map(|(id, thread)| ThreadStatistics::from_map(id, thread.statistics()))
            .collect();
        statistics.sort_unstable_by_key(|s| s.thread);

        let ids: Vec<_> = statistics.iter().map(|s| s.thread).collect();
        let threads = self.monitor.get_infos(&ids).into_iter().map(|(id, info)| ThreadRecord { id, info }).collect();

        self.frontend.send(&Message::UpdateStatistics(StatisticsUpdate::new(threads, statistics)))?;
        for (address, node) in self.analyzer.merged() {
            *self.totals.entry(address).or_insert_with(CallGraphNode::default) += &node;
        }
        self.analyzer.clear();

        let telemetry = self.analyzer.take_telemetry();
        debug!(
            "analyzed {} records in {:?} since last update",
            telemetry.records_analyzed, telemetry.analysis_time
        );
        Ok(true)
    }

    fn pass(&mut self) -> Result<(), BridgeError> {
        self.analyze();
        self.update_frontend().map(|_| ())
    }

    /// Poll every `period` until `shutdown` completes, then drain once more
    ///
    /// Failed updates during the loop are logged and retried on the next tick.
    ///
    /// # Errors
    /// Returns the error of the final update.
    pub async fn run<F>(&mut self, period: Duration, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.pass() {
                        warn!("statistics update failed: {e}");
                    }
                }
                () = &mut shutdown => break,
            }
        }

        debug!("bridge shutting down, final drain");
        self.pass()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::BufferingPolicy;
    use crate::domain::ThreadId;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<Message>>>);

    impl Frontend for Captured {
        fn send(&mut self, message: &Message) -> Result<(), BridgeError> {
            self.0.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    impl Captured {
        fn updates(&self) -> Vec<StatisticsUpdate> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| match m {
                    Message::UpdateStatistics(u) => Some(u.clone()),
                    Message::Init(_) => None,
                })
                .collect()
        }
    }

    fn bridge() -> (StatisticsBridge, Arc<CallsCollector>, Captured) {
        let collector = Arc::new(CallsCollector::new(Arc::new(ThreadMonitor::new()), BufferingPolicy::default()));
        let captured = Captured::default();
        let bridge = StatisticsBridge::new(
            Arc::clone(&collector),
            Box::new(captured.clone()),
            "/bin/test",
            1000,
            Overhead::default(),
        )
        .unwrap();
        (bridge, collector, captured)
    }

    #[test]
    fn test_init_is_sent_first() {
        let (_bridge, _collector, captured) = bridge();
        let messages = captured.0.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], Message::Init(init) if init.executable == "/bin/test"));
    }

    #[test]
    fn test_update_skipped_without_data() {
        let (mut bridge, collector, captured) = bridge();
        collector.track(0x1000); // open call only, nothing completed

        assert_eq!(bridge.analyze(), 1);
        assert!(!bridge.update_frontend().unwrap());
        assert!(captured.updates().is_empty());
    }

    #[test]
    fn test_update_carries_statistics_and_thread_info() {
        let (mut bridge, collector, captured) = bridge();
        collector.track(0x1000);
        collector.track(0x2000);
        collector.track(0);
        collector.track(0);

        bridge.analyze();
        assert!(bridge.update_frontend().unwrap());

        let updates = captured.updates();
        assert_eq!(updates.len(), 1);
        let update = &updates[0];
        assert_eq!(update.threads.len(), 1);
        assert_eq!(update.threads[0].id, ThreadId(0));
        assert!(update.threads[0].info.end_time.is_none());

        let functions = &update.statistics[0].functions;
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].address, 0x1000);
        assert_eq!(functions[0].callees[0].address, 0x2000);
        assert!(bridge.analyzer().is_empty());
        assert_eq!(bridge.totals()[&0x1000].callees[&0x2000].times_called, 1);
    }

    #[tokio::test]
    async fn test_run_drains_on_shutdown() {
        let (mut bridge, collector, captured) = bridge();
        for _ in 0..100 {
            collector.track(0x1000);
            collector.track(0);
        }

        // Long period: only the immediate first tick and the final drain run.
        bridge.run(Duration::from_secs(3600), tokio::time::sleep(Duration::from_millis(20))).await.unwrap();

        let total: u64 = captured
            .updates()
            .iter()
            .flat_map(|u| u.statistics.iter())
            .flat_map(|s| s.functions.iter())
            .map(|n| n.stats.times_called)
            .sum();
        assert_eq!(total, 100);
    }
}
