//! Plain-text rendering of call-graph statistics

// Tick to millisecond conversion loses precision for display
#![allow(clippy::cast_precision_loss)]

use crate::analysis::StatisticsMap;
use std::fmt::Write;

/// Table of functions sorted by inclusive time, with their hottest callees
///
/// Times are shown in milliseconds when `ticks_per_second` is known, in raw
/// ticks otherwise.
#[must_use]
pub fn format_report(statistics: &StatisticsMap, name_of: &dyn Fn(usize) -> String, ticks_per_second: Option<u64>) -> String {
    let time = |ticks: u64| match ticks_per_second {
        Some(tps) if tps > 0 => format!("{:.3}ms", ticks as f64 * 1000.0 / tps as f64),
        _ => format!("{ticks}"),
    };

    let mut nodes: Vec<_> = statistics.iter().collect();
    nodes.sort_by(|a, b| b.1.stats.inclusive_time.cmp(&a.1.stats.inclusive_time).then(a.0.cmp(b.0)));

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<40} {:>10} {:>14} {:>14} {:>14} {:>6}",
        "FUNCTION", "CALLS", "INCLUSIVE", "EXCLUSIVE", "MAX CALL", "DEPTH"
    );
    for (&address, node) in nodes {
        let s = &node.stats;
        let _ = writeln!(
            out,
            "{:<40} {:>10} {:>14} {:>14} {:>14} {:>6}",
            name_of(address),
            s.times_called,
            time(s.inclusive_time),
            time(s.exclusive_time),
            time(s.max_call_time),
            s.max_reentrance
        );

        let mut callees: Vec<_> = node.callees.iter().collect();
        callees.sort_by(|a, b| b.1.inclusive_time.cmp(&a.1.inclusive_time).then(a.0.cmp(b.0)));
        for (&callee, c) in callees.into_iter().take(3) {
            let _ = writeln!(
                out,
                "  -> {:<36} {:>10} {:>14}",
                name_of(callee),
                c.times_called,
                time(c.inclusive_time)
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_by_inclusive_time() {
        let mut map = StatisticsMap::new();
        map.entry(1).or_default().stats.add_call(0, 10, 10);
        map.entry(2).or_default().stats.add_call(0, 500, 400);
        map.get_mut(&2).unwrap().callees.entry(1).or_default().add_call(0, 10, 10);

        let names = |a: usize| format!("f{a}");
        let report = format_report(&map, &names, None);
        let lines: Vec<&str> = report.lines().collect();

        assert!(lines[0].starts_with("FUNCTION"));
        assert!(lines[1].starts_with("f2"));
        assert!(lines[2].trim_start().starts_with("-> f1"));
        assert!(lines[3].starts_with("f1"));
    }

    #[test]
    fn test_times_in_milliseconds_when_rate_known() {
        let mut map = StatisticsMap::new();
        map.entry(1).or_default().stats.add_call(0, 2_000, 2_000);

        let report = format_report(&map, &|a| format!("f{a}"), Some(1_000_000));
        assert!(report.contains("2.000ms"));
    }
}
