//! Detours installed on real functions of this test binary
#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use callscope::bridge::JsonLinesFrontend;
use callscope::config::Config;
use callscope::context::Profiler;
use callscope::demo;
use callscope::patcher::{ModuleResolver, PatchActivity, PatchStatus};

fn demo_rva(profiler: &Profiler, module: callscope::domain::ModuleId, name: &str) -> u64 {
    let mapping = profiler.modules().lock_module(module).unwrap();
    *mapping.symbols.iter().find(|(_, s)| s.name == format!("{}{name}", demo::SYMBOL_PREFIX)).unwrap().0
}

#[test]
fn test_instrumented_workload_reports_every_call() {
    let expected = demo::run_workload(1, 1);
    let mut profiler = Profiler::new(&Config::default()).unwrap();
    let module = profiler.modules().module_of(demo::checksum as usize).unwrap().id;
    let rvas: Vec<u64> = ["checksum", "mix", "fibonacci"].iter().map(|n| demo_rva(&profiler, module, n)).collect();

    let results = profiler.instrument(module, &rvas);
    assert_eq!(results[0].status, PatchStatus::Ok);
    let installed: Vec<bool> = results.iter().map(|r| r.status == PatchStatus::Ok).collect();
    let states = profiler.patches().query(module);
    assert_eq!(states.iter().filter(|s| s.activity == PatchActivity::Active).count(), installed.iter().filter(|ok| **ok).count());

    let mut bridge = profiler.bridge(Box::new(JsonLinesFrontend::new(std::io::sink()))).unwrap();
    assert_eq!(demo::run_workload(2, 2), 0);
    assert_eq!(demo::run_workload(1, 1), expected);
    bridge.analyze();
    bridge.update_frontend().unwrap();

    let totals = bridge.totals();
    let address = |rva: u64| profiler.modules().lock_module(module).unwrap().address_of(rva);
    let checksum = &totals[&address(rvas[0])];
    assert_eq!(checksum.stats.times_called, 5);
    assert!(checksum.stats.inclusive_time >= checksum.stats.exclusive_time);
    if installed[1] {
        assert_eq!(totals[&address(rvas[1])].stats.times_called, 5 * 32);
        assert_eq!(checksum.callees[&address(rvas[1])].times_called, 5 * 32);
    }
    if installed[2] {
        assert!(totals[&address(rvas[2])].stats.max_reentrance >= 10);
    }
    for (_, thread) in bridge.analyzer().threads() {
        assert_eq!(thread.open_calls(), 0);
    }

    let removed = profiler.patches().remove(module, &rvas);
    for (result, was_installed) in removed.iter().zip(&installed) {
        assert_eq!(result.status == PatchStatus::Ok, *was_installed);
    }
    assert_eq!(demo::run_workload(1, 1), expected);
}
