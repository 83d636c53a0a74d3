//! Workload instrumented by `callscope demo`
//!
//! Plain functions with C linkage and no inlining, so each one has its own
//! symbol and a conventional prologue to detour.

use std::hint::black_box;

/// Prefix shared by the demangled names of the workload functions
pub const SYMBOL_PREFIX: &str = "callscope::demo::";

#[inline(never)]
pub extern "C" fn fibonacci(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fibonacci(n - 1).wrapping_add(fibonacci(n - 2))
    }
}

#[inline(never)]
pub extern "C" fn mix(seed: u64, value: u64) -> u64 {
    let mut x = seed ^ value.rotate_left(17);
    for _ in 0..black_box(8) {
        x = x.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(31);
    }
    x
}

#[inline(never)]
pub extern "C" fn checksum(rounds: u64) -> u64 {
    let mut acc = 0u64;
    for i in 0..rounds {
        acc = mix(acc, fibonacci(black_box(i % 16)));
    }
    acc
}

/// Run `iterations` checksums on each of `threads` named threads
pub fn run_workload(threads: usize, iterations: u64) -> u64 {
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            std::thread::Builder::new()
                .name(format!("demo-worker-{i}"))
                .spawn(move || (0..iterations).fold(0u64, |acc, _| acc ^ checksum(black_box(32))))
        })
        .collect();

    let mut result = 0;
    for handle in handles {
        match handle {
            Ok(handle) => result ^= handle.join().unwrap_or_default(),
            Err(e) => log::warn!("failed to spawn demo worker: {e}"),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_is_deterministic() {
        assert_eq!(fibonacci(10), 55);
        assert_eq!(checksum(5), checksum(5));
        assert_eq!(run_workload(2, 3), 0); // identical workers cancel out
    }
}
