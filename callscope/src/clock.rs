//! Tick counter used to timestamp call records
//!
//! On x86 targets this is the time-stamp counter (`rdtsc`); elsewhere it falls
//! back to a monotonic nanosecond clock. [`ticks_per_second`] is calibrated
//! once against the wall clock and cached.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

const CALIBRATION_WINDOW: Duration = Duration::from_millis(50);

static TICKS_PER_SECOND: OnceLock<u64> = OnceLock::new();

/// Read the raw tick counter
#[inline(always)]
#[must_use]
pub fn read_tick_counter() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: rdtsc has no memory effects and is available on every x86_64 CPU
        #[allow(unsafe_code)]
        unsafe {
            core::arch::x86_64::_rdtsc()
        }
    }
    #[cfg(target_arch = "x86")]
    {
        // SAFETY: as above; every CPU this crate emits code for supports rdtsc
        #[allow(unsafe_code)]
        unsafe {
            core::arch::x86::_rdtsc()
        }
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        monotonic_nanos()
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn monotonic_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Tick counter frequency, calibrated on first use
#[must_use]
pub fn ticks_per_second() -> u64 {
    *TICKS_PER_SECOND.get_or_init(calibrate)
}

// Tick counts fit comfortably in f64's mantissa for the windows we measure
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn calibrate() -> u64 {
    if cfg!(not(any(target_arch = "x86", target_arch = "x86_64"))) {
        return 1_000_000_000;
    }

    let wall_start = Instant::now();
    let ticks_start = read_tick_counter();
    while wall_start.elapsed() < CALIBRATION_WINDOW {
        std::hint::spin_loop();
    }
    let ticks = read_tick_counter().saturating_sub(ticks_start);
    let elapsed = wall_start.elapsed().as_secs_f64();

    let rate = (ticks as f64 / elapsed) as u64;
    log::debug!("tick counter calibrated at {rate} ticks/s");
    rate.max(1)
}

/// Convert a tick delta into wall-clock time
#[must_use]
pub fn ticks_to_duration(ticks: u64) -> Duration {
    let tps = u128::from(ticks_per_second());
    let nanos = u128::from(ticks) * 1_000_000_000 / tps;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counter_is_monotonic_enough() {
        let a = read_tick_counter();
        std::thread::sleep(Duration::from_millis(1));
        let b = read_tick_counter();
        assert!(b > a);
    }

    #[test]
    fn test_ticks_per_second_is_cached() {
        let first = ticks_per_second();
        assert!(first > 0);
        assert_eq!(first, ticks_per_second());
    }

    #[test]
    fn test_ticks_to_duration_one_second() {
        let d = ticks_to_duration(ticks_per_second());
        assert_eq!(d, Duration::from_secs(1));
    }
}
