//! Buffer budget derived from a trace-size limit
//!
//! A thread queue may own at most [`BufferingPolicy::max_buffers`] buffers of
//! [`BUFFER_SIZE`] records each. After every read the pool of spare (empty)
//! buffers is trimmed down to `max_empty` and topped up to `min_empty`, both
//! shifted by the number of buffers the reader just saw.

use crate::domain::CollectorError;
use callscope_common::BUFFER_SIZE;

pub const DEFAULT_TRACE_LIMIT: usize = 1_000_000;
pub const DEFAULT_MAX_EMPTY_FACTOR: f64 = 0.2;
pub const DEFAULT_MIN_EMPTY_FACTOR: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingPolicy {
    max_buffers: usize,
    max_empty: usize,
    min_empty: usize,
}

impl BufferingPolicy {
    /// Build a policy from a record budget and the watermark factors
    ///
    /// `trace_limit` is measured in records; the factors are fractions of the
    /// resulting buffer count.
    ///
    /// # Errors
    /// Returns [`CollectorError::InvalidPolicy`] if a factor is outside `[0, 1]`
    /// (or NaN) or if `min_empty_factor > max_empty_factor`.
    pub fn new(
        trace_limit: usize,
        max_empty_factor: f64,
        min_empty_factor: f64,
    ) -> Result<Self, CollectorError> {
        for (name, factor) in [("max_empty_factor", max_empty_factor), ("min_empty_factor", min_empty_factor)] {
            if !(0.0..=1.0).contains(&factor) {
                return Err(CollectorError::InvalidPolicy(format!(
                    "{name} must be within [0, 1], got {factor}"
                )));
            }
        }
        if min_empty_factor > max_empty_factor {
            return Err(CollectorError::InvalidPolicy(format!(
                "min_empty_factor ({min_empty_factor}) exceeds max_empty_factor ({max_empty_factor})"
            )));
        }

        Ok(Self::from_factors(trace_limit, max_empty_factor, min_empty_factor))
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from_factors(trace_limit: usize, max_empty_factor: f64, min_empty_factor: f64) -> Self {
        let max_buffers = trace_limit.div_ceil(BUFFER_SIZE).max(1);
        let max_empty = ((max_buffers as f64 * max_empty_factor).floor() as usize).max(1);
        let min_empty = ((max_buffers as f64 * min_empty_factor).floor() as usize).min(max_buffers - 1);
        Self { max_buffers, max_empty, min_empty }
    }

    /// Upper bound on buffers a single thread queue may allocate
    #[must_use]
    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    /// Spare-buffer high watermark (before the per-read shift)
    #[must_use]
    pub fn max_empty(&self) -> usize {
        self.max_empty
    }

    /// Spare-buffer low watermark (before the per-read shift)
    #[must_use]
    pub fn min_empty(&self) -> usize {
        self.min_empty
    }
}

impl Default for BufferingPolicy {
    /// 1M records per thread, 1% to 20% of that kept as spare buffers
    fn default() -> Self {
        Self::from_factors(DEFAULT_TRACE_LIMIT, DEFAULT_MAX_EMPTY_FACTOR, DEFAULT_MIN_EMPTY_FACTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers(n: usize) -> usize {
        n * BUFFER_SIZE
    }

    #[test]
    fn test_max_buffers_rounds_up() {
        assert_eq!(BufferingPolicy::new(buffers(1000), 1.0, 0.0).unwrap().max_buffers(), 1000);
        assert_eq!(BufferingPolicy::new(buffers(1000) + 1, 1.0, 0.0).unwrap().max_buffers(), 1001);
        assert_eq!(BufferingPolicy::new(1, 1.0, 0.0).unwrap().max_buffers(), 1);
    }

    #[test]
    fn test_zero_limit_still_gets_one_buffer() {
        let policy = BufferingPolicy::new(0, 0.5, 0.5).unwrap();
        assert_eq!(policy.max_buffers(), 1);
        assert_eq!(policy.max_empty(), 1);
        assert_eq!(policy.min_empty(), 0);
    }

    #[test]
    fn test_watermarks_from_factors() {
        let policy = BufferingPolicy::new(buffers(1000), 0.113_300_001, 0.101_000_01).unwrap();
        assert_eq!(policy.max_empty(), 113);
        assert_eq!(policy.min_empty(), 101);

        let policy = BufferingPolicy::new(buffers(100), 0.113_300_001, 0.101_000_01).unwrap();
        assert_eq!(policy.max_empty(), 11);
        assert_eq!(policy.min_empty(), 10);

        let policy = BufferingPolicy::new(buffers(100), 0.570_000_1, 0.390_000_1).unwrap();
        assert_eq!(policy.max_empty(), 57);
        assert_eq!(policy.min_empty(), 39);
    }

    #[test]
    fn test_watermark_clamping() {
        let policy = BufferingPolicy::new(buffers(100), 0.0, 0.0).unwrap();
        assert_eq!(policy.max_empty(), 1);
        assert_eq!(policy.min_empty(), 0);

        let policy = BufferingPolicy::new(buffers(1000), 1.0, 1.0).unwrap();
        assert_eq!(policy.max_empty(), 1000);
        assert_eq!(policy.min_empty(), 999);

        let policy = BufferingPolicy::new(buffers(97), 1.0, 1.0).unwrap();
        assert_eq!(policy.min_empty(), 96);
    }

    #[test]
    fn test_default_policy() {
        let policy = BufferingPolicy::default();
        assert_eq!(policy.max_buffers(), 2605);
        assert_eq!(policy.max_empty(), 521);
        assert_eq!(policy.min_empty(), 26);
    }

    #[test]
    fn test_rejects_bad_factors() {
        assert!(BufferingPolicy::new(1000, 1.1, 0.0).is_err());
        assert!(BufferingPolicy::new(1000, 0.5, -0.1).is_err());
        assert!(BufferingPolicy::new(1000, f64::NAN, 0.0).is_err());
        assert!(BufferingPolicy::new(1000, 0.9, 0.900_000_1).is_err());
    }
}
