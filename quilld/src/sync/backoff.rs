use rand::Rng;

use super::record::now_ms;

const MAX_DOUBLINGS: u32 = 16;

/// Retry schedule for transfer jobs. Delays grow exponentially with the
/// attempt count, are capped, and carry half-to-full jitter so jobs parked
/// by one outage do not come back in lockstep. Everything is in unix
/// milliseconds to line up with the queue's `retry_at` column.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    jitter: bool,
}

impl Backoff {
    pub const fn new_ms(base_ms: u64, cap_ms: u64, jitter: bool) -> Self {
        Self { base_ms, cap_ms, jitter }
    }

    /// Queue defaults: one second before the first retry, capped at five
    /// minutes.
    pub const fn for_transfers() -> Self {
        Self::new_ms(1_000, 300_000, true)
    }

    /// When a job that just failed its `attempt`-th time (1-based) becomes
    /// eligible again.
    pub fn retry_at_ms(&self, attempt: u32) -> i64 {
        let mut rng = rand::thread_rng();
        let delay = self.delay_ms_with_rng(attempt, &mut rng);
        now_ms().saturating_add(i64::try_from(delay).unwrap_or(i64::MAX))
    }

    fn delay_ms_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let doublings = attempt.saturating_sub(1).min(MAX_DOUBLINGS);
        let full = self
            .base_ms
            .saturating_mul(1u64 << doublings)
            .min(self.cap_ms);
        if self.jitter && full > 0 {
            rng.gen_range(full / 2..=full)
        } else {
            full
        }
    }
}
