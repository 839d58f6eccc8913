use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with jitter.
///
/// Delays never decrease between resets and never exceed `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        Self { initial, max: max.max(initial), jitter, attempt: 0, last: Duration::ZERO }
    }

    pub fn attempt(&self) -> u32 { self.attempt }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        let base = self.initial.saturating_mul(factor).min(self.max);
        let spread = base.mul_f64(self.jitter);
        let jitter = if spread.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_nanos(rand::thread_rng().gen_range(0..=spread.as_nanos().min(u64::MAX as u128) as u64))
        };
        let delay = base.saturating_add(jitter).max(self.last).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}
