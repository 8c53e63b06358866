//! Exponential backoff with deterministic jitter.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Applied to the delay (and its cap) after a quota error.
    pub quota_multiplier: u32,
    /// Fraction of the delay used as the jitter window on either side.
    pub jitter_ratio: f32,
    /// Per-call deadline. Expiry counts as an unavailable provider.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            quota_multiplier: 4,
            jitter_ratio: 0.2,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based) for the
    /// job keyed `key`. The same key and attempt always give the same delay.
    pub fn delay(&self, key: &str, attempt: u32, quota: bool) -> Duration {
        let base_ms = self.base_backoff.as_millis() as u64;
        if base_ms == 0 || attempt == 0 {
            return Duration::ZERO;
        }
        let factor = if quota {
            u64::from(self.quota_multiplier.max(1))
        } else {
            1
        };
        let cap_ms = (self.max_backoff.as_millis() as u64).saturating_mul(factor);

        let exponent = (attempt - 1).min(32);
        let anchor_ms = base_ms
            .saturating_mul(1u64 << exponent)
            .saturating_mul(factor)
            .min(cap_ms);

        let span = (anchor_ms as f64) * f64::from(self.jitter_ratio.clamp(0.0, 1.0));
        let lower = (anchor_ms as f64 - span).max(0.0);
        let upper = (anchor_ms as f64 + span).min(cap_ms as f64);
        if upper <= lower {
            return Duration::from_millis(lower.round() as u64);
        }
        let jittered = lower + (upper - lower) * unit(key, attempt);
        Duration::from_millis(jittered.round() as u64)
    }
}

fn unit(key: &str, attempt: u32) -> f64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(&attempt.to_le_bytes());
    let hash = hasher.finalize();
    let mut bits = [0u8; 8];
    bits.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(bits) as f64) / (u64::MAX as f64)
}
