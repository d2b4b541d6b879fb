use std::time::Duration;

use rand::Rng;

/// Jittered exponential backoff for transient errors.
///
/// Delay for attempt n is `base * factor^n`, capped at `max`, then smeared
/// by ±`jitter` so a burst of failing machines doesn't requeue in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Fractional jitter, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        // Exponent is clamped so the f64 math can't overflow long before the
        // cap applies anyway.
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt.min(32) as i32);
        let capped = exp.min(self.max.as_secs_f64());
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((capped * (1.0 + spread)).max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_near_base() {
        let b = Backoff::default();
        for _ in 0..50 {
            let d = b.delay(0);
            assert!(d >= Duration::from_millis(800), "{d:?}");
            assert!(d <= Duration::from_millis(1200), "{d:?}");
        }
    }

    #[test]
    fn delays_double_per_attempt() {
        let b = Backoff {
            jitter: 0.0,
            ..Backoff::default()
        };
        assert_eq!(b.delay(0), Duration::from_secs(1));
        assert_eq!(b.delay(1), Duration::from_secs(2));
        assert_eq!(b.delay(2), Duration::from_secs(4));
        assert_eq!(b.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn delays_are_capped() {
        let b = Backoff::default();
        for attempt in [10, 20, 100, u32::MAX] {
            let d = b.delay(attempt);
            assert!(d <= Duration::from_secs(72), "{d:?}"); // 60s + 20%
        }
    }
}
