//! Randomized expiration so keys written together do not expire together

use rand::Rng;
use std::time::Duration;

/// Smallest expiry ever drawn. A drawn TTL must never collapse to zero, which
/// the store would read as "no expiry" or "expire immediately".
const MIN_TTL_MS: u64 = 1;

/// Uniform jitter band around a base TTL
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterPolicy {
    base_ttl_ms: u64,
    spread: f64,
}

impl JitterPolicy {
    /// `spread` is clamped into `0.0..=1.0`
    pub fn new(base_ttl_ms: u64, spread: f64) -> Self {
        let spread = if spread.is_finite() {
            spread.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            base_ttl_ms,
            spread,
        }
    }

    pub fn base_ttl_ms(&self) -> u64 {
        self.base_ttl_ms
    }

    /// True when the base TTL is zero and nothing ever expires
    pub fn is_disabled(&self) -> bool {
        self.base_ttl_ms == 0
    }

    /// Inclusive millisecond band draws come from, `None` when disabled
    pub fn bounds(&self) -> Option<(u64, u64)> {
        if self.is_disabled() {
            return None;
        }
        let base = self.base_ttl_ms as f64;
        let low = (base * (1.0 - self.spread)).floor() as u64;
        let high = (base * (1.0 + self.spread)).ceil() as u64;
        Some((low.max(MIN_TTL_MS), high.max(MIN_TTL_MS)))
    }

    /// Draw one expiry from the thread-local RNG
    pub fn draw(&self) -> Option<Duration> {
        self.draw_with(&mut rand::thread_rng())
    }

    pub fn draw_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Duration> {
        let (low, high) = self.bounds()?;
        let ms = if low == high {
            low
        } else {
            rng.gen_range(low..=high)
        };
        Some(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    #[test]
    fn test_zero_ttl_never_expires() {
        let policy = JitterPolicy::new(0, 0.5);
        assert!(policy.is_disabled());
        assert_eq!(policy.bounds(), None);
        for _ in 0..100 {
            assert_eq!(policy.draw(), None);
        }
    }

    #[test]
    fn test_draws_stay_in_band() {
        let policy = JitterPolicy::new(10_000, 0.1);
        assert_eq!(policy.bounds(), Some((9_000, 11_000)));

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let ms = policy.draw_with(&mut rng).unwrap().as_millis() as u64;
            assert!((9_000..=11_000).contains(&ms), "{ms} out of band");
        }
    }

    #[test]
    fn test_draws_are_decorrelated() {
        let policy = JitterPolicy::new(60_000, 0.2);
        let distinct: HashSet<_> = (0..200).map(|_| policy.draw().unwrap()).collect();
        assert!(distinct.len() > 50, "only {} distinct draws", distinct.len());
    }

    #[test]
    fn test_floor_never_reaches_zero() {
        let policy = JitterPolicy::new(1, 1.0);
        assert_eq!(policy.bounds(), Some((1, 2)));
        for _ in 0..100 {
            assert!(policy.draw().unwrap() >= Duration::from_millis(1));
        }
    }

    #[test]
    fn test_zero_spread_is_exact() {
        let policy = JitterPolicy::new(5_000, 0.0);
        assert_eq!(policy.draw(), Some(Duration::from_millis(5_000)));
    }

    #[test]
    fn test_spread_is_clamped() {
        let policy = JitterPolicy::new(100, 4.0);
        assert_eq!(policy.bounds(), Some((1, 200)));

        let policy = JitterPolicy::new(100, f64::NAN);
        assert_eq!(policy.bounds(), Some((100, 100)));
    }
}
