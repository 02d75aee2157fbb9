//! Simple random number generator for reproducibility.
//!
//! This module provides a lightweight xorshift-based PRNG used for weight
//! initialization, minibatch sampling and dropout masks, so that every run
//! is reproducible from a single seed.

/// Xorshift RNG.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

const FALLBACK_STATE: u64 = 0x9e3779b97f4a7c15;

impl SimpleRng {
    /// Create a new RNG with explicit seed (if zero, use a fixed value).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { FALLBACK_STATE } else { seed };
        Self { state }
    }

    /// Derive an independent stream, e.g. one per parameter store or command unit.
    pub fn fork(&mut self, salt: u64) -> SimpleRng {
        let mixed = self.next_u64();
        SimpleRng::new(mixed ^ salt.wrapping_mul(FALLBACK_STATE))
    }

    /// Basic xorshift to generate u32.
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }

    /// Two consecutive draws packed into one 64-bit seed.
    pub fn next_u64(&mut self) -> u64 {
        (self.next_u32() as u64) << 32 | self.next_u32() as u64
    }

    /// Convert to [0, 1). Uses the top 24 bits so the value is exact in f32.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Uniform sample in [low, high).
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    /// Integer sample in [0, upper).
    pub fn gen_usize(&mut self, upper: usize) -> usize {
        if upper == 0 {
            0
        } else {
            (self.next_u32() as usize) % upper
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_deterministic() {
        let mut rng1 = SimpleRng::new(42);
        let mut rng2 = SimpleRng::new(42);

        for _ in 0..100 {
            assert_eq!(rng1.next_u32(), rng2.next_u32());
        }
    }

    #[test]
    fn test_rng_next_f32_range() {
        let mut rng = SimpleRng::new(12345);

        for _ in 0..10_000 {
            let val = rng.next_f32();
            assert!((0.0..1.0).contains(&val));
        }
    }

    #[test]
    fn test_rng_gen_range_f32() {
        let mut rng = SimpleRng::new(67890);

        for _ in 0..1000 {
            let val = rng.gen_range_f32(-1.0, 1.0);
            assert!((-1.0..1.0).contains(&val));
        }
    }

    #[test]
    fn test_rng_gen_usize() {
        let mut rng = SimpleRng::new(11111);

        for _ in 0..1000 {
            assert!(rng.gen_usize(10) < 10);
        }
        assert_eq!(rng.gen_usize(0), 0);
    }

    #[test]
    fn test_fork_is_deterministic_and_distinct() {
        let mut parent1 = SimpleRng::new(7);
        let mut parent2 = SimpleRng::new(7);
        let mut a = parent1.fork(1);
        let mut b = parent2.fork(1);
        assert_eq!(a.next_u32(), b.next_u32());

        let mut parent3 = SimpleRng::new(7);
        let mut c = parent3.fork(2);
        let mut d = SimpleRng::new(7).fork(1);
        assert_ne!(c.next_u32(), d.next_u32());
    }
}
