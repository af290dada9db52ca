// Seeded PRNG for reservoir wiring and initial states.
//
// Not cryptographically secure. One generator is seeded per reservoir at
// construction so that wiring is reproducible run to run.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

const ZERO_STATE_REPLACEMENT: u64 = 0x9E37_79B9_7F4A_7C15;

impl Prng {
    pub fn new(seed: u64) -> Self {
        // xorshift has a fixed point at zero.
        let state = if seed == 0 {
            ZERO_STATE_REPLACEMENT
        } else {
            seed
        };
        Self { state }
    }

    /// Derive an independent generator for a sub-component (e.g. one stream).
    pub fn fork(&mut self, salt: u64) -> Self {
        let mixed = self.next_u64() ^ salt.wrapping_mul(0xBF58_476D_1CE4_E5B9);
        Self::new(mixed)
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform in [0, 1) with 53 bits of precision.
    #[inline]
    pub fn next_f64_01(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    #[inline]
    pub fn gen_range_f64(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64_01()
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u64;
        low + (self.next_u64() % span) as usize
    }

    /// Bernoulli draw.
    #[inline]
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64_01() < p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn zero_seed_is_usable() {
        let mut rng = Prng::new(0);
        let first = rng.next_u64();
        assert_ne!(first, 0);
        assert_ne!(first, rng.next_u64());
    }

    #[test]
    fn ranges_stay_in_bounds() {
        let mut rng = Prng::new(99);
        for _ in 0..1000 {
            let x = rng.gen_range_f64(-0.1, 0.1);
            assert!((-0.1..0.1).contains(&x));
            let k = rng.gen_range_usize(3, 9);
            assert!((3..9).contains(&k));
        }
        assert_eq!(rng.gen_range_usize(5, 5), 5);
    }

    #[test]
    fn forks_diverge() {
        let mut root = Prng::new(1);
        let mut a = root.fork(0);
        let mut b = root.fork(1);
        assert_ne!(a.next_u64(), b.next_u64());
    }
}
