//! Echo-state reservoir with leaky integration.
//!
//! Recurrent wiring is drawn once at construction from a per-reservoir seed,
//! stored in compressed sparse rows and scaled to the requested spectral
//! radius. Updates never redraw the wiring.
//!
//! Update rule for unit `i`:
//!
//! ```text
//! state[i] = (1 - leak) * state[i] + leak * f(input_scaling * u[i] + (W * state)[i])
//! ```
//!
//! `f` maps into [-1, 1] and the blend is convex, so a state that starts in
//! [-1, 1] stays there for any input.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::prng::Prng;

/// Squashing function applied to the pre-activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Activation {
    #[default]
    Tanh,
    Softsign,
    HardTanh,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::Softsign => x / (1.0 + x.abs()),
            Activation::HardTanh => x.clamp(-1.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReservoirConfig {
    /// Number of state units.
    pub units: usize,
    /// Target magnitude of the largest eigenvalue of the recurrent matrix.
    pub spectral_radius: f64,
    /// Fraction of the new activation blended in each update, in (0, 1].
    pub leak_rate: f64,
    pub input_scaling: f64,
    /// Probability that any given recurrent connection exists.
    pub sparsity: f64,
    pub seed: u64,
    pub activation: Activation,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            units: 64,
            spectral_radius: 0.9,
            leak_rate: 0.3,
            input_scaling: 1.0,
            sparsity: 0.1,
            seed: 0x5EED,
            activation: Activation::Tanh,
        }
    }
}

impl ReservoirConfig {
    pub fn with_units(mut self, units: usize) -> Self {
        self.units = units;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_leak_rate(mut self, leak_rate: f64) -> Self {
        self.leak_rate = leak_rate;
        self
    }

    pub fn with_spectral_radius(mut self, spectral_radius: f64) -> Self {
        self.spectral_radius = spectral_radius;
        self
    }

    pub fn with_input_scaling(mut self, input_scaling: f64) -> Self {
        self.input_scaling = input_scaling;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.units == 0 {
            return Err(ConfigError::Zero { field: "units" });
        }
        if !(self.leak_rate > 0.0 && self.leak_rate <= 1.0) {
            return Err(ConfigError::out_of_range("leak_rate", self.leak_rate, "(0, 1]"));
        }
        if !(self.spectral_radius.is_finite() && self.spectral_radius > 0.0) {
            return Err(ConfigError::out_of_range(
                "spectral_radius",
                self.spectral_radius,
                "finite and > 0",
            ));
        }
        if !(self.sparsity > 0.0 && self.sparsity <= 1.0) {
            return Err(ConfigError::out_of_range("sparsity", self.sparsity, "(0, 1]"));
        }
        if !self.input_scaling.is_finite() {
            return Err(ConfigError::out_of_range(
                "input_scaling",
                self.input_scaling,
                "finite",
            ));
        }
        Ok(())
    }
}

/// Recurrent weights in compressed sparse row form.
#[derive(Debug, Clone, Default)]
pub struct SparseWeights {
    /// Row `i` occupies `columns[offsets[i]..offsets[i + 1]]`.
    offsets: Vec<usize>,
    columns: Vec<usize>,
    values: Vec<f64>,
}

impl SparseWeights {
    fn random(n: usize, density: f64, rng: &mut Prng) -> Self {
        let mut offsets = Vec::with_capacity(n + 1);
        let mut columns = Vec::new();
        let mut values = Vec::new();
        offsets.push(0);
        for _ in 0..n {
            for j in 0..n {
                if rng.chance(density) {
                    columns.push(j);
                    values.push(rng.gen_range_f64(-1.0, 1.0));
                }
            }
            offsets.push(columns.len());
        }
        Self {
            offsets,
            columns,
            values,
        }
    }

    pub fn rows(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// `out = W * x`.
    pub fn mul_into(&self, x: &[f64], out: &mut [f64]) {
        for (i, slot) in out.iter_mut().enumerate().take(self.rows()) {
            let (start, end) = (self.offsets[i], self.offsets[i + 1]);
            *slot = self.columns[start..end]
                .iter()
                .zip(&self.values[start..end])
                .map(|(&j, &w)| w * x[j])
                .sum();
        }
    }

    fn scale(&mut self, factor: f64) {
        for w in &mut self.values {
            *w *= factor;
        }
    }

    /// Estimate of the spectral radius by power iteration.
    ///
    /// Uses the mean log growth over the second half of the iterations, which
    /// also settles for complex-conjugate dominant pairs. Starts from a fixed
    /// vector so the estimate is homogeneous: scaling the matrix by `c` scales
    /// the estimate by `c`.
    pub fn spectral_radius_estimate(&self, iterations: usize) -> f64 {
        let n = self.rows();
        if n == 0 || self.nnz() == 0 {
            return 0.0;
        }
        let iterations = iterations.max(2);
        let mut v = vec![1.0 / (n as f64).sqrt(); n];
        let mut next = vec![0.0; n];
        let mut log_growth = 0.0;
        let mut counted = 0usize;

        for k in 0..iterations {
            self.mul_into(&v, &mut next);
            let norm = next.iter().map(|x| x * x).sum::<f64>().sqrt();
            if norm <= f64::MIN_POSITIVE {
                // Nilpotent along this start vector.
                return 0.0;
            }
            if k >= iterations / 2 {
                log_growth += norm.ln();
                counted += 1;
            }
            for (dst, src) in v.iter_mut().zip(&next) {
                *dst = src / norm;
            }
        }
        (log_growth / counted as f64).exp()
    }
}

const POWER_ITERATIONS: usize = 96;
const INITIAL_STATE_SPREAD: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct ReservoirUnit {
    cfg: ReservoirConfig,
    weights: SparseWeights,
    state: Vec<f64>,
    initial: Vec<f64>,
    recurrent: Vec<f64>,
    activation_level: f64,
    updates: u64,
}

impl ReservoirUnit {
    pub fn new(cfg: ReservoirConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let n = cfg.units;
        let mut rng = Prng::new(cfg.seed);

        let mut weights = SparseWeights::random(n, cfg.sparsity, &mut rng);
        let estimate = weights.spectral_radius_estimate(POWER_ITERATIONS);
        if estimate > 1e-12 {
            weights.scale(cfg.spectral_radius / estimate);
        }

        let initial: Vec<f64> = (0..n)
            .map(|_| rng.gen_range_f64(-INITIAL_STATE_SPREAD, INITIAL_STATE_SPREAD))
            .collect();
        let activation_level = mean_abs(&initial);

        Ok(Self {
            cfg,
            weights,
            state: initial.clone(),
            initial,
            recurrent: vec![0.0; n],
            activation_level,
            updates: 0,
        })
    }

    pub fn config(&self) -> &ReservoirConfig {
        &self.cfg
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn weights(&self) -> &SparseWeights {
        &self.weights
    }

    /// Mean absolute state value, in [0, 1].
    pub fn activation_level(&self) -> f64 {
        self.activation_level
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// One leaky-integrated step. Inputs shorter than the reservoir are tiled;
    /// an empty input means zero drive.
    pub fn update(&mut self, input: &[f64]) -> &[f64] {
        let leak = self.cfg.leak_rate;
        let scaling = self.cfg.input_scaling;
        let activation = self.cfg.activation;

        self.weights.mul_into(&self.state, &mut self.recurrent);

        for (i, (s, r)) in self.state.iter_mut().zip(&self.recurrent).enumerate() {
            let u = if input.is_empty() {
                0.0
            } else {
                input[i % input.len()]
            };
            let pre = scaling * u + r;
            *s = (1.0 - leak) * *s + leak * activation.apply(pre);
        }

        self.activation_level = mean_abs(&self.state);
        self.updates += 1;
        &self.state
    }

    /// Convex blend of the state toward `target`. Only the overlapping prefix
    /// is touched.
    pub fn blend_toward(&mut self, target: &[f64], amount: f64) {
        let amount = amount.clamp(0.0, 1.0);
        if amount == 0.0 {
            return;
        }
        for (s, t) in self.state.iter_mut().zip(target) {
            *s = if amount == 1.0 { *t } else { *s + amount * (t - *s) };
        }
        self.activation_level = mean_abs(&self.state);
    }

    pub fn reset(&mut self) {
        self.state.copy_from_slice(&self.initial);
        self.activation_level = mean_abs(&self.state);
        self.updates = 0;
    }
}

fn mean_abs(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    v.iter().map(|x| x.abs()).sum::<f64>() / v.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(seed: u64) -> ReservoirUnit {
        ReservoirUnit::new(ReservoirConfig::default().with_units(48).with_seed(seed)).unwrap()
    }

    #[test]
    fn guard_rejects_bad_leak_and_radius() {
        let bad_leak = ReservoirConfig::default().with_leak_rate(0.0);
        assert!(matches!(
            ReservoirUnit::new(bad_leak),
            Err(ConfigError::OutOfRange { field: "leak_rate", .. })
        ));
        let over = ReservoirConfig::default().with_leak_rate(1.01);
        assert!(ReservoirUnit::new(over).is_err());
        let full = ReservoirConfig::default().with_leak_rate(1.0);
        assert!(ReservoirUnit::new(full).is_ok());

        let bad_radius = ReservoirConfig::default().with_spectral_radius(0.0);
        assert!(matches!(
            ReservoirUnit::new(bad_radius),
            Err(ConfigError::OutOfRange { field: "spectral_radius", .. })
        ));
        let nan_radius = ReservoirConfig::default().with_spectral_radius(f64::NAN);
        assert!(ReservoirUnit::new(nan_radius).is_err());
    }

    #[test]
    fn wiring_is_seeded_and_scaled() {
        let a = unit(11);
        let b = unit(11);
        assert_eq!(a.state(), b.state());
        assert_eq!(a.weights().nnz(), b.weights().nnz());

        let est = a.weights().spectral_radius_estimate(POWER_ITERATIONS);
        assert!((est - 0.9).abs() < 1e-9, "estimate {est}");
    }

    #[test]
    fn wiring_does_not_change_across_updates() {
        let mut r = unit(3);
        let before = r.weights().values.clone();
        for _ in 0..20 {
            r.update(&[0.5, -0.25]);
        }
        assert_eq!(before, r.weights().values);
    }

    #[test]
    fn state_stays_bounded() {
        for activation in [Activation::Tanh, Activation::Softsign, Activation::HardTanh] {
            let cfg = ReservoirConfig::default()
                .with_units(32)
                .with_seed(5)
                .with_spectral_radius(3.0)
                .with_input_scaling(4.0)
                .with_leak_rate(1.0)
                .with_activation(activation);
            let mut r = ReservoirUnit::new(cfg).unwrap();
            let mut rng = Prng::new(77);
            for _ in 0..300 {
                let input: Vec<f64> = (0..7).map(|_| rng.gen_range_f64(-1.0, 1.0)).collect();
                let state = r.update(&input);
                assert!(state.iter().all(|x| (-1.0..=1.0).contains(x)));
                assert!((0.0..=1.0).contains(&r.activation_level()));
            }
        }
    }

    #[test]
    fn empty_input_is_zero_drive() {
        let mut a = unit(9);
        let mut b = unit(9);
        a.update(&[]);
        b.update(&[0.0]);
        assert_eq!(a.state(), b.state());
    }

    #[test]
    fn blend_and_reset() {
        let mut r = unit(21);
        let initial = r.state().to_vec();
        let target = vec![0.5; 10];
        r.blend_toward(&target, 1.0);
        assert!(r.state()[..10].iter().all(|&x| x == 0.5));
        assert_eq!(r.state()[10..], initial[10..]);

        let mut half = unit(21);
        let before = half.state()[0];
        half.blend_toward(&[1.0], 0.5);
        assert!((half.state()[0] - (before + 1.0) / 2.0).abs() < 1e-12);

        r.update(&[1.0]);
        r.reset();
        assert_eq!(r.state(), initial.as_slice());
        assert_eq!(r.updates(), 0);
    }
}
