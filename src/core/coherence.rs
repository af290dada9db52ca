//! Agreement between stream states.
//!
//! Coherence is cosine similarity remapped from [-1, 1] to [0, 1]. Everything
//! here is a pure function of the snapshots it is handed.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const ZERO_NORM: f64 = 1e-12;

/// Coherence of two state vectors over their common prefix.
///
/// Both vectors zero (or no overlap) count as fully coherent; exactly one zero
/// vector is neutral (0.5).
pub fn pairwise_coherence(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);

    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let (na, nb) = (na.sqrt(), nb.sqrt());

    match (na <= ZERO_NORM, nb <= ZERO_NORM) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.5,
        (false, false) => {
            let sim = (dot / (na * nb)).clamp(-1.0, 1.0);
            (sim + 1.0) / 2.0
        }
    }
}

/// Symmetric matrix of pairwise coherence, unit diagonal.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CoherenceMatrix {
    n: usize,
    values: Vec<f64>,
}

impl CoherenceMatrix {
    pub fn identity(n: usize) -> Self {
        let mut values = vec![0.0; n * n];
        for i in 0..n {
            values[i * n + i] = 1.0;
        }
        Self { n, values }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.n + j]
    }

    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        self.values[i * self.n + j] = value;
        self.values[j * self.n + i] = value;
    }

    /// Mean over unordered pairs; 1.0 with fewer than two members.
    pub fn aggregate(&self) -> f64 {
        if self.n < 2 {
            return 1.0;
        }
        let mut sum = 0.0;
        let mut pairs = 0usize;
        for i in 0..self.n {
            for j in (i + 1)..self.n {
                sum += self.get(i, j);
                pairs += 1;
            }
        }
        sum / pairs as f64
    }

    /// Mean coherence of member `i` with every other member.
    pub fn member_coherence(&self, i: usize) -> f64 {
        if self.n < 2 {
            return 1.0;
        }
        let sum: f64 = (0..self.n).filter(|&j| j != i).map(|j| self.get(i, j)).sum();
        sum / (self.n - 1) as f64
    }

    pub fn rows(&self) -> Vec<Vec<f64>> {
        self.values.chunks(self.n.max(1)).map(|r| r.to_vec()).collect()
    }
}

/// Every unordered index pair `(i, j)` with `i < j`.
pub fn pairs(n: usize) -> Vec<(usize, usize)> {
    (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoherenceComputer;

impl CoherenceComputer {
    pub fn matrix<S: AsRef<[f64]> + Sync>(&self, states: &[S]) -> CoherenceMatrix {
        let pairs = pairs(states.len());

        #[cfg(feature = "parallel")]
        let values: Vec<f64> = pairs
            .par_iter()
            .map(|&(i, j)| pairwise_coherence(states[i].as_ref(), states[j].as_ref()))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let values: Vec<f64> = pairs
            .iter()
            .map(|&(i, j)| pairwise_coherence(states[i].as_ref(), states[j].as_ref()))
            .collect();

        let mut m = CoherenceMatrix::identity(states.len());
        for (&(i, j), v) in pairs.iter().zip(values) {
            m.set(i, j, v);
        }
        m
    }

    pub fn aggregate<S: AsRef<[f64]> + Sync>(&self, states: &[S]) -> f64 {
        self.matrix(states).aggregate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_coherence_is_one() {
        let v = [0.3, -0.7, 0.1, 0.9];
        assert!((pairwise_coherence(&v, &v) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn opposite_and_orthogonal() {
        assert!(pairwise_coherence(&[1.0, 0.0], &[-1.0, 0.0]).abs() < 1e-12);
        assert!((pairwise_coherence(&[1.0, 0.0], &[0.0, 1.0]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn truncates_to_shorter_vector() {
        let a = [0.5, 0.5, 0.9];
        let b = [0.5, 0.5];
        assert!((pairwise_coherence(&a, &b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_vectors() {
        assert_eq!(pairwise_coherence(&[0.0, 0.0], &[0.0, 0.0]), 1.0);
        assert_eq!(pairwise_coherence(&[], &[0.4]), 1.0);
        assert_eq!(pairwise_coherence(&[0.0, 0.0], &[0.2, 0.1]), 0.5);
    }

    #[test]
    fn aggregate_is_pure_and_defined_for_small_sets() {
        let computer = CoherenceComputer;
        let states = vec![vec![0.2, 0.4, -0.1], vec![0.3, -0.2, 0.5], vec![-0.6, 0.1, 0.2]];
        let first = computer.aggregate(&states);
        let second = computer.aggregate(&states);
        assert_eq!(first, second);
        assert!((0.0..=1.0).contains(&first));

        let one: Vec<Vec<f64>> = vec![vec![1.0]];
        assert_eq!(computer.aggregate(&one), 1.0);
        let none: Vec<Vec<f64>> = Vec::new();
        assert_eq!(computer.aggregate(&none), 1.0);
    }

    #[test]
    fn matrix_is_symmetric_with_member_means() {
        let states = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0]];
        let m = CoherenceComputer.matrix(&states);
        assert_eq!(m.get(0, 1), m.get(1, 0));
        assert_eq!(m.get(0, 2), 1.0);
        assert!((m.member_coherence(0) - 0.75).abs() < 1e-12);
        assert!((m.aggregate() - (0.5 + 1.0 + 0.5) / 3.0).abs() < 1e-12);
        assert_eq!(pairs(3), vec![(0, 1), (0, 2), (1, 2)]);
    }
}
