//! Differential-privacy noise for released aggregates.
//!
//! The mechanism is a closed set of variants rather than a trait object:
//! either no noise, or Laplace noise calibrated to the declared global
//! sensitivity. Every round draws its samples from an RNG seeded with the
//! seed persisted on the round row, so a committed round's noise can be
//! reproduced after the fact.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NoiseMechanism {
    /// Release aggregates unperturbed.
    None,
    /// Additive `Lap(scale)` noise, `scale = sensitivity / epsilon`.
    Laplace { scale: f64 },
}

impl NoiseMechanism {
    /// Mechanism for a round with per-round budget `epsilon`. A zero (or
    /// negative) epsilon means the round is released without noise.
    pub fn for_round(epsilon: f64, sensitivity: f64) -> Self {
        if epsilon > 0.0 {
            Self::Laplace {
                scale: sensitivity / epsilon,
            }
        } else {
            Self::None
        }
    }

    /// Perturb one released utility. Returns `None` when the post-noise
    /// value is not positive, in which case the group is dropped from the
    /// release.
    pub fn apply(&self, rng: &mut StdRng, utility: f64) -> Option<f64> {
        let noisy = match self {
            Self::None => utility,
            Self::Laplace { scale } => utility + scale * sample_unit_laplace(rng),
        };

        (noisy > 0.0).then_some(noisy)
    }
}

pub fn round_rng(seed: i64) -> StdRng {
    StdRng::seed_from_u64(seed as u64)
}

/// Standard Laplace sample (location 0, scale 1) via the inverse CDF.
fn sample_unit_laplace(rng: &mut StdRng) -> f64 {
    let u: f64 = rng.gen::<f64>() - 0.5;
    -u.signum() * (1.0 - 2.0 * u.abs()).ln()
}

/// Whether opening a round with `requested` epsilon would exceed the
/// cumulative cap, given the epsilon already consumed by earlier rounds.
pub fn budget_exhausted(consumed: f64, requested: f64, cap: f64) -> bool {
    consumed + requested > cap
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn zero_epsilon_releases_exact_utilities() {
        let mechanism = NoiseMechanism::for_round(0.0, 1.0);
        assert_eq!(mechanism, NoiseMechanism::None);

        let mut rng = round_rng(7);
        assert_eq!(mechanism.apply(&mut rng, 42.0), Some(42.0));
    }

    #[test]
    fn non_positive_noisy_utilities_are_dropped() {
        let mechanism = NoiseMechanism::None;
        let mut rng = round_rng(7);

        assert_eq!(mechanism.apply(&mut rng, 0.0), None);
        assert_eq!(mechanism.apply(&mut rng, -1.0), None);
    }

    #[test]
    fn same_seed_reproduces_the_same_noise() {
        let mechanism = NoiseMechanism::for_round(1.0, 1.0);

        let draw = |seed| {
            let mut rng = round_rng(seed);
            (0..16)
                .map(|_| mechanism.apply(&mut rng, 1000.0))
                .collect::<Vec<_>>()
        };

        assert_eq!(draw(42), draw(42));
        assert_ne!(draw(42), draw(43));
    }

    #[test]
    fn laplace_noise_is_centered_with_thin_tails() {
        // epsilon = 1, sensitivity = 1 -> unit scale.
        let mut rng = round_rng(12345);
        let samples: Vec<f64> = (0..10_000).map(|_| sample_unit_laplace(&mut rng)).collect();

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!(mean.abs() < 0.1, "empirical mean {mean} strays from zero");

        // P(|Lap(1)| > 5) = e^-5, about 0.67%.
        let outliers = samples.iter().filter(|s| s.abs() > 5.0).count();
        assert!(
            outliers <= samples.len() / 100,
            "{outliers} of {} samples exceeded 5",
            samples.len()
        );
    }

    #[test_case(0.0, 1.0, 10.0, false; "fresh budget")]
    #[test_case(9.0, 1.0, 10.0, false; "consumes exactly the cap")]
    #[test_case(9.5, 1.0, 10.0, true; "would exceed the cap")]
    #[test_case(10.0, 0.1, 10.0, true; "cap already consumed")]
    fn budget_accounting_caps_cumulative_epsilon(
        consumed: f64,
        requested: f64,
        cap: f64,
        exhausted: bool,
    ) {
        assert_eq!(budget_exhausted(consumed, requested, cap), exhausted);
    }
}
