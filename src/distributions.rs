/*!
Densities and samplers used by the world model and the move set.

Everything here is a pure function of its arguments (plus a caller-supplied RNG), so the
same helpers serve both the generative model and the Metropolis–Hastings ratios.

The module provides:

- log-densities of the normal, uniform, Poisson and shifted exponential laws,
- samplers for the same laws, driven by any [`rand::Rng`],
- [`Categorical`], a discrete distribution built from unnormalized log-weights,
- [`TruncatedNormal`], sampled by rejection with a bounded number of attempts,
- [`log_sum_exp`] and a tail-accurate [`ln_erfc`].

# Examples

```rust
use blip_mcmc::distributions::{Categorical, DiscreteDistribution, TruncatedNormal};
use rand::rngs::SmallRng;
use rand::SeedableRng;

let mut rng = SmallRng::seed_from_u64(42);

let cat = Categorical::from_log_weights(&[0.0, 0.0, f64::NEG_INFINITY]).unwrap();
let index = cat.sample(&mut rng);
assert!(index < 2);
assert!((cat.log_prob(0) - 0.5f64.ln()).abs() < 1e-12);

let tn = TruncatedNormal::new(0.0, 1.0, 2.0, f64::INFINITY);
let x = tn.sample(&mut rng).unwrap();
assert!(x >= 2.0);
```
*/

use num_traits::Float;
use rand::Rng;
use rand_distr::{Exp1, Poisson, StandardNormal};
use std::f64::consts::{FRAC_1_SQRT_2, PI};

use crate::error::{Error, Result};

/// Attempts a rejection sampler may make before the run is declared broken.
pub const MAX_REJECTION_ATTEMPTS: usize = 100_000;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// A discrete distribution whose outcomes are indices.
pub trait DiscreteDistribution {
    /// Samples an index from the distribution.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize;
    /// Evaluates the log-probability of the given index.
    fn log_prob(&self, index: usize) -> f64;
}

/// Log-density of `N(mean, std_dev^2)` at `x`.
pub fn normal_log_pdf(x: f64, mean: f64, std_dev: f64) -> f64 {
    let z = (x - mean) / std_dev;
    -0.5 * z * z - std_dev.ln() - LN_SQRT_2PI
}

/// Log-density of the uniform distribution on `[lower, upper]`.
pub fn uniform_log_pdf(x: f64, lower: f64, upper: f64) -> f64 {
    if x < lower || x > upper {
        f64::NEG_INFINITY
    } else {
        -(upper - lower).ln()
    }
}

/// Log-density of `floor + Exp(rate)` at `x`.
pub fn shifted_exponential_log_pdf(x: f64, floor: f64, rate: f64) -> f64 {
    if x < floor {
        f64::NEG_INFINITY
    } else {
        rate.ln() - rate * (x - floor)
    }
}

/// `ln(k!)`, exact summation for small `k` and Stirling's series beyond.
pub fn ln_factorial(k: usize) -> f64 {
    if k < 32 {
        (2..=k).map(|i| (i as f64).ln()).sum()
    } else {
        let n = k as f64;
        n * n.ln() - n + 0.5 * (2.0 * PI * n).ln() + 1.0 / (12.0 * n) - 1.0 / (360.0 * n.powi(3))
    }
}

/// Log-probability of `k` under `Poisson(rate)`.
pub fn poisson_log_pmf(k: usize, rate: f64) -> f64 {
    k as f64 * rate.ln() - rate - ln_factorial(k)
}

pub fn sample_normal<R: Rng + ?Sized>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    mean + std_dev * z
}

pub fn sample_uniform<R: Rng + ?Sized>(rng: &mut R, lower: f64, upper: f64) -> f64 {
    rng.gen_range(lower..upper)
}

pub fn sample_shifted_exponential<R: Rng + ?Sized>(rng: &mut R, floor: f64, rate: f64) -> f64 {
    let e: f64 = rng.sample(Exp1);
    floor + e / rate
}

pub fn sample_poisson<R: Rng + ?Sized>(rng: &mut R, rate: f64) -> Result<usize> {
    let poisson = Poisson::new(rate)
        .map_err(|e| Error::Config(format!("bad Poisson rate {rate}: {e}")))?;
    let k: f64 = rng.sample(poisson);
    Ok(k as usize)
}

/// Numerically stable `ln(sum(exp(values)))`. Returns `-inf` for an empty slice.
pub fn log_sum_exp<T: Float>(values: &[T]) -> T {
    let max = values
        .iter()
        .cloned()
        .fold(T::neg_infinity(), |acc, v| if v > acc { v } else { acc });
    if max == T::neg_infinity() {
        return T::neg_infinity();
    }
    if max == T::infinity() {
        return T::infinity();
    }
    let sum = values
        .iter()
        .fold(T::zero(), |acc, &v| acc + (v - max).exp());
    max + sum.ln()
}

/// `ln(erfc(x))`, accurate in the far right tail where `erfc` itself underflows.
///
/// Uses the Chebyshev fit from *Numerical Recipes* (fractional error below 1.2e-7).
pub fn ln_erfc(x: f64) -> f64 {
    if x < 0.0 {
        return (2.0 - ln_erfc(-x).exp()).ln();
    }
    let t = 1.0 / (1.0 + 0.5 * x);
    let poly = -1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87
                                    + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    t.ln() - x * x + poly
}

/// Error function with full relative precision near zero.
pub fn erf(x: f64) -> f64 {
    if x.abs() < 0.5 {
        // Maclaurin series; the tail beyond eight terms is below 1e-12 here.
        let x2 = x * x;
        let mut term = x;
        let mut sum = x;
        for n in 1..8 {
            term *= -x2 / n as f64;
            sum += term / (2 * n + 1) as f64;
        }
        2.0 / PI.sqrt() * sum
    } else if x > 0.0 {
        1.0 - ln_erfc(x).exp()
    } else {
        ln_erfc(-x).exp() - 1.0
    }
}

/// `ln(Phi(beta) - Phi(alpha))` for the standard normal CDF `Phi`, with `alpha < beta`.
pub fn standard_normal_log_mass(alpha: f64, beta: f64) -> f64 {
    if !(alpha < beta) {
        return f64::NEG_INFINITY;
    }
    if alpha >= 0.0 {
        let la = ln_erfc(alpha * FRAC_1_SQRT_2);
        let lb = if beta.is_infinite() {
            f64::NEG_INFINITY
        } else {
            ln_erfc(beta * FRAC_1_SQRT_2)
        };
        0.5f64.ln() + la + (-(lb - la).exp()).ln_1p()
    } else if beta <= 0.0 {
        standard_normal_log_mass(-beta, -alpha)
    } else {
        let upper = if beta.is_infinite() { 1.0 } else { erf(beta * FRAC_1_SQRT_2) };
        let lower = if alpha.is_infinite() { 1.0 } else { erf(-alpha * FRAC_1_SQRT_2) };
        (0.5 * (upper + lower)).ln()
    }
}

/**
A categorical distribution over indices, built from unnormalized log-weights.

Indices with weight `-inf` are never drawn and report `-inf` log-probability.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct Categorical {
    pub log_probs: Vec<f64>,
}

impl Categorical {
    /// Normalizes `log_weights`. Returns `None` when no index has positive weight or
    /// a weight is NaN.
    ///
    /// Infinite weights dominate every finite one, so when any are present the mass
    /// is spread evenly over them.
    pub fn from_log_weights(log_weights: &[f64]) -> Option<Self> {
        if log_weights.iter().any(|w| w.is_nan()) {
            return None;
        }
        let n_infinite = log_weights.iter().filter(|&&w| w == f64::INFINITY).count();
        if n_infinite > 0 {
            let share = -(n_infinite as f64).ln();
            return Some(Self {
                log_probs: log_weights
                    .iter()
                    .map(|&w| if w == f64::INFINITY { share } else { f64::NEG_INFINITY })
                    .collect(),
            });
        }
        let total = log_sum_exp(log_weights);
        if !total.is_finite() {
            return None;
        }
        Some(Self {
            log_probs: log_weights.iter().map(|w| w - total).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.log_probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_probs.is_empty()
    }
}

impl DiscreteDistribution for Categorical {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let r: f64 = rng.gen();
        let mut cum = 0.0;
        let mut last_valid = 0;
        for (i, &lp) in self.log_probs.iter().enumerate() {
            if lp == f64::NEG_INFINITY {
                continue;
            }
            last_valid = i;
            cum += lp.exp();
            if r < cum {
                return i;
            }
        }
        last_valid
    }

    fn log_prob(&self, index: usize) -> f64 {
        self.log_probs
            .get(index)
            .copied()
            .unwrap_or(f64::NEG_INFINITY)
    }
}

/**
A normal distribution restricted to `[lower, upper]`. Either bound may be infinite.

Sampling is by rejection, choosing the envelope by where the interval sits:
the plain normal for wide central intervals, a uniform envelope for narrow ones and
a translated exponential for one-sided tails. Every strategy gives up after
[`MAX_REJECTION_ATTEMPTS`].
*/
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruncatedNormal {
    pub mean: f64,
    pub std_dev: f64,
    pub lower: f64,
    pub upper: f64,
}

impl TruncatedNormal {
    pub fn new(mean: f64, std_dev: f64, lower: f64, upper: f64) -> Self {
        Self {
            mean,
            std_dev,
            lower,
            upper,
        }
    }

    fn alpha(&self) -> f64 {
        (self.lower - self.mean) / self.std_dev
    }

    fn beta(&self) -> f64 {
        (self.upper - self.mean) / self.std_dev
    }

    /// Log of the probability mass the untruncated normal puts on the interval.
    pub fn log_mass(&self) -> f64 {
        standard_normal_log_mass(self.alpha(), self.beta())
    }

    pub fn log_pdf(&self, x: f64) -> f64 {
        if x < self.lower || x > self.upper {
            return f64::NEG_INFINITY;
        }
        normal_log_pdf(x, self.mean, self.std_dev) - self.log_mass()
    }

    pub fn cdf(&self, x: f64) -> f64 {
        if x <= self.lower {
            return 0.0;
        }
        if x >= self.upper {
            return 1.0;
        }
        let z = (x - self.mean) / self.std_dev;
        (standard_normal_log_mass(self.alpha(), z) - self.log_mass()).exp()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64> {
        let (alpha, beta) = (self.alpha(), self.beta());
        let z = if alpha >= 0.0 {
            sample_standard_tail(rng, alpha, beta)
        } else if beta <= 0.0 {
            sample_standard_tail(rng, -beta, -alpha).map(|z| -z)
        } else {
            sample_standard_central(rng, alpha, beta)
        };
        match z {
            Some(z) => Ok((self.mean + self.std_dev * z).clamp(self.lower, self.upper)),
            None => Err(Error::RejectionBudgetExhausted {
                attempts: MAX_REJECTION_ATTEMPTS,
                mean: self.mean,
                std_dev: self.std_dev,
                lower: self.lower,
                upper: self.upper,
            }),
        }
    }
}

/// Standard normal restricted to `[alpha, beta]` with `alpha < 0 < beta`.
fn sample_standard_central<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> Option<f64> {
    if beta - alpha < (2.0 * PI).sqrt() {
        for _ in 0..MAX_REJECTION_ATTEMPTS {
            let z = rng.gen_range(alpha..=beta);
            if rng.gen::<f64>() <= (-0.5 * z * z).exp() {
                return Some(z);
            }
        }
    } else {
        for _ in 0..MAX_REJECTION_ATTEMPTS {
            let z: f64 = rng.sample(StandardNormal);
            if z >= alpha && z <= beta {
                return Some(z);
            }
        }
    }
    None
}

/// Standard normal restricted to `[alpha, beta]` with `0 <= alpha`, after Robert (1995).
fn sample_standard_tail<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> Option<f64> {
    if !(alpha < beta) {
        return None;
    }
    let root = (alpha * alpha + 4.0).sqrt();
    let rate = 0.5 * (alpha + root);
    let uniform_cutoff = alpha
        + 2.0 * std::f64::consts::E.sqrt() / (alpha + root)
            * ((alpha * alpha - alpha * root) / 4.0).exp();
    if beta < uniform_cutoff {
        for _ in 0..MAX_REJECTION_ATTEMPTS {
            let z = rng.gen_range(alpha..=beta);
            if rng.gen::<f64>() <= (0.5 * (alpha * alpha - z * z)).exp() {
                return Some(z);
            }
        }
    } else {
        for _ in 0..MAX_REJECTION_ATTEMPTS {
            let e: f64 = rng.sample(Exp1);
            let z = alpha + e / rate;
            if z > beta {
                continue;
            }
            if rng.gen::<f64>() <= (-0.5 * (z - rate) * (z - rate)).exp() {
                return Some(z);
            }
        }
    }
    None
}
