//! Running statistics of a single chain and the multi-chain R-value
//! convergence diagnostic.

use ndarray::prelude::*;
use ndarray_stats::CorrelationExt;

use crate::core::State;
use crate::error::{Error, Result};

/// How a single iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
    /// The density could not be evaluated at the proposed point.
    Invalid,
}

/// Per-chain aggregate, updated after every iteration with Welford's method.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub iterations_total: u64,
    pub iterations_accepted: u64,
    pub iterations_rejected: u64,
    pub iterations_invalid: u64,
    /// Largest log density seen so far.
    pub mode: f64,
    pub parameters_at_mode: Vec<f64>,
    pub mean_of_parameters: Vec<f64>,
    pub variance_of_parameters: Vec<f64>,
    pub mean_of_log_density: f64,
    pub variance_of_log_density: f64,
    // sums of squared deviations
    m2_parameters: Vec<f64>,
    m2_log_density: f64,
    // log densities enter the moments only when finite
    n_log_density: u64,
}

impl Stats {
    pub fn new(dimension: usize) -> Self {
        Self {
            iterations_total: 0,
            iterations_accepted: 0,
            iterations_rejected: 0,
            iterations_invalid: 0,
            mode: f64::NEG_INFINITY,
            parameters_at_mode: vec![f64::NAN; dimension],
            mean_of_parameters: vec![0.0; dimension],
            variance_of_parameters: vec![0.0; dimension],
            mean_of_log_density: 0.0,
            variance_of_log_density: 0.0,
            m2_parameters: vec![0.0; dimension],
            m2_log_density: 0.0,
            n_log_density: 0,
        }
    }

    /// Accounts for one iteration that left the chain at `current`.
    pub fn record(&mut self, current: &State, outcome: Outcome) {
        match outcome {
            Outcome::Accepted => self.iterations_accepted += 1,
            Outcome::Rejected => self.iterations_rejected += 1,
            Outcome::Invalid => self.iterations_invalid += 1,
        }
        self.iterations_total += 1;
        self.update_mode(&current.point, current.log_density);

        let n = self.iterations_total as f64;
        for (i, &x) in current.point.iter().enumerate() {
            let delta = x - self.mean_of_parameters[i];
            self.mean_of_parameters[i] += delta / n;
            self.m2_parameters[i] += delta * (x - self.mean_of_parameters[i]);
            self.variance_of_parameters[i] = if n > 1.0 {
                self.m2_parameters[i] / (n - 1.0)
            } else {
                0.0
            };
        }

        if current.log_density.is_finite() {
            self.n_log_density += 1;
            let n = self.n_log_density as f64;
            let delta = current.log_density - self.mean_of_log_density;
            self.mean_of_log_density += delta / n;
            self.m2_log_density += delta * (current.log_density - self.mean_of_log_density);
            self.variance_of_log_density = if n > 1.0 {
                self.m2_log_density / (n - 1.0)
            } else {
                0.0
            };
        }
    }

    /// Replaces the mode if `log_density` beats it. Returns whether it did.
    pub fn update_mode(&mut self, point: &[f64], log_density: f64) -> bool {
        if log_density.is_finite() && log_density > self.mode {
            self.mode = log_density;
            self.parameters_at_mode.clear();
            self.parameters_at_mode.extend_from_slice(point);
            true
        } else {
            false
        }
    }

    /// Whether a finite mode has been seen.
    pub fn has_mode(&self) -> bool {
        self.mode.is_finite()
    }

    /// Clears counters and moments. A hard reset forgets the mode as well.
    pub fn reset(&mut self, hard: bool) {
        let mut fresh = Stats::new(self.mean_of_parameters.len());
        if !hard {
            fresh.mode = self.mode;
            fresh.parameters_at_mode = std::mem::take(&mut self.parameters_at_mode);
        }
        *self = fresh;
    }

    /// Fraction of evaluated proposals that were accepted.
    pub fn efficiency(&self) -> f64 {
        efficiency(self.iterations_accepted, self.iterations_rejected)
    }
}

pub(crate) fn efficiency(accepted: u64, rejected: u64) -> f64 {
    let evaluated = accepted + rejected;
    if evaluated == 0 {
        0.0
    } else {
        accepted as f64 / evaluated as f64
    }
}

fn points(states: &[State]) -> Array2<f64> {
    let dim = states.first().map_or(0, State::dimension);
    Array2::from_shape_fn((states.len(), dim), |(i, j)| states[i].point[j])
}

/// Sample mean and variance of every parameter over a window of states.
pub fn mean_and_variance(states: &[State]) -> (Vec<f64>, Vec<f64>) {
    let data = points(states);
    let dim = data.ncols();
    let Some(mean) = data.mean_axis(Axis(0)) else {
        return (vec![0.0; dim], vec![0.0; dim]);
    };
    let variance = if states.len() > 1 {
        data.var_axis(Axis(0), 1.0)
    } else {
        Array1::zeros(dim)
    };
    (mean.to_vec(), variance.to_vec())
}

/// Sample mean and variance of the log density over a window of states.
pub fn log_density_mean_and_variance(states: &[State]) -> (f64, f64) {
    let values = Array1::from_iter(states.iter().map(|s| s.log_density));
    let mean = values.mean().unwrap_or(0.0);
    let variance = if values.len() > 1 {
        values.var(1.0)
    } else {
        0.0
    };
    (mean, variance)
}

/// Sample covariance (`ddof = 1`) of the points in a window.
pub fn covariance(states: &[State]) -> Result<Array2<f64>> {
    if states.len() < 2 {
        return Err(Error::Adaptation(format!(
            "need at least 2 states to estimate a covariance, got {}",
            states.len()
        )));
    }
    points(states)
        .t()
        .cov(1.0)
        .map_err(|e| Error::Adaptation(e.to_string()))
}

/// The two supported definitions of the R-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RValueDefinition {
    /// Gelman-Rubin including the correction for the sampling variability
    /// of the variance estimate.
    Strict,
    /// `sqrt(σ̂² / W)` without the correction.
    Relaxed,
}

impl RValueDefinition {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            RValueDefinition::Strict
        } else {
            RValueDefinition::Relaxed
        }
    }

    pub fn compute(&self, chain_means: &[f64], chain_variances: &[f64], n: usize) -> Result<f64> {
        match self {
            RValueDefinition::Strict => rvalue::gelman_rubin(chain_means, chain_variances, n),
            RValueDefinition::Relaxed => rvalue::approximation(chain_means, chain_variances, n),
        }
    }
}

/// R-values of every parameter and of the log density across chains.
#[derive(Debug, Clone, PartialEq)]
pub struct RValues {
    pub parameters: Vec<f64>,
    pub posterior: f64,
}

impl RValues {
    /// Computes R-values from one window of states per chain. The shortest
    /// window sets the chain length `N`.
    pub fn compute(windows: &[&[State]], definition: RValueDefinition) -> Result<Self> {
        if windows.len() < 2 {
            return Err(Error::RValue(format!(
                "need at least two chains, got {}",
                windows.len()
            )));
        }
        let n = windows.iter().map(|w| w.len()).min().unwrap_or(0);
        if n < 2 {
            return Err(Error::RValue(format!(
                "need at least two samples per chain, got {n}"
            )));
        }

        let (means, variances): (Vec<_>, Vec<_>) =
            windows.iter().map(|w| mean_and_variance(w)).unzip();
        let dim = means[0].len();
        let parameters = (0..dim)
            .map(|p| {
                let m: Vec<f64> = means.iter().map(|c| c[p]).collect();
                let v: Vec<f64> = variances.iter().map(|c| c[p]).collect();
                definition.compute(&m, &v, n)
            })
            .collect::<Result<Vec<_>>>()?;

        let (post_means, post_variances): (Vec<_>, Vec<_>) = windows
            .iter()
            .map(|w| log_density_mean_and_variance(w))
            .unzip();
        let posterior = definition.compute(&post_means, &post_variances, n)?;

        Ok(Self {
            parameters,
            posterior,
        })
    }

    /// Largest parameter R-value.
    pub fn max_parameter(&self) -> f64 {
        self.parameters.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

pub mod rvalue {
    //! Scalar R-value estimators from per-chain means and variances of one
    //! quantity, each chain contributing `n` samples.
    //!
    //! Both return `f64::MAX` instead of NaN when the within-chain variance
    //! vanishes.

    use log::debug;
    use ndarray::Array1;

    use crate::error::{Error, Result};

    struct Moments {
        m: f64,
        n: f64,
        means: Array1<f64>,
        variances: Array1<f64>,
        mean_of_means: f64,
        mean_of_variances: f64,
        b: f64,
        w: f64,
        sigma_squared: f64,
    }

    fn moments(chain_means: &[f64], chain_variances: &[f64], n: usize) -> Result<Moments> {
        if chain_means.len() != chain_variances.len() {
            return Err(Error::RValue(
                "chain means and chain variances are not aligned".to_string(),
            ));
        }
        if chain_means.len() <= 1 {
            return Err(Error::RValue(
                "need at least two chains to compute an R-value".to_string(),
            ));
        }

        let means = Array1::from(chain_means.to_vec());
        let variances = Array1::from(chain_variances.to_vec());
        let m = means.len() as f64;
        let n = n as f64;
        let mean_of_means = means.mean().unwrap_or(0.0);
        let mean_of_variances = variances.mean().unwrap_or(0.0);

        let b = means.var(1.0) * n;
        let w = mean_of_variances;
        let sigma_squared = (n - 1.0) / n * w + b / n;

        Ok(Moments {
            m,
            n,
            means,
            variances,
            mean_of_means,
            mean_of_variances,
            b,
            w,
            sigma_squared,
        })
    }

    /// Gelman-Rubin potential scale reduction with the t-distribution
    /// correction of the pooled variance.
    pub fn gelman_rubin(chain_means: &[f64], chain_variances: &[f64], n: usize) -> Result<f64> {
        let Moments {
            m,
            n,
            means,
            variances,
            mean_of_means,
            mean_of_variances,
            b,
            w,
            sigma_squared,
        } = moments(chain_means, chain_variances, n)?;

        if w == 0.0 {
            debug!(target: "rvalue::gelman_rubin", "W = 0, avoiding R = NaN");
            return Ok(f64::MAX);
        }

        let variance_of_variances = variances.var(1.0);
        let dv = &variances - mean_of_variances;
        let covariance_21 = (&dv * &(&means - mean_of_means)).sum() / (m - 1.0);
        let covariance_22 =
            (&dv * &(means.mapv(|x| x * x) - mean_of_means * mean_of_means)).sum() / (m - 1.0);

        // scale of the t-distribution
        let v = sigma_squared + b / (m * n);

        let a = (n - 1.0) * (n - 1.0) / (n * n * m) * variance_of_variances;
        let bb = (m + 1.0) * (m + 1.0) / (m * n * m * n) * 2.0 / (m - 1.0) * b * b;
        let c = 2.0 * (m + 1.0) * (n - 1.0) / (m * n * n) * n / m
            * (covariance_22 - 2.0 * mean_of_means * covariance_21);
        let variance_of_v = a + bb + c;

        let df = 2.0 * v * v / variance_of_v;
        if !df.is_finite() || variance_of_v <= 0.0 {
            return Ok((v / w).sqrt());
        }
        if df <= 2.0 {
            debug!(target: "rvalue::gelman_rubin", "DoF ({df}) below 2, avoiding R = NaN");
            return Ok(f64::MAX);
        }

        Ok((v / w * df / (df - 2.0)).sqrt())
    }

    /// `sqrt(((n-1)/n W + B/n) / W)`.
    pub fn approximation(chain_means: &[f64], chain_variances: &[f64], n: usize) -> Result<f64> {
        let moments = moments(chain_means, chain_variances, n)?;
        if moments.w == 0.0 {
            return Ok(f64::MAX);
        }
        Ok((moments.sigma_squared / moments.w).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn normal_states(n: usize, mean: f64, seed: u64) -> Vec<State> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let normal = Normal::new(mean, 1.0).unwrap();
        (0..n)
            .map(|_| {
                let x: f64 = normal.sample(&mut rng);
                let y: f64 = normal.sample(&mut rng);
                State::new(vec![x, y], -0.5 * (x * x + y * y))
            })
            .collect()
    }

    #[test]
    fn welford_matches_two_pass() {
        let states = normal_states(500, 1.0, 3);
        let mut stats = Stats::new(2);
        for s in &states {
            stats.record(s, Outcome::Accepted);
        }
        let (mean, variance) = mean_and_variance(&states);
        let (lp_mean, lp_variance) = log_density_mean_and_variance(&states);
        for i in 0..2 {
            assert_abs_diff_eq!(stats.mean_of_parameters[i], mean[i], epsilon = 1e-10);
            assert_abs_diff_eq!(stats.variance_of_parameters[i], variance[i], epsilon = 1e-10);
        }
        assert_abs_diff_eq!(stats.mean_of_log_density, lp_mean, epsilon = 1e-10);
        assert_abs_diff_eq!(stats.variance_of_log_density, lp_variance, epsilon = 1e-10);
        assert_eq!(stats.iterations_total, 500);
    }

    #[test]
    fn mode_and_reset() {
        let mut stats = Stats::new(1);
        stats.record(&State::new(vec![1.0], -3.0), Outcome::Accepted);
        stats.record(&State::new(vec![2.0], -1.0), Outcome::Accepted);
        stats.record(&State::new(vec![2.0], -1.0), Outcome::Invalid);
        stats.record(&State::new(vec![2.0], -1.0), Outcome::Rejected);
        assert_eq!(stats.mode, -1.0);
        assert_eq!(stats.parameters_at_mode, vec![2.0]);
        assert_abs_diff_eq!(stats.efficiency(), 2.0 / 3.0);

        stats.reset(false);
        assert_eq!(stats.iterations_total, 0);
        assert_eq!(stats.mean_of_parameters, vec![0.0]);
        assert_eq!(stats.mode, -1.0);

        stats.reset(true);
        assert!(!stats.has_mode());
    }

    #[test]
    fn non_finite_log_density_is_kept_out_of_the_moments() {
        let mut stats = Stats::new(1);
        stats.record(&State::new(vec![0.0], f64::NEG_INFINITY), Outcome::Invalid);
        stats.record(&State::new(vec![1.0], -2.0), Outcome::Accepted);
        assert_eq!(stats.mean_of_log_density, -2.0);
        assert!(stats.mean_of_parameters[0].is_finite());
    }

    #[test]
    fn covariance_of_window() {
        let states = normal_states(20_000, 0.0, 11);
        let cov = covariance(&states).unwrap();
        assert_abs_diff_eq!(cov, arr2(&[[1.0, 0.0], [0.0, 1.0]]), epsilon = 0.05);
        assert!(covariance(&states[..1]).is_err());
    }

    #[test]
    fn identical_chains_have_unit_rvalue() {
        let means = [0.0, 0.0, 0.0];
        let variances = [1.0, 1.0, 1.0];
        let relaxed = rvalue::approximation(&means, &variances, 1000).unwrap();
        assert_abs_diff_eq!(relaxed, (999.0f64 / 1000.0).sqrt(), epsilon = 1e-12);
        assert!(rvalue::gelman_rubin(&means, &variances, 1000).unwrap() >= relaxed);
    }

    #[test]
    fn separated_chains_have_large_rvalue() {
        let means = [0.0, 5.0];
        let variances = [1.0, 1.0];
        assert!(rvalue::approximation(&means, &variances, 100).unwrap() > 3.0);
    }

    #[test]
    fn strict_is_never_below_relaxed() {
        let means = [0.1, -0.05, 0.02, 0.2];
        let variances = [1.1, 0.9, 1.0, 1.05];
        for n in [50, 500, 5000] {
            let strict = rvalue::gelman_rubin(&means, &variances, n).unwrap();
            let relaxed = rvalue::approximation(&means, &variances, n).unwrap();
            assert!(strict >= relaxed, "{strict} < {relaxed} for n = {n}");
        }
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(
            rvalue::approximation(&[1.0, 1.0], &[0.0, 0.0], 10).unwrap(),
            f64::MAX
        );
        assert_eq!(
            rvalue::gelman_rubin(&[1.0, 2.0], &[0.0, 0.0], 10).unwrap(),
            f64::MAX
        );
        assert!(rvalue::approximation(&[1.0], &[1.0], 10).is_err());
        assert!(rvalue::gelman_rubin(&[1.0, 2.0], &[1.0], 10).is_err());
    }

    #[test]
    fn rvalues_over_windows() {
        let a = normal_states(2000, 0.0, 1);
        let b = normal_states(2000, 0.0, 2);
        let c = normal_states(2000, 4.0, 3);

        let mixed = RValues::compute(&[&a, &b], RValueDefinition::Strict).unwrap();
        assert!(mixed.max_parameter() < 1.05);
        assert!(mixed.posterior < 1.05);

        let apart = RValues::compute(&[&a, &c], RValueDefinition::Relaxed).unwrap();
        assert!(apart.max_parameter() > 2.0);

        assert!(RValues::compute(&[&a], RValueDefinition::Relaxed).is_err());
    }
}
