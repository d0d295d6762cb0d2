/*!
The target side of the sampler: parameter descriptions, the [`Density`] trait
every sampled distribution implements, and two reference densities.

A density is cloned once per chain, so implementations only need to be cheap
to clone and safe to move across threads.

# Examples

```rust
use mcmc_sampler::distributions::{Density, IndependentGaussian};

let target = IndependentGaussian::standard(2, 10.0);
assert_eq!(target.parameters().len(), 2);
let lp = target.log_density(&[0.0, 0.0]).unwrap();
assert!((lp + (2.0 * std::f64::consts::PI).ln()).abs() < 1e-12);

// points outside of the parameter box are invalid
assert!(target.log_density(&[11.0, 0.0]).is_none());
```
*/

use std::f64::consts::PI;

/// Name and allowed range of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescription {
    pub name: String,
    pub min: f64,
    pub max: f64,
    /// Nuisance parameters are not of direct interest; they may be scaled
    /// differently when the initial proposal is set up.
    pub nuisance: bool,
}

impl ParameterDescription {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            nuisance: false,
        }
    }

    pub fn nuisance(mut self, nuisance: bool) -> Self {
        self.nuisance = nuisance;
        self
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }

    pub fn range(&self) -> f64 {
        self.max - self.min
    }
}

/// Whether `point` lies inside the box spanned by `parameters`.
pub fn in_bounds(parameters: &[ParameterDescription], point: &[f64]) -> bool {
    parameters.len() == point.len()
        && parameters.iter().zip(point).all(|(p, &x)| p.contains(x))
}

/// A (not necessarily normalized) log density over a bounded parameter box.
pub trait Density: Clone + Send + Sync {
    fn parameters(&self) -> &[ParameterDescription];

    /// The log density at `point`, or `None` where it is undefined.
    fn log_density(&self, point: &[f64]) -> Option<f64>;

    /// Names of the external constraints folded into the density.
    fn constraints(&self) -> Vec<String> {
        Vec::new()
    }

    /// Human readable description of the prior of parameter `index`.
    fn prior_description(&self, index: usize) -> String {
        let p = &self.parameters()[index];
        format!("Parameter: {}, prior type: flat, range: [{},{}]", p.name, p.min, p.max)
    }

    /// Variance of the prior of parameter `index`; seeds the initial proposal
    /// covariance. Defaults to a flat prior over the parameter range.
    fn prior_variance(&self, index: usize) -> f64 {
        let range = self.parameters()[index].range();
        range * range / 12.0
    }

    fn dimension(&self) -> usize {
        self.parameters().len()
    }
}

/**
A product of independent normal distributions, truncated to a box.

The log density is normalized as if the box were infinite, which is what the
sampler needs for a target that is negligible at the box edges.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct IndependentGaussian {
    pub mean: Vec<f64>,
    pub sigma: Vec<f64>,
    parameters: Vec<ParameterDescription>,
}

impl IndependentGaussian {
    /// Each parameter `x_i` is restricted to `mean_i ± half_width * sigma_i`.
    pub fn new(mean: Vec<f64>, sigma: Vec<f64>, half_width: f64) -> Self {
        let parameters = mean
            .iter()
            .zip(&sigma)
            .enumerate()
            .map(|(i, (&m, &s))| {
                ParameterDescription::new(format!("x{i}"), m - half_width * s, m + half_width * s)
            })
            .collect();
        Self {
            mean,
            sigma,
            parameters,
        }
    }

    /// Unit normal in `dimension` dimensions on `[-half_width, half_width]^d`.
    pub fn standard(dimension: usize, half_width: f64) -> Self {
        Self::new(vec![0.0; dimension], vec![1.0; dimension], half_width)
    }

    pub fn with_parameters(mut self, parameters: Vec<ParameterDescription>) -> Self {
        self.parameters = parameters;
        self
    }
}

impl Density for IndependentGaussian {
    fn parameters(&self) -> &[ParameterDescription] {
        &self.parameters
    }

    fn log_density(&self, point: &[f64]) -> Option<f64> {
        if !in_bounds(&self.parameters, point) {
            return None;
        }
        let lp = point
            .iter()
            .zip(self.mean.iter().zip(&self.sigma))
            .map(|(&x, (&m, &s))| {
                let z = (x - m) / s;
                -0.5 * z * z - s.ln() - 0.5 * (2.0 * PI).ln()
            })
            .sum();
        Some(lp)
    }
}

/**
Equally weighted mixture of isotropic normal distributions with common width,
restricted to a box. Its separated modes make it the standard test case for
mode finding and the global-local proposal.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixture {
    pub centers: Vec<Vec<f64>>,
    pub sigma: f64,
    parameters: Vec<ParameterDescription>,
}

impl GaussianMixture {
    pub fn new(centers: Vec<Vec<f64>>, sigma: f64, parameters: Vec<ParameterDescription>) -> Self {
        Self {
            centers,
            sigma,
            parameters,
        }
    }
}

impl Density for GaussianMixture {
    fn parameters(&self) -> &[ParameterDescription] {
        &self.parameters
    }

    fn log_density(&self, point: &[f64]) -> Option<f64> {
        if !in_bounds(&self.parameters, point) || self.centers.is_empty() {
            return None;
        }
        let d = point.len() as f64;
        let norm = -d * (self.sigma.ln() + 0.5 * (2.0 * PI).ln())
            - (self.centers.len() as f64).ln();
        let terms: Vec<f64> = self
            .centers
            .iter()
            .map(|c| {
                let chi2: f64 = point
                    .iter()
                    .zip(c)
                    .map(|(&x, &m)| ((x - m) / self.sigma).powi(2))
                    .sum();
                norm - 0.5 * chi2
            })
            .collect();
        let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(max + terms.iter().map(|t| (t - max).exp()).sum::<f64>().ln())
    }
}
