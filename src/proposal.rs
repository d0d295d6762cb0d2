/*!
# Proposal functions

Every chain owns one [`Proposal`], a closed set of proposal families behind the
[`ProposalFunction`] interface:

- [`MultivariateGaussian`]: `y + L z` with `Σ = L Lᵀ` and standard normal `z`.
- [`MultivariateStudentT`]: `y + L z sqrt(ν / χ²_ν)`; heavy tailed, `ν = 1`
  is the multivariate Cauchy distribution.
- [`GlobalLocal`](crate::global_local::GlobalLocal): mixture synthesized from
  several finished preruns.

Both multivariate families share their covariance handling ([`Multivariate`]):
the covariance is `covariance_scale · S`, where `S` is a running estimate of the
sample covariance of the chain. [`ProposalFunction::adapt`] blends the
covariance of the latest history window into `S` with weight
`1/(adaptations+1)^cooling_power` and moves the scale towards the configured
efficiency band.

## Example

```rust
use mcmc_sampler::config::ProposalKind;
use mcmc_sampler::core::State;
use mcmc_sampler::proposal::{Proposal, ProposalFunction};
use rand::{rngs::SmallRng, SeedableRng};

let proposal = Proposal::initial(ProposalKind::MultivariateGaussian, 1.0, &[1.0, 4.0], true).unwrap();
let mut rng = SmallRng::seed_from_u64(7);
let current = State::new(vec![0.0, 0.0], 0.0);
let candidate = proposal.propose(&current, &mut rng);
assert_eq!(candidate.point.len(), 2);
assert!(proposal.is_symmetric());
```
*/

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{ChiSquared, Distribution, StandardNormal};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;

use crate::config::ProposalKind;
use crate::core::State;
use crate::error::{Error, Result};
use crate::global_local::{GlobalLocal, GlobalLocalState};
use crate::stats;

pub const COVARIANCE_SCALE_MIN: f64 = 1e-4;
pub const COVARIANCE_SCALE_MAX: f64 = 100.0;
pub const COVARIANCE_SCALE_UPDATE_FACTOR: f64 = 1.5;

/// Interface shared by all proposal families.
pub trait ProposalFunction: Clone + Send + Sync {
    fn dimension(&self) -> usize;

    /// Draws a candidate given the current state. The log density of the
    /// returned state is not evaluated yet.
    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R) -> State;

    /// Log probability of proposing `x` when the chain sits at `y`.
    fn evaluate(&self, x: &State, y: &State) -> f64;

    /// Updates the proposal from a window of the chain's history.
    ///
    /// Nothing changes when `efficiency` already lies in
    /// `[efficiency_min, efficiency_max]` or when the same window was used for
    /// the previous adaptation.
    fn adapt(
        &mut self,
        window: &[State],
        efficiency: f64,
        efficiency_min: f64,
        efficiency_max: f64,
    ) -> Result<()>;

    /// Symmetric proposals satisfy `evaluate(x, y) == evaluate(y, x)`, so the
    /// chain can skip the asymmetry correction.
    fn is_symmetric(&self) -> bool {
        true
    }

    fn dump_state(&self) -> ProposalState;
}

/// Persistable numeric state of a proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalState {
    Multivariate(MultivariateState),
    GlobalLocal(GlobalLocalState),
}

/// Numeric state of a multivariate proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateState {
    pub kind: ProposalKind,
    pub dimension: usize,
    /// Row-major `dimension × dimension` covariance, including the scale.
    pub covariance: Vec<f64>,
    pub covariance_scale: f64,
    pub cooling_power: f64,
    pub adaptations: u32,
    /// Set for the Student-t family only.
    pub degrees_of_freedom: Option<f64>,
}

/// Identifies a history window so that it is not used twice for adaptation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WindowFingerprint {
    len: usize,
    first: State,
    last: State,
}

impl WindowFingerprint {
    pub(crate) fn of(window: &[State]) -> Option<Self> {
        Some(Self {
            len: window.len(),
            first: window.first()?.clone(),
            last: window.last()?.clone(),
        })
    }
}

/// Covariance, Cholesky factor and scale shared by the multivariate families.
#[derive(Debug, Clone, PartialEq)]
pub struct Multivariate {
    dimension: usize,
    covariance: DMatrix<f64>,
    sample_covariance: DMatrix<f64>,
    cholesky: DMatrix<f64>,
    // sum of ln L_ii, i.e. half the log determinant of the covariance
    half_log_det: f64,
    pub covariance_scale: f64,
    pub cooling_power: f64,
    pub adaptations: u32,
    last_window: Option<WindowFingerprint>,
}

impl Multivariate {
    /// `covariance` is taken as the initial estimate of the sample covariance.
    /// With `automatic_scaling` the proposal starts out with
    /// `2.38²/d · covariance`, otherwise with `covariance` itself and scale 1.
    pub fn new(covariance: DMatrix<f64>, automatic_scaling: bool) -> Result<Self> {
        let dimension = covariance.nrows();
        if covariance.ncols() != dimension {
            return Err(Error::Dimension {
                expected: dimension,
                found: covariance.ncols(),
            });
        }
        if covariance.diagonal().iter().any(|&v| !(v > 0.0)) {
            return Err(Error::NotPositiveDefinite);
        }

        let covariance_scale = if automatic_scaling {
            2.38 * 2.38 / dimension as f64
        } else {
            1.0
        };
        let proposal_covariance = &covariance * covariance_scale;

        let mut result = Self {
            dimension,
            covariance: proposal_covariance,
            sample_covariance: covariance,
            cholesky: DMatrix::zeros(dimension, dimension),
            half_log_det: 0.0,
            covariance_scale,
            cooling_power: 0.5,
            adaptations: 0,
            last_window: None,
        };
        result.decompose()?;
        Ok(result)
    }

    fn from_state(state: &MultivariateState) -> Result<Self> {
        let d = state.dimension;
        if state.covariance.len() != d * d {
            return Err(Error::Dimension {
                expected: d * d,
                found: state.covariance.len(),
            });
        }
        let covariance = DMatrix::from_row_slice(d, d, &state.covariance);
        let mut result = Self {
            dimension: d,
            sample_covariance: &covariance / state.covariance_scale,
            covariance,
            cholesky: DMatrix::zeros(d, d),
            half_log_det: 0.0,
            covariance_scale: state.covariance_scale,
            cooling_power: state.cooling_power,
            adaptations: state.adaptations,
            last_window: None,
        };
        result.decompose()?;
        Ok(result)
    }

    fn to_state(&self, kind: ProposalKind, degrees_of_freedom: Option<f64>) -> MultivariateState {
        let d = self.dimension;
        MultivariateState {
            kind,
            dimension: d,
            covariance: (0..d * d)
                .map(|k| self.covariance[(k / d, k % d)])
                .collect(),
            covariance_scale: self.covariance_scale,
            cooling_power: self.cooling_power,
            adaptations: self.adaptations,
            degrees_of_freedom,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// The proposal covariance, scale included.
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    fn decompose(&mut self) -> Result<()> {
        let cholesky = match self.covariance.clone().cholesky() {
            Some(c) => c,
            None => {
                warn!(
                    target: "proposal::multivariate",
                    "covariance matrix is not positive definite, proceeding with its diagonal"
                );
                self.covariance = DMatrix::from_diagonal(&self.covariance.diagonal());
                self.covariance
                    .clone()
                    .cholesky()
                    .ok_or(Error::NotPositiveDefinite)?
            }
        };
        self.cholesky = cholesky.l();
        self.half_log_det = self.cholesky.diagonal().iter().map(|l| l.ln()).sum();
        Ok(())
    }

    /// `(x - y)ᵀ Σ⁻¹ (x - y)`.
    fn chi_squared(&self, x: &[f64], y: &[f64]) -> f64 {
        let diff = DVector::from_iterator(self.dimension, x.iter().zip(y).map(|(a, b)| a - b));
        match self.cholesky.solve_lower_triangular(&diff) {
            Some(u) => u.norm_squared(),
            None => f64::INFINITY,
        }
    }

    /// `L z` for a vector `z` of standard normals.
    fn correlated_normal<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let z = DVector::from_iterator(
            self.dimension,
            (0..self.dimension).map(|_| StandardNormal.sample(rng)),
        );
        &self.cholesky * z
    }

    fn check_window(&self, window: &[State]) -> Result<()> {
        match window.iter().find(|s| s.dimension() != self.dimension) {
            Some(s) => Err(Error::Dimension {
                expected: self.dimension,
                found: s.dimension(),
            }),
            None => Ok(()),
        }
    }

    /// Returns whether anything changed.
    fn adapt(
        &mut self,
        window: &[State],
        efficiency: f64,
        efficiency_min: f64,
        efficiency_max: f64,
    ) -> Result<bool> {
        self.check_window(window)?;
        if (efficiency_min..=efficiency_max).contains(&efficiency) {
            return Ok(false);
        }
        let fingerprint = WindowFingerprint::of(window);
        if fingerprint.is_some() && fingerprint == self.last_window {
            return Ok(false);
        }
        if window.len() < 2 {
            return Err(Error::Adaptation(format!(
                "cannot estimate a sample covariance from {} state(s)",
                window.len()
            )));
        }

        // the first adaptation counts as 1, not 0
        self.adaptations += 1;
        let weight = 1.0 / ((self.adaptations + 1) as f64).powf(self.cooling_power);
        let window_covariance = to_matrix(&stats::covariance(window)?);
        self.sample_covariance = &self.sample_covariance * (1.0 - weight) + window_covariance * weight;

        let old_scale = self.covariance_scale;
        if efficiency > efficiency_max && self.covariance_scale < COVARIANCE_SCALE_MAX {
            self.covariance_scale *= COVARIANCE_SCALE_UPDATE_FACTOR;
        } else if efficiency < efficiency_min && self.covariance_scale > COVARIANCE_SCALE_MIN {
            self.covariance_scale /= COVARIANCE_SCALE_UPDATE_FACTOR;
        }
        if self.covariance_scale > COVARIANCE_SCALE_MAX {
            warn!(
                target: "proposal::multivariate",
                "covariance scale {} exceeds sensible maximum of {COVARIANCE_SCALE_MAX}",
                self.covariance_scale
            );
        }
        if self.covariance_scale < COVARIANCE_SCALE_MIN {
            warn!(
                target: "proposal::multivariate",
                "covariance scale {} below sensible minimum of {COVARIANCE_SCALE_MIN}",
                self.covariance_scale
            );
        }
        if self.covariance_scale != old_scale {
            debug!(
                target: "proposal::multivariate",
                "adaptation {}: scale {old_scale} -> {}",
                self.adaptations,
                self.covariance_scale
            );
        }

        self.covariance = &self.sample_covariance * self.covariance_scale;
        self.decompose()?;
        self.last_window = fingerprint;
        Ok(true)
    }

    /// Replaces the covariance estimate by the pooled sample covariance of
    /// several history windows and restarts the adaptation count.
    pub fn reset_from_histories(&mut self, windows: &[&[State]], scale: f64) -> Result<()> {
        for window in windows {
            self.check_window(window)?;
        }
        let pooled: Vec<State> = windows.iter().flat_map(|w| w.iter().cloned()).collect();
        self.sample_covariance = to_matrix(&stats::covariance(&pooled)?);
        self.adaptations = 0;
        if !(COVARIANCE_SCALE_MIN..=COVARIANCE_SCALE_MAX).contains(&scale) {
            warn!(
                target: "proposal::multivariate",
                "covariance scale {scale} outside of [{COVARIANCE_SCALE_MIN}, {COVARIANCE_SCALE_MAX}]"
            );
        }
        self.covariance_scale = scale;
        self.covariance = &self.sample_covariance * scale;
        self.last_window = None;
        self.decompose()
    }

    /// Multiplies the scale, and with it the covariance, by `factor`.
    pub fn rescale(&mut self, factor: f64) -> Result<()> {
        self.covariance_scale *= factor;
        self.covariance = &self.sample_covariance * self.covariance_scale;
        self.decompose()
    }
}

fn to_matrix(a: &ndarray::Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateGaussian {
    core: Multivariate,
}

impl MultivariateGaussian {
    pub fn new(covariance: DMatrix<f64>, automatic_scaling: bool) -> Result<Self> {
        Ok(Self {
            core: Multivariate::new(covariance, automatic_scaling)?,
        })
    }

    pub fn multivariate(&self) -> &Multivariate {
        &self.core
    }

    pub fn multivariate_mut(&mut self) -> &mut Multivariate {
        &mut self.core
    }

    fn norm(&self) -> f64 {
        -0.5 * self.core.dimension as f64 * (2.0 * PI).ln() - self.core.half_log_det
    }
}

impl ProposalFunction for MultivariateGaussian {
    fn dimension(&self) -> usize {
        self.core.dimension
    }

    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R) -> State {
        let step = self.core.correlated_normal(rng);
        let point = current.point.iter().zip(step.iter()).map(|(x, s)| x + s).collect();
        State {
            point,
            log_density: f64::NAN,
            component: current.component,
        }
    }

    fn evaluate(&self, x: &State, y: &State) -> f64 {
        self.norm() - 0.5 * self.core.chi_squared(&x.point, &y.point)
    }

    fn adapt(
        &mut self,
        window: &[State],
        efficiency: f64,
        efficiency_min: f64,
        efficiency_max: f64,
    ) -> Result<()> {
        self.core
            .adapt(window, efficiency, efficiency_min, efficiency_max)
            .map(|_| ())
    }

    fn dump_state(&self) -> ProposalState {
        ProposalState::Multivariate(self.core.to_state(ProposalKind::MultivariateGaussian, None))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateStudentT {
    core: Multivariate,
    degrees_of_freedom: f64,
    norm: f64,
}

impl MultivariateStudentT {
    pub fn new(covariance: DMatrix<f64>, degrees_of_freedom: f64, automatic_scaling: bool) -> Result<Self> {
        Self::from_core(Multivariate::new(covariance, automatic_scaling)?, degrees_of_freedom)
    }

    fn from_core(core: Multivariate, degrees_of_freedom: f64) -> Result<Self> {
        if !(degrees_of_freedom > 0.0) {
            return Err(crate::error::RangeError {
                field: "student_t_degrees_of_freedom",
                value: degrees_of_freedom,
                min: f64::EPSILON,
                max: f64::MAX,
            }
            .into());
        }
        let mut result = Self {
            core,
            degrees_of_freedom,
            norm: 0.0,
        };
        result.compute_norm();
        Ok(result)
    }

    pub fn degrees_of_freedom(&self) -> f64 {
        self.degrees_of_freedom
    }

    pub fn multivariate(&self) -> &Multivariate {
        &self.core
    }

    pub fn multivariate_mut(&mut self) -> &mut Multivariate {
        &mut self.core
    }

    fn compute_norm(&mut self) {
        let nu = self.degrees_of_freedom;
        let d = self.core.dimension as f64;
        self.norm = ln_gamma(0.5 * (nu + d)) - ln_gamma(0.5 * nu) - 0.5 * d * (nu * PI).ln()
            - self.core.half_log_det;
    }
}

impl ProposalFunction for MultivariateStudentT {
    fn dimension(&self) -> usize {
        self.core.dimension
    }

    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R) -> State {
        let step = self.core.correlated_normal(rng);
        let chi_squared = ChiSquared::new(self.degrees_of_freedom)
            .map(|c| c.sample(rng))
            .unwrap_or(self.degrees_of_freedom);
        let factor = (self.degrees_of_freedom / chi_squared).sqrt();
        let point = current
            .point
            .iter()
            .zip(step.iter())
            .map(|(x, s)| x + factor * s)
            .collect();
        State {
            point,
            log_density: f64::NAN,
            component: current.component,
        }
    }

    fn evaluate(&self, x: &State, y: &State) -> f64 {
        let nu = self.degrees_of_freedom;
        let d = self.core.dimension as f64;
        let chi_squared = self.core.chi_squared(&x.point, &y.point);
        self.norm - 0.5 * (nu + d) * (1.0 + chi_squared / nu).ln()
    }

    fn adapt(
        &mut self,
        window: &[State],
        efficiency: f64,
        efficiency_min: f64,
        efficiency_max: f64,
    ) -> Result<()> {
        if self
            .core
            .adapt(window, efficiency, efficiency_min, efficiency_max)?
        {
            self.compute_norm();
        }
        Ok(())
    }

    fn dump_state(&self) -> ProposalState {
        ProposalState::Multivariate(
            self.core
                .to_state(ProposalKind::MultivariateStudentT, Some(self.degrees_of_freedom)),
        )
    }
}

/// The proposal families a chain can be driven by.
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    Gaussian(MultivariateGaussian),
    StudentT(MultivariateStudentT),
    GlobalLocal(Box<GlobalLocal>),
}

impl Proposal {
    /// A proposal with diagonal covariance `variances`.
    pub fn initial(
        kind: ProposalKind,
        degrees_of_freedom: f64,
        variances: &[f64],
        automatic_scaling: bool,
    ) -> Result<Self> {
        let covariance = DMatrix::from_diagonal(&DVector::from_column_slice(variances));
        match kind {
            ProposalKind::MultivariateGaussian => Ok(Proposal::Gaussian(MultivariateGaussian::new(
                covariance,
                automatic_scaling,
            )?)),
            ProposalKind::MultivariateStudentT => Ok(Proposal::StudentT(MultivariateStudentT::new(
                covariance,
                degrees_of_freedom,
                automatic_scaling,
            )?)),
        }
    }

    /// Rebuilds a proposal from its persisted state.
    pub fn restore(state: &ProposalState) -> Result<Self> {
        match state {
            ProposalState::Multivariate(s) => {
                let core = Multivariate::from_state(s)?;
                match s.kind {
                    ProposalKind::MultivariateGaussian => {
                        Ok(Proposal::Gaussian(MultivariateGaussian { core }))
                    }
                    ProposalKind::MultivariateStudentT => {
                        let dof = s.degrees_of_freedom.ok_or_else(|| {
                            Error::Store("Student-t proposal without degrees of freedom".to_string())
                        })?;
                        Ok(Proposal::StudentT(MultivariateStudentT::from_core(core, dof)?))
                    }
                }
            }
            ProposalState::GlobalLocal(s) => {
                info!(target: "proposal", "restoring global-local proposal with {} components", s.components.len());
                Ok(Proposal::GlobalLocal(Box::new(GlobalLocal::restore(s)?)))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Proposal::Gaussian(_) => ProposalKind::MultivariateGaussian.name(),
            Proposal::StudentT(_) => ProposalKind::MultivariateStudentT.name(),
            Proposal::GlobalLocal(_) => "GlobalLocal",
        }
    }

    pub fn multivariate(&self) -> Option<&Multivariate> {
        match self {
            Proposal::Gaussian(p) => Some(&p.core),
            Proposal::StudentT(p) => Some(&p.core),
            Proposal::GlobalLocal(_) => None,
        }
    }

    /// Pools history windows into a new covariance estimate, see
    /// [`Multivariate::reset_from_histories`].
    pub fn reset_from_histories(&mut self, windows: &[&[State]], scale: f64) -> Result<()> {
        match self {
            Proposal::Gaussian(p) => p.core.reset_from_histories(windows, scale),
            Proposal::StudentT(p) => {
                p.core.reset_from_histories(windows, scale)?;
                p.compute_norm();
                Ok(())
            }
            Proposal::GlobalLocal(_) => Err(Error::Adaptation(
                "a global-local proposal cannot be reset from histories".to_string(),
            )),
        }
    }

    pub fn rescale(&mut self, factor: f64) -> Result<()> {
        match self {
            Proposal::Gaussian(p) => p.core.rescale(factor),
            Proposal::StudentT(p) => {
                p.core.rescale(factor)?;
                p.compute_norm();
                Ok(())
            }
            Proposal::GlobalLocal(_) => Ok(()),
        }
    }
}

impl ProposalFunction for Proposal {
    fn dimension(&self) -> usize {
        match self {
            Proposal::Gaussian(p) => p.dimension(),
            Proposal::StudentT(p) => p.dimension(),
            Proposal::GlobalLocal(p) => p.dimension(),
        }
    }

    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R) -> State {
        match self {
            Proposal::Gaussian(p) => p.propose(current, rng),
            Proposal::StudentT(p) => p.propose(current, rng),
            Proposal::GlobalLocal(p) => p.propose(current, rng),
        }
    }

    fn evaluate(&self, x: &State, y: &State) -> f64 {
        match self {
            Proposal::Gaussian(p) => p.evaluate(x, y),
            Proposal::StudentT(p) => p.evaluate(x, y),
            Proposal::GlobalLocal(p) => p.evaluate(x, y),
        }
    }

    fn adapt(
        &mut self,
        window: &[State],
        efficiency: f64,
        efficiency_min: f64,
        efficiency_max: f64,
    ) -> Result<()> {
        match self {
            Proposal::Gaussian(p) => p.adapt(window, efficiency, efficiency_min, efficiency_max),
            Proposal::StudentT(p) => p.adapt(window, efficiency, efficiency_min, efficiency_max),
            Proposal::GlobalLocal(p) => p.adapt(window, efficiency, efficiency_min, efficiency_max),
        }
    }

    fn is_symmetric(&self) -> bool {
        match self {
            Proposal::Gaussian(p) => p.is_symmetric(),
            Proposal::StudentT(p) => p.is_symmetric(),
            Proposal::GlobalLocal(p) => p.is_symmetric(),
        }
    }

    fn dump_state(&self) -> ProposalState {
        match self {
            Proposal::Gaussian(p) => p.dump_state(),
            Proposal::StudentT(p) => p.dump_state(),
            Proposal::GlobalLocal(p) => p.dump_state(),
        }
    }
}
