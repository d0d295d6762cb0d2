/*!
# Mode finding

Local maximization of a [`Density`] from a given start point, used to seed
chains at nearby modes before (or after) the prerun.

The optimizer is pluggable through [`Optimizer`]; the crate ships
[`NelderMead`], which runs `argmin`'s simplex on the negative log density
clamped into the parameter box. Many starts usually converge to a handful of
distinct maxima, which [`unique_modes`] groups back together.
*/

use argmin::core::{CostFunction, Executor, State, TerminationReason};
use argmin::solver::neldermead::NelderMead as Simplex;
use log::debug;

use crate::distributions::{in_bounds, Density, ParameterDescription};
use crate::error::{Error, RangeError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationOptions {
    /// Run the prerun before optimizing from the chains' modes.
    pub mcmc_pre_run: bool,
    /// Initial simplex size as a fraction of each parameter's range.
    pub initial_step_size: f64,
    pub maximum_iterations: usize,
    /// Convergence threshold on the standard deviation of the log densities
    /// at the simplex vertices.
    pub tolerance: f64,
    /// Range-normalized distance below which two optima count as one mode.
    pub splitting_tolerance: f64,
}

impl Default for OptimizationOptions {
    fn default() -> Self {
        Self {
            mcmc_pre_run: true,
            initial_step_size: 0.1,
            maximum_iterations: 8000,
            tolerance: 1e-4,
            splitting_tolerance: 1e-2,
        }
    }
}

impl OptimizationOptions {
    pub fn validate(&self) -> Result<()> {
        RangeError::check("initial_step_size", self.initial_step_size, f64::EPSILON, 1.0)?;
        RangeError::check(
            "maximum_iterations",
            self.maximum_iterations as f64,
            1.0,
            f64::MAX,
        )?;
        RangeError::check("tolerance", self.tolerance, f64::MIN_POSITIVE, f64::MAX)?;
        RangeError::check(
            "splitting_tolerance",
            self.splitting_tolerance,
            0.0,
            f64::MAX,
        )?;
        Ok(())
    }
}

/// A located local maximum.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimum {
    pub point: Vec<f64>,
    pub log_density: f64,
    pub iterations: usize,
}

/// Maximizes a log density from a start point.
pub trait Optimizer: Send + Sync {
    fn maximize<D: Density>(
        &self,
        density: &D,
        start: &[f64],
        options: &OptimizationOptions,
    ) -> Result<Optimum>;
}

/// Nelder-Mead simplex search on the negative log density, restricted to
/// the parameter box. Invalid points score `+inf`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NelderMead;

/// `-log p` of the clamped point, so the simplex may leave the box but the
/// density is only ever evaluated inside it.
struct NegativeLogDensity<'a, D> {
    density: &'a D,
}

impl<D: Density> CostFunction for NegativeLogDensity<'_, D> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, point: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        let mut point = point.clone();
        clamp_into(self.density.parameters(), &mut point);
        Ok(match self.density.log_density(&point) {
            Some(lp) if !lp.is_nan() && lp != f64::INFINITY => -lp,
            _ => f64::INFINITY,
        })
    }
}

fn clamp_into(parameters: &[ParameterDescription], point: &mut [f64]) {
    for (x, p) in point.iter_mut().zip(parameters) {
        *x = x.clamp(p.min, p.max);
    }
}

/// Root mean square of the coordinate differences, each divided by its
/// parameter range.
pub fn normalized_distance(parameters: &[ParameterDescription], a: &[f64], b: &[f64]) -> f64 {
    if parameters.is_empty() {
        return 0.0;
    }
    let sum: f64 = parameters
        .iter()
        .zip(a.iter().zip(b))
        .map(|(p, (x, y))| {
            let range = p.range();
            if range > 0.0 {
                ((x - y) / range).powi(2)
            } else {
                0.0
            }
        })
        .sum();
    (sum / parameters.len() as f64).sqrt()
}

impl Optimizer for NelderMead {
    fn maximize<D: Density>(
        &self,
        density: &D,
        start: &[f64],
        options: &OptimizationOptions,
    ) -> Result<Optimum> {
        options.validate()?;
        let parameters = density.parameters();
        let d = parameters.len();
        if start.len() != d {
            return Err(Error::Dimension {
                expected: d,
                found: start.len(),
            });
        }
        if !in_bounds(parameters, start) || !density.log_density(start).is_some_and(f64::is_finite) {
            return Err(Error::Optimization(format!(
                "log density is not finite at start point {start:?}"
            )));
        }

        let mut vertices = Vec::with_capacity(d + 1);
        vertices.push(start.to_vec());
        for (i, p) in parameters.iter().enumerate() {
            let step = options.initial_step_size * p.range();
            let mut vertex = start.to_vec();
            vertex[i] += step;
            if vertex[i] > p.max {
                vertex[i] = start[i] - step;
            }
            clamp_into(parameters, &mut vertex);
            vertices.push(vertex);
        }

        let solver = Simplex::new(vertices)
            .with_sd_tolerance(options.tolerance)
            .map_err(|e| Error::Optimization(e.to_string()))?;
        let result = Executor::new(NegativeLogDensity { density }, solver)
            .configure(|state| state.max_iters(options.maximum_iterations as u64))
            .run()
            .map_err(|e| Error::Optimization(e.to_string()))?;

        let state = result.state();
        let iterations = state.get_iter() as usize;
        match state.get_termination_reason() {
            Some(TerminationReason::SolverConverged) => {}
            reason => {
                return Err(Error::Optimization(format!(
                    "no convergence after {iterations} iterations ({reason:?})"
                )))
            }
        }
        let mut point = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| Error::Optimization("solver returned no point".to_string()))?;
        clamp_into(parameters, &mut point);
        let log_density = -state.get_best_cost();
        debug!(
            target: "mode_finding",
            "Nelder-Mead converged after {iterations} iterations at log density {log_density}"
        );
        Ok(Optimum {
            point,
            log_density,
            iterations,
        })
    }
}

/// Groups points whose [`normalized_distance`] to the first member of a group
/// is below `splitting_tolerance`. Returns indices, one group per mode.
pub fn unique_modes(
    parameters: &[ParameterDescription],
    points: &[&[f64]],
    splitting_tolerance: f64,
) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, point) in points.iter().enumerate() {
        match groups
            .iter_mut()
            .find(|g| normalized_distance(parameters, points[g[0]], point) < splitting_tolerance)
        {
            Some(g) => g.push(i),
            None => groups.push(vec![i]),
        }
    }
    groups
}

/// Outcome of optimizing from every chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeFindingReport {
    /// One entry per chain; `None` where the optimizer failed.
    pub optima: Vec<Option<Optimum>>,
    /// Chain indices grouped by the mode they converged to.
    pub unique_modes: Vec<Vec<usize>>,
    pub failures: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{GaussianMixture, IndependentGaussian};
    use approx::assert_abs_diff_eq;

    #[test]
    fn finds_gaussian_mode() {
        let target = IndependentGaussian::new(vec![1.0, -2.0], vec![1.0, 0.5], 10.0);
        let optimum = NelderMead
            .maximize(&target, &[3.0, 0.0], &OptimizationOptions::default())
            .unwrap();
        assert_abs_diff_eq!(optimum.point[0], 1.0, epsilon = 5e-2);
        assert_abs_diff_eq!(optimum.point[1], -2.0, epsilon = 5e-2);
        assert_abs_diff_eq!(
            optimum.log_density,
            target.log_density(&[1.0, -2.0]).unwrap(),
            epsilon = 1e-3
        );
    }

    #[test]
    fn stays_inside_the_box() {
        // mode at the upper edge
        let target = IndependentGaussian::new(vec![0.0], vec![1.0], 10.0).with_parameters(vec![
            ParameterDescription::new("x", -3.0, -1.0),
        ]);
        let optimum = NelderMead
            .maximize(&target, &[-2.5], &OptimizationOptions::default())
            .unwrap();
        assert!(optimum.point[0] <= -1.0);
        assert_abs_diff_eq!(optimum.point[0], -1.0, epsilon = 1e-2);
    }

    #[test]
    fn invalid_start_and_exhaustion_are_errors() {
        let target = IndependentGaussian::standard(1, 5.0);
        assert!(matches!(
            NelderMead.maximize(&target, &[7.0], &OptimizationOptions::default()),
            Err(Error::Optimization(_))
        ));
        let options = OptimizationOptions {
            maximum_iterations: 2,
            ..OptimizationOptions::default()
        };
        assert!(matches!(
            NelderMead.maximize(&target, &[3.0], &options),
            Err(Error::Optimization(_))
        ));
    }

    #[test]
    fn bimodal_starts_give_two_unique_modes() {
        let parameters = vec![
            ParameterDescription::new("x", -10.0, 10.0),
            ParameterDescription::new("y", -10.0, 10.0),
        ];
        let target = GaussianMixture::new(vec![vec![-4.0, 0.0], vec![4.0, 0.0]], 1.0, parameters.clone());
        let options = OptimizationOptions::default();
        let optima: Vec<Optimum> = [[-5.0, 1.0], [3.0, -1.0], [-3.0, -0.5], [5.0, 0.5]]
            .iter()
            .map(|s| NelderMead.maximize(&target, s, &options).unwrap())
            .collect();
        let points: Vec<&[f64]> = optima.iter().map(|o| o.point.as_slice()).collect();
        let groups = unique_modes(&parameters, &points, options.splitting_tolerance);
        assert_eq!(groups, vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn distance_is_range_normalized() {
        let parameters = vec![
            ParameterDescription::new("a", 0.0, 10.0),
            ParameterDescription::new("b", 0.0, 1.0),
        ];
        let d = normalized_distance(&parameters, &[0.0, 0.0], &[10.0, 1.0]);
        assert_abs_diff_eq!(d, 1.0, epsilon = 1e-12);
    }
}
