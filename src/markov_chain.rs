/*!
# Markov chain

A [`MarkovChain`] owns one Metropolis-Hastings random walk: its own copy of the
density, its proposal, its RNG, running [`Stats`] and an optional [`History`].

Chains never share mutable state, so a sampler can drive any number of them
concurrently and only look at them once every chain has returned.

```rust
use mcmc_sampler::config::ProposalKind;
use mcmc_sampler::distributions::IndependentGaussian;
use mcmc_sampler::markov_chain::MarkovChain;
use mcmc_sampler::proposal::Proposal;

let target = IndependentGaussian::standard(2, 10.0);
let proposal = Proposal::initial(ProposalKind::MultivariateGaussian, 1.0, &[1.0, 1.0], true).unwrap();
let mut chain = MarkovChain::new(target, proposal, 42).unwrap();
chain.run(500);

let stats = chain.stats();
assert_eq!(stats.iterations_total, 500);
assert_eq!(
    stats.iterations_accepted + stats.iterations_rejected + stats.iterations_invalid,
    500
);
```
*/

use log::debug;
use rand::prelude::*;

use crate::core::{History, State};
use crate::distributions::{in_bounds, Density};
use crate::error::{Error, Result};
use crate::proposal::{Proposal, ProposalFunction};
use crate::stats::{self, Outcome, Stats};

#[derive(Debug, Clone)]
pub struct MarkovChain<D> {
    density: D,
    proposal: Proposal,
    current: State,
    stats: Stats,
    history: History,
    rng: SmallRng,
    seed: u64,
    last_outcome: Option<Outcome>,
    // counters of the most recent `run` call
    run_accepted: u64,
    run_rejected: u64,
}

impl<D: Density> MarkovChain<D> {
    /**
    Creates a chain at a point drawn uniformly from the parameter box.

    If the density is invalid at that point the chain starts with log density
    `-inf`, so the first valid candidate is accepted.

    # Errors

    [`Error::Dimension`] if proposal and density disagree on the dimension.
    */
    pub fn new(density: D, proposal: Proposal, seed: u64) -> Result<Self> {
        let dimension = density.dimension();
        if proposal.dimension() != dimension {
            return Err(Error::Dimension {
                expected: dimension,
                found: proposal.dimension(),
            });
        }

        let mut rng = SmallRng::seed_from_u64(seed);
        let point: Vec<f64> = density
            .parameters()
            .iter()
            .map(|p| p.min + rng.gen::<f64>() * p.range())
            .collect();
        let mut chain = Self {
            current: State::new(point, f64::NEG_INFINITY),
            stats: Stats::new(dimension),
            history: History::new(false),
            density,
            proposal,
            rng,
            seed,
            last_outcome: None,
            run_accepted: 0,
            run_rejected: 0,
        };
        if let Some(lp) = chain.evaluate(&chain.current.point) {
            chain.current.log_density = lp;
        }
        chain.stats.update_mode(&chain.current.point, chain.current.log_density);
        Ok(chain)
    }

    /// Log density at `point`, or `None` outside the parameter box and
    /// wherever the density is undefined, NaN or `+inf`.
    fn evaluate(&self, point: &[f64]) -> Option<f64> {
        if !in_bounds(self.density.parameters(), point) {
            return None;
        }
        self.density
            .log_density(point)
            .filter(|lp| !lp.is_nan() && *lp != f64::INFINITY)
    }

    /// Performs exactly `iterations` Metropolis-Hastings steps.
    pub fn run(&mut self, iterations: usize) {
        self.run_accepted = 0;
        self.run_rejected = 0;

        for _ in 0..iterations {
            let mut candidate = self.proposal.propose(&self.current, &mut self.rng);
            let outcome = match self.evaluate(&candidate.point) {
                None => Outcome::Invalid,
                Some(lp) => {
                    candidate.log_density = lp;
                    let mut log_ratio = lp - self.current.log_density;
                    if !self.proposal.is_symmetric() {
                        log_ratio += self.proposal.evaluate(&self.current, &candidate)
                            - self.proposal.evaluate(&candidate, &self.current);
                    }
                    let u: f64 = self.rng.gen();
                    if log_ratio >= 0.0 || u.ln() < log_ratio {
                        self.current = candidate;
                        self.run_accepted += 1;
                        Outcome::Accepted
                    } else {
                        self.run_rejected += 1;
                        Outcome::Rejected
                    }
                }
            };

            self.stats.record(&self.current, outcome);
            self.history.push(&self.current);
            self.last_outcome = Some(outcome);
        }
    }

    /// Whether the most recent step moved the chain.
    pub fn proposal_accepted(&self) -> bool {
        self.last_outcome == Some(Outcome::Accepted)
    }

    /// Clears counters and running moments. A soft reset keeps the mode and
    /// the history, a hard reset drops both. Neither moves the chain or
    /// touches the proposal.
    pub fn reset(&mut self, hard: bool) {
        self.stats.reset(hard);
        if hard {
            self.history.clear();
        }
        self.last_outcome = None;
        self.run_accepted = 0;
        self.run_rejected = 0;
    }

    /// Moves the chain to `point` without counting an iteration. The point
    /// joins mixture component 0.
    pub fn set_point(&mut self, point: &[f64]) -> Result<()> {
        self.set_state(State::new(point.to_vec(), f64::NAN))
    }

    /// Like [`MarkovChain::set_point`] but keeps the component of `state`.
    /// Its log density is re-evaluated.
    pub fn set_state(&mut self, mut state: State) -> Result<()> {
        let parameters = self.density.parameters();
        if state.point.len() != parameters.len() {
            return Err(Error::Dimension {
                expected: parameters.len(),
                found: state.point.len(),
            });
        }
        if let Some((p, &value)) = parameters
            .iter()
            .zip(&state.point)
            .find(|(p, x)| !p.contains(**x))
        {
            return Err(Error::OutOfBounds {
                name: p.name.clone(),
                value,
                min: p.min,
                max: p.max,
            });
        }

        state.log_density = self.evaluate(&state.point).unwrap_or(f64::NEG_INFINITY);
        self.stats.update_mode(&state.point, state.log_density);
        debug!(
            target: "markov_chain",
            "chain with seed {} moved to {:?} (log density {})",
            self.seed,
            state.point,
            state.log_density
        );
        self.current = state;
        Ok(())
    }

    /// Offers an externally found mode. Returns whether it replaced the
    /// tracked one.
    pub fn set_mode(&mut self, point: &[f64], log_density: f64) -> bool {
        self.stats.update_mode(point, log_density)
    }

    pub fn current_state(&self) -> &State {
        &self.current
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn keep_history(&mut self, keep: bool) {
        self.history.set_keep(keep);
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn density(&self) -> &D {
        &self.density
    }

    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    pub fn proposal_mut(&mut self) -> &mut Proposal {
        &mut self.proposal
    }

    pub fn set_proposal(&mut self, proposal: Proposal) -> Result<()> {
        if proposal.dimension() != self.density.dimension() {
            return Err(Error::Dimension {
                expected: self.density.dimension(),
                found: proposal.dimension(),
            });
        }
        self.proposal = proposal;
        Ok(())
    }

    /// Acceptance rate of the evaluated proposals of the most recent
    /// [`MarkovChain::run`].
    pub fn last_run_efficiency(&self) -> f64 {
        stats::efficiency(self.run_accepted, self.run_rejected)
    }

    /// Adapts the proposal to the last `window` recorded states, driven by
    /// [`MarkovChain::last_run_efficiency`]. Returns whether that efficiency
    /// lies in `[efficiency_min, efficiency_max]`.
    pub fn adapt(&mut self, window: usize, efficiency_min: f64, efficiency_max: f64) -> Result<bool> {
        let efficiency = self.last_run_efficiency();
        self.proposal.adapt(
            self.history.tail(window),
            efficiency,
            efficiency_min,
            efficiency_max,
        )?;
        Ok((efficiency_min..=efficiency_max).contains(&efficiency))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProposalKind;
    use crate::distributions::{IndependentGaussian, ParameterDescription};
    use approx::assert_abs_diff_eq;

    fn gaussian_chain(seed: u64) -> MarkovChain<IndependentGaussian> {
        let proposal =
            Proposal::initial(ProposalKind::MultivariateGaussian, 1.0, &[1.0, 1.0], true).unwrap();
        MarkovChain::new(IndependentGaussian::standard(2, 10.0), proposal, seed).unwrap()
    }

    /// Unit Gaussian that is undefined on a fixed fraction of the box.
    #[derive(Clone)]
    struct Holey {
        inner: IndependentGaussian,
        parameters: Vec<ParameterDescription>,
    }

    impl Density for Holey {
        fn parameters(&self) -> &[ParameterDescription] {
            &self.parameters
        }

        fn log_density(&self, point: &[f64]) -> Option<f64> {
            // the fractional part of a point scaled by 1000 is close to uniform
            let u = (point[0] * 1000.0).rem_euclid(1.0);
            if u < 0.3 {
                None
            } else {
                self.inner.log_density(point)
            }
        }
    }

    #[test]
    fn counters_add_up() {
        let mut chain = gaussian_chain(1);
        chain.run(1000);
        chain.run(234);
        let s = chain.stats();
        assert_eq!(s.iterations_total, 1234);
        assert_eq!(
            s.iterations_accepted + s.iterations_rejected + s.iterations_invalid,
            s.iterations_total
        );
        assert!(chain.last_run_efficiency() > 0.0);
        assert!(s.has_mode());
    }

    #[test]
    fn history_length_matches_iterations() {
        let mut chain = gaussian_chain(2);
        chain.run(10);
        assert!(chain.history().is_empty());
        chain.keep_history(true);
        chain.run(100);
        assert_eq!(chain.history().len(), 100);
        chain.clear_history();
        assert!(chain.history().is_empty());
    }

    #[test]
    fn equal_seeds_reproduce_trajectories() {
        let mut a = gaussian_chain(77);
        let mut b = gaussian_chain(77);
        a.run(500);
        b.run(500);
        assert_eq!(a.current_state(), b.current_state());
        assert_eq!(a.stats(), b.stats());
    }

    #[test]
    fn samples_a_gaussian() {
        let mut chain = gaussian_chain(3);
        chain.run(2000);
        chain.reset(false);
        chain.run(50_000);
        let s = chain.stats();
        for i in 0..2 {
            assert_abs_diff_eq!(s.mean_of_parameters[i], 0.0, epsilon = 0.1);
            assert_abs_diff_eq!(s.variance_of_parameters[i], 1.0, epsilon = 0.1);
        }
    }

    #[test]
    fn invalid_fraction_is_counted_separately() {
        let inner = IndependentGaussian::standard(2, 10.0);
        let density = Holey {
            parameters: inner.parameters().to_vec(),
            inner,
        };
        let proposal =
            Proposal::initial(ProposalKind::MultivariateGaussian, 1.0, &[1.0, 1.0], true).unwrap();
        let mut chain = MarkovChain::new(density, proposal, 5).unwrap();
        chain.run(1000);
        chain.reset(false);
        chain.run(40_000);

        let s = chain.stats();
        let invalid = s.iterations_invalid as f64 / s.iterations_total as f64;
        assert_abs_diff_eq!(invalid, 0.3, epsilon = 0.02);
        assert_abs_diff_eq!(s.mean_of_parameters[1], 0.0, epsilon = 0.1);
        assert_abs_diff_eq!(s.variance_of_parameters[1], 1.0, epsilon = 0.15);
    }

    #[test]
    fn reset_semantics() {
        let mut chain = gaussian_chain(4);
        chain.keep_history(true);
        chain.run(100);
        let position = chain.current_state().clone();
        let mode = chain.stats().mode;

        chain.reset(false);
        assert_eq!(chain.stats().iterations_total, 0);
        assert_eq!(chain.stats().mode, mode);
        assert_eq!(chain.history().len(), 100);
        assert_eq!(chain.current_state(), &position);

        chain.reset(true);
        assert!(!chain.stats().has_mode());
        assert!(chain.history().is_empty());
        assert_eq!(chain.current_state(), &position);
    }

    #[test]
    fn set_point_validates() {
        let mut chain = gaussian_chain(6);
        assert!(matches!(
            chain.set_point(&[0.0]),
            Err(Error::Dimension { expected: 2, found: 1 })
        ));
        assert!(matches!(
            chain.set_point(&[0.0, 11.0]),
            Err(Error::OutOfBounds { .. })
        ));

        chain.set_point(&[0.0, 0.0]).unwrap();
        assert_eq!(chain.current_state().point, vec![0.0, 0.0]);
        assert_abs_diff_eq!(
            chain.current_state().log_density,
            -(2.0 * std::f64::consts::PI).ln(),
            epsilon = 1e-12
        );
        assert_eq!(chain.stats().parameters_at_mode, vec![0.0, 0.0]);
        assert_eq!(chain.stats().iterations_total, 0);
    }

    #[test]
    fn set_mode_keeps_the_better_one() {
        let mut chain = gaussian_chain(8);
        assert!(chain.set_mode(&[0.1, 0.1], 100.0));
        assert!(!chain.set_mode(&[0.2, 0.2], 50.0));
        assert_eq!(chain.stats().parameters_at_mode, vec![0.1, 0.1]);
    }

    #[test]
    fn adapt_reports_the_efficiency_band() {
        let mut chain = gaussian_chain(9);
        chain.keep_history(true);
        chain.run(1000);
        let efficiency = chain.last_run_efficiency();
        assert!(chain.adapt(1000, 0.0, 1.0).unwrap());
        assert!(!chain.adapt(1000, efficiency + 0.01, 1.0).unwrap());
        let adapted = match chain.proposal().dump_state() {
            crate::proposal::ProposalState::Multivariate(s) => s.adaptations,
            _ => unreachable!(),
        };
        assert_eq!(adapted, 1);
    }

    #[test]
    fn proposal_dimension_must_match() {
        let proposal =
            Proposal::initial(ProposalKind::MultivariateGaussian, 1.0, &[1.0], true).unwrap();
        assert!(MarkovChain::new(IndependentGaussian::standard(2, 10.0), proposal, 0).is_err());
    }
}
