/*!
# Multi-chain sampler

[`MarkovChainSampler`] owns `number_of_chains` [`MarkovChain`]s and drives them
through two phases:

1. **Prerun**: batches of `prerun_iterations_update` iterations per chain.
   After every batch each chain adapts its proposal to its latest batch, and
   the R-values over all chains (burn-in removed) are compared against the
   configured thresholds. The prerun ends once it converged and ran at least
   `prerun_iterations_min` iterations, or after `prerun_iterations_max`.
2. **Main run**: `chunks` chunks of `chunk_size` iterations per chain, flushed
   to the store after every chunk. Proposals stay frozen except during the
   first `adapt_iterations` iterations.

Chains run on the sampler's [`Executor`]; every batch is a barrier, and all
cross-chain work (R-values, persistence bookkeeping) happens between batches.

```rust
use mcmc_sampler::config::Config;
use mcmc_sampler::distributions::IndependentGaussian;
use mcmc_sampler::sampler::MarkovChainSampler;

let config = Config {
    number_of_chains: 2,
    seed: 7,
    need_prerun: false,
    chunks: 2,
    chunk_size: 500,
    store: false,
    ..Config::default()
};
let mut sampler = MarkovChainSampler::new(IndependentGaussian::standard(2, 10.0), config).unwrap();
let (_, main) = sampler.run().unwrap();
assert_eq!(main.unwrap().iterations_per_chain, 1000);
```
*/

use log::{debug, info, warn};

use crate::config::Config;
use crate::core::{ChainProgress, Executor, State};
use crate::distributions::{Density, ParameterDescription};
use crate::error::{Error, Result};
use crate::global_local::{GlobalLocal, GlobalLocalConfig, PrerunChain};
use crate::io::store::{chain_group, description_group, Store};
use crate::markov_chain::MarkovChain;
use crate::mode_finding::{
    unique_modes, ModeFindingReport, NelderMead, OptimizationOptions, Optimizer, Optimum,
};
use crate::proposal::{Proposal, ProposalFunction, ProposalState};
use crate::stats::{RValueDefinition, RValues};

pub const PRERUN: &str = "prerun";
pub const MAIN_RUN: &str = "main run";
pub const GLOBAL_LOCAL: &str = "global local";

/// Where the sampler is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Constructed,
    PreRun,
    MainRun,
    Done,
}

/// Outcome of the prerun. Not converging is a result, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct PreRunInfo {
    pub converged: bool,
    /// Iterations per chain.
    pub iterations: usize,
    /// Iterations per chain when the criterion was last met after failing.
    pub iterations_at_convergence: Option<usize>,
    /// `f64::MAX` until R-values could be computed.
    pub rvalue_parameters: Vec<f64>,
    pub rvalue_posterior: f64,
}

impl PreRunInfo {
    fn new(dimension: usize) -> Self {
        Self {
            converged: false,
            iterations: 0,
            iterations_at_convergence: None,
            rvalue_parameters: vec![f64::MAX; dimension],
            rvalue_posterior: f64::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MainRunInfo {
    pub chunks: usize,
    pub iterations_per_chain: usize,
    /// Parameter R-values of the last chunk; `f64::MAX` with a single chain.
    pub rvalue_parameters: Vec<f64>,
    /// Efficiency of every chain in the last chunk.
    pub efficiencies: Vec<f64>,
}

pub struct MarkovChainSampler<D: Density> {
    density: D,
    config: Config,
    chains: Vec<MarkovChain<D>>,
    executor: Executor,
    store: Option<Store>,
    phase: Phase,
    pre_run_info: PreRunInfo,
    // last mode written per chain, so that modes are only recorded on change
    stored_modes: Vec<f64>,
}

fn same_parameters(a: &[ParameterDescription], b: &[ParameterDescription]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.name == y.name && x.min == y.min && x.max == y.max && x.nuisance == y.nuisance
        })
}

fn resume_error(e: Error) -> Error {
    match e {
        Error::Store(msg) => Error::Resume(msg),
        other => other,
    }
}

impl<D: Density> MarkovChainSampler<D> {
    /// Validates `config` and sets up the chains on a worker pool (or the
    /// calling thread, without `parallelize`).
    pub fn new(density: D, config: Config) -> Result<Self> {
        config.validate()?;
        let executor = Executor::new(config.parallelize)?;
        Self::with_executor(density, config, executor)
    }

    /// Like [`MarkovChainSampler::new`] with an explicit executor.
    pub fn with_executor(density: D, config: Config, executor: Executor) -> Result<Self> {
        config.validate()?;

        let store = match (&config.output_file, config.store || config.store_prerun) {
            (Some(path), true) => Some(Store::create(path)?),
            _ => None,
        };

        let reduction = config.scale_reduction * config.scale_reduction;
        let variances: Vec<f64> = density
            .parameters()
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let variance = density.prior_variance(i);
                if !p.nuisance || config.scale_nuisance {
                    variance / reduction
                } else {
                    variance
                }
            })
            .collect();
        let proposal = Proposal::initial(
            config.proposal,
            config.student_t_degrees_of_freedom,
            &variances,
            config.scale_automatic,
        )?;

        let chains = (0..config.number_of_chains)
            .map(|k| {
                MarkovChain::new(
                    density.clone(),
                    proposal.clone(),
                    config.seed.wrapping_add(k as u64),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            target: "markov_chain_sampler",
            "{} chain(s) with {} proposal in {} dimension(s), executor: {}",
            chains.len(),
            proposal.name(),
            density.dimension(),
            if executor.is_parallel() { "pool" } else { "sequential" }
        );

        Ok(Self {
            pre_run_info: PreRunInfo::new(density.dimension()),
            stored_modes: vec![f64::NEG_INFINITY; chains.len()],
            density,
            config,
            chains,
            executor,
            store,
            phase: Phase::Constructed,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn chains(&self) -> &[MarkovChain<D>] {
        &self.chains
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }

    pub fn pre_run_info(&self) -> &PreRunInfo {
        &self.pre_run_info
    }

    /// Prerun (if configured), mode finding (if configured) and main run (if
    /// configured).
    pub fn run(&mut self) -> Result<(PreRunInfo, Option<MainRunInfo>)> {
        if self.config.need_prerun {
            self.pre_run()?;
        }
        if self.config.find_modes {
            let options = OptimizationOptions {
                mcmc_pre_run: false,
                ..OptimizationOptions::default()
            };
            self.massive_mode_finding(&NelderMead, &options)?;
        }
        let main = if self.config.need_main_run {
            Some(self.main_run()?)
        } else {
            None
        };
        self.phase = Phase::Done;
        Ok((self.pre_run_info.clone(), main))
    }

    fn write_descriptions(&self, group: &str) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let priors: Vec<String> = (0..self.density.dimension())
            .map(|i| self.density.prior_description(i))
            .collect();
        store.write_descriptions(
            group,
            self.density.parameters(),
            &priors,
            &self.density.constraints(),
        )
    }

    fn write_chain_descriptions(&self, phase: &str) -> Result<()> {
        for k in 0..self.chains.len() {
            self.write_descriptions(&description_group(phase, k))?;
        }
        Ok(())
    }

    /// Appends the last `window` recorded states of every chain.
    fn flush_samples(&mut self, phase: &str, window: usize) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let parameters = self.density.parameters();
        self.executor
            .map(&mut self.chains, |k, chain| {
                store.append_samples(
                    &format!("{}/samples", chain_group(phase, k)),
                    parameters,
                    chain.history().tail(window),
                )
            })
            .into_iter()
            .collect()
    }

    /// Records every chain's mode that changed since it was last recorded.
    fn flush_modes(&mut self, phase: &str) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        for (k, chain) in self.chains.iter().enumerate() {
            let stats = chain.stats();
            if stats.has_mode() && stats.mode != self.stored_modes[k] {
                store.append_samples(
                    &format!("{}/stats/mode", chain_group(phase, k)),
                    self.density.parameters(),
                    &[State::new(stats.parameters_at_mode.clone(), stats.mode)],
                )?;
                self.stored_modes[k] = stats.mode;
            }
        }
        Ok(())
    }

    fn flush_proposals(&self, phase: &str) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        for (k, chain) in self.chains.iter().enumerate() {
            store.append_proposal(
                &format!("{}/proposal", chain_group(phase, k)),
                &chain.proposal().dump_state(),
            )?;
        }
        Ok(())
    }

    /// Adapts every chain to its last `window` states. Returns whether every
    /// chain's efficiency was inside the band.
    fn adapt_chains(&mut self, window: usize) -> Result<bool> {
        let (min, max) = (self.config.min_efficiency, self.config.max_efficiency);
        let in_band = self
            .executor
            .map(&mut self.chains, |_, chain| chain.adapt(window, min, max))
            .into_iter()
            .collect::<Result<Vec<bool>>>()?;
        Ok(in_band.iter().all(|&ok| ok))
    }

    /// R-values over the recorded histories after dropping `skip_initial`.
    fn rvalues(&self, skip_initial: f64) -> Result<RValues> {
        let windows: Vec<&[State]> = self
            .chains
            .iter()
            .map(|c| c.history().after_skip(skip_initial))
            .collect();
        RValues::compute(
            &windows,
            RValueDefinition::from_strict(self.config.use_strict_rvalue_definition),
        )
    }

    /// Checks the R-value criterion and records the values in the prerun
    /// info. A single chain always passes.
    fn rvalues_converged(&mut self) -> Result<bool> {
        if self.chains.len() < 2 {
            return Ok(true);
        }
        let r = match self.rvalues(self.config.skip_initial) {
            Ok(r) => r,
            Err(Error::RValue(msg)) => {
                debug!(target: "markov_chain_sampler::prerun", "no R-values yet: {msg}");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let parameters_ok = r
            .parameters
            .iter()
            .all(|&v| v <= self.config.rvalue_criterion_param);
        let posterior_ok =
            !self.config.use_posterior_rvalue || r.posterior <= self.config.rvalue_criterion_posterior;
        for (p, v) in self.density.parameters().iter().zip(&r.parameters) {
            debug!(target: "markov_chain_sampler::prerun", "R-value of {}: {v}", p.name);
        }
        debug!(target: "markov_chain_sampler::prerun", "R-value of posterior: {}", r.posterior);

        self.pre_run_info.rvalue_parameters = r.parameters;
        self.pre_run_info.rvalue_posterior = r.posterior;
        Ok(parameters_ok && posterior_ok)
    }

    /**
    Runs the prerun until convergence or until `prerun_iterations_max`.

    Converged means every chain's efficiency of the latest batch lies in
    `[min_efficiency, max_efficiency]` and all R-values are below their
    thresholds. Histories are dropped at the end; the adapted proposals stay.
    */
    pub fn pre_run(&mut self) -> Result<PreRunInfo> {
        self.phase = Phase::PreRun;
        let update = self.config.prerun_iterations_update;
        let (min, max) = (
            self.config.prerun_iterations_min,
            self.config.prerun_iterations_max,
        );
        info!(
            target: "markov_chain_sampler::prerun",
            "starting prerun with {} chain(s), between {min} and {max} iterations",
            self.chains.len()
        );
        if self.chains.len() < 2 {
            warn!(
                target: "markov_chain_sampler::prerun",
                "R-values are undefined for a single chain, convergence only checks efficiencies"
            );
        }

        self.pre_run_info = PreRunInfo::new(self.density.dimension());
        self.stored_modes = vec![f64::NEG_INFINITY; self.chains.len()];
        if self.config.store_prerun {
            self.write_chain_descriptions(PRERUN)?;
        }
        for chain in self.chains.iter_mut() {
            chain.keep_history(true);
            chain.clear_history();
        }

        let progress = ChainProgress::new(
            self.chains.len(),
            max as u64,
            PRERUN,
            self.config.show_progress,
        );
        let mut iterations = 0;
        let mut converged = false;
        while iterations < min || (!converged && iterations < max) {
            self.executor
                .for_each(&mut self.chains, |_, chain| chain.run(update));
            iterations += update;
            progress.inc_all(update as u64);

            if self.config.store_prerun {
                self.flush_samples(PRERUN, update)?;
            }

            let efficiencies_ok = self.adapt_chains(update)?;
            let rvalues_ok = self.rvalues_converged()?;
            if efficiencies_ok && rvalues_ok && !converged {
                self.pre_run_info.iterations_at_convergence = Some(iterations);
            }
            converged = efficiencies_ok && rvalues_ok;
            for (k, chain) in self.chains.iter().enumerate() {
                progress.set_message(k, format!("efficiency {:.3}", chain.last_run_efficiency()));
            }
            debug!(
                target: "markov_chain_sampler::prerun",
                "{iterations} iterations: efficiencies ok = {efficiencies_ok}, R-values ok = {rvalues_ok}"
            );

            if self.config.store_prerun {
                self.flush_proposals(PRERUN)?;
                self.flush_modes(PRERUN)?;
            }
        }
        progress.finish("done");

        self.pre_run_info.converged = converged;
        self.pre_run_info.iterations = iterations;
        if converged {
            info!(
                target: "markov_chain_sampler::prerun",
                "prerun converged after {iterations} iterations per chain"
            );
        } else {
            self.pre_run_info.iterations_at_convergence = None;
            warn!(
                target: "markov_chain_sampler::prerun",
                "prerun did not converge within {max} iterations per chain"
            );
        }

        for chain in self.chains.iter_mut() {
            chain.clear_history();
            chain.reset(false);
        }
        Ok(self.pre_run_info.clone())
    }

    /// Runs `chunks` chunks of `chunk_size` iterations per chain.
    pub fn main_run(&mut self) -> Result<MainRunInfo> {
        self.run_main(self.config.adapt_iterations)
    }

    fn run_main(&mut self, adapt_iterations: usize) -> Result<MainRunInfo> {
        self.phase = Phase::MainRun;
        let (chunks, chunk_size) = (self.config.chunks, self.config.chunk_size);
        info!(
            target: "markov_chain_sampler::main_run",
            "starting main run: {chunks} chunk(s) of {chunk_size} iterations"
        );

        self.stored_modes = vec![f64::NEG_INFINITY; self.chains.len()];
        if self.config.store {
            self.write_chain_descriptions(MAIN_RUN)?;
        }
        for chain in self.chains.iter_mut() {
            chain.keep_history(true);
            chain.clear_history();
        }

        let progress = ChainProgress::new(
            self.chains.len(),
            (chunks * chunk_size) as u64,
            MAIN_RUN,
            self.config.show_progress,
        );
        let mut rvalue_parameters = vec![f64::MAX; self.density.dimension()];
        let mut efficiencies = Vec::new();
        for chunk in 0..chunks {
            self.executor
                .for_each(&mut self.chains, |_, chain| chain.run(chunk_size));
            progress.inc_all(chunk_size as u64);
            info!(
                target: "markov_chain_sampler::main_run",
                "chunk {}/{chunks} done",
                chunk + 1
            );

            if self.config.store {
                self.flush_samples(MAIN_RUN, chunk_size)?;
                self.flush_modes(MAIN_RUN)?;
            }

            if chunk + 1 == chunks && self.chains.len() > 1 {
                match self.rvalues(0.0) {
                    Ok(r) => {
                        info!(
                            target: "markov_chain_sampler::main_run",
                            "R-values of the last chunk: {:?}, posterior: {}",
                            r.parameters,
                            r.posterior
                        );
                        rvalue_parameters = r.parameters;
                    }
                    Err(e) => warn!(target: "markov_chain_sampler::main_run", "{e}"),
                }
            }

            efficiencies = self
                .chains
                .iter()
                .map(|c| c.last_run_efficiency())
                .collect();
            debug!(
                target: "markov_chain_sampler::main_run",
                "efficiencies: {efficiencies:?}"
            );

            if (chunk + 1) * chunk_size <= adapt_iterations {
                self.adapt_chains(chunk_size)?;
            }
            for chain in self.chains.iter_mut() {
                chain.clear_history();
            }
        }
        progress.finish("done");
        self.phase = Phase::Done;

        Ok(MainRunInfo {
            chunks,
            iterations_per_chain: chunks * chunk_size,
            rvalue_parameters,
            efficiencies,
        })
    }

    /**
    Maximizes the density from every chain's mode (or current point, if it
    has none) and moves chains to better optima.

    Failed optimizations are logged and skipped. With
    `options.mcmc_pre_run` the prerun is performed first.
    */
    pub fn massive_mode_finding<O: Optimizer>(
        &mut self,
        optimizer: &O,
        options: &OptimizationOptions,
    ) -> Result<ModeFindingReport> {
        options.validate()?;
        if options.mcmc_pre_run {
            self.pre_run()?;
        }
        info!(
            target: "markov_chain_sampler::mode_finding",
            "optimizing from {} chain(s)",
            self.chains.len()
        );

        let results: Vec<Result<Optimum>> = self.executor.map(&mut self.chains, |_, chain| {
            let stats = chain.stats();
            let start = if stats.has_mode() {
                stats.parameters_at_mode.clone()
            } else {
                chain.current_state().point.clone()
            };
            let optimum = optimizer.maximize(chain.density(), &start, options)?;
            if !chain.stats().has_mode() || optimum.log_density > chain.stats().mode {
                chain.set_point(&optimum.point)?;
                chain.set_mode(&optimum.point, optimum.log_density);
            }
            Ok(optimum)
        });

        let mut failures = 0;
        let optima: Vec<Option<Optimum>> = results
            .into_iter()
            .enumerate()
            .map(|(k, result)| match result {
                Ok(optimum) => Some(optimum),
                Err(e) => {
                    failures += 1;
                    warn!(
                        target: "markov_chain_sampler::mode_finding",
                        "optimization from chain {k} failed: {e}"
                    );
                    None
                }
            })
            .collect();

        if self.config.store_prerun {
            self.flush_modes(PRERUN)?;
        }

        let found: Vec<(usize, &[f64])> = optima
            .iter()
            .enumerate()
            .filter_map(|(k, o)| o.as_ref().map(|o| (k, o.point.as_slice())))
            .collect();
        let points: Vec<&[f64]> = found.iter().map(|(_, p)| *p).collect();
        let groups: Vec<Vec<usize>> = unique_modes(
            self.density.parameters(),
            &points,
            options.splitting_tolerance,
        )
        .into_iter()
        .map(|g| g.into_iter().map(|i| found[i].0).collect())
        .collect();
        info!(
            target: "markov_chain_sampler::mode_finding",
            "found {} unique mode(s), {failures} optimization(s) failed",
            groups.len()
        );

        Ok(ModeFindingReport {
            optima,
            unique_modes: groups,
            failures,
        })
    }

    fn check_descriptions(&self, source: &Store, group: &str) -> Result<()> {
        let stored = source.read_parameters(group).map_err(resume_error)?;
        if !same_parameters(&stored, self.density.parameters()) {
            return Err(Error::Resume(format!(
                "parameters in {group} do not match the density"
            )));
        }
        Ok(())
    }

    /**
    Restores every chain to the last point, proposal and mode of the prerun
    stored in `source`.

    # Errors

    [`Error::Resume`] if the stored parameters differ from the density's, if
    the number of stored chains differs from `number_of_chains` or if any
    required record is missing.
    */
    pub fn restore_prerun(&mut self, source: &Store) -> Result<()> {
        self.check_descriptions(source, &description_group(PRERUN, 0))?;
        let stored_chains = source.chain_count(PRERUN);
        if stored_chains != self.chains.len() {
            return Err(Error::Resume(format!(
                "{stored_chains} stored chain(s), but {} configured",
                self.chains.len()
            )));
        }

        for (k, chain) in self.chains.iter_mut().enumerate() {
            let group = chain_group(PRERUN, k);
            let point = source
                .read_last_sample(&format!("{group}/samples"))
                .map_err(resume_error)?;
            let proposal = source
                .read_last_proposal(&format!("{group}/proposal"))
                .map_err(resume_error)?;
            let mode = source
                .read_last_sample(&format!("{group}/stats/mode"))
                .map_err(resume_error)?;

            chain.set_proposal(Proposal::restore(&proposal)?)?;
            chain.reset(true);
            chain.set_point(&point.point)?;
            chain.set_mode(&mode.point, mode.log_density);
        }
        info!(
            target: "markov_chain_sampler::resume",
            "resumed {} chain(s) from {}",
            self.chains.len(),
            source.root().display()
        );
        Ok(())
    }

    /// [`restore_prerun`](Self::restore_prerun) followed by the main run with
    /// frozen proposals.
    pub fn resume(&mut self, source: &Store) -> Result<MainRunInfo> {
        self.restore_prerun(source)?;
        if self.config.adapt_iterations > 0 {
            warn!(
                target: "markov_chain_sampler::resume",
                "adapt_iterations = {} is ignored when resuming from a prerun",
                self.config.adapt_iterations
            );
        }
        self.run_main(0)
    }

    /// Starts every chain at the global mode of the global-local proposal
    /// stored in `source` and runs the main run with it.
    pub fn resume_global_local(&mut self, source: &Store) -> Result<MainRunInfo> {
        self.check_descriptions(source, &format!("/descriptions/{GLOBAL_LOCAL}"))?;
        let state = source
            .read_last_proposal(&format!("/{GLOBAL_LOCAL}"))
            .map_err(resume_error)?;
        let ProposalState::GlobalLocal(state) = state else {
            return Err(Error::Resume(format!(
                "/{GLOBAL_LOCAL} does not hold a global-local proposal"
            )));
        };
        let proposal = GlobalLocal::restore(&state)?;
        let mode = proposal.mode().clone();
        info!(
            target: "markov_chain_sampler::resume",
            "starting {} chain(s) from global mode {:?} with {} component(s)",
            self.chains.len(),
            mode.point,
            proposal.components().len()
        );

        for chain in self.chains.iter_mut() {
            chain.set_proposal(Proposal::GlobalLocal(Box::new(proposal.clone())))?;
            chain.reset(true);
            chain.set_state(mode.clone())?;
        }
        self.run_main(self.config.adapt_iterations)
    }
}

/**
Synthesizes a global-local proposal from the stored preruns of `inputs` and
writes it, with the parameter descriptions, to `output`.

Every input must hold `/prerun/chain #k/{samples, proposal, stats/mode}` and
describe the same parameters.
*/
pub fn build_global_local(
    inputs: &[Store],
    output: &Store,
    config: &GlobalLocalConfig,
) -> Result<GlobalLocal> {
    let first = inputs
        .first()
        .ok_or_else(|| Error::Resume("no input stores".to_string()))?;
    let reference = description_group(PRERUN, 0);
    let parameters = first.read_parameters(&reference).map_err(resume_error)?;
    let priors = first.read_priors(&reference).map_err(resume_error)?;
    let constraints = first.read_constraints(&reference).map_err(resume_error)?;

    let mut chains = Vec::new();
    for input in inputs {
        let n_chains = input.chain_count(PRERUN);
        if n_chains == 0 {
            return Err(Error::Resume(format!(
                "no prerun chains in {}",
                input.root().display()
            )));
        }
        for k in 0..n_chains {
            let described = input
                .read_parameters(&description_group(PRERUN, k))
                .map_err(resume_error)?;
            if !same_parameters(&described, &parameters) {
                return Err(Error::Resume(format!(
                    "chain {k} of {} describes different parameters",
                    input.root().display()
                )));
            }
            let group = chain_group(PRERUN, k);
            let samples = input
                .read_samples(&format!("{group}/samples"))
                .map_err(resume_error)?;
            let proposal = input
                .read_last_proposal(&format!("{group}/proposal"))
                .map_err(resume_error)?;
            let mode = input
                .read_last_sample(&format!("{group}/stats/mode"))
                .map_err(resume_error)?;
            chains.push(PrerunChain {
                samples,
                proposal: Proposal::restore(&proposal)?,
                mode,
            });
        }
    }
    info!(
        target: "markov_chain_sampler::global_local",
        "synthesizing global-local proposal from {} chain(s) in {} store(s)",
        chains.len(),
        inputs.len()
    );

    let proposal = GlobalLocal::synthesize(&chains, config)?;
    output.append_proposal(&format!("/{GLOBAL_LOCAL}"), &proposal.dump_state())?;
    output.write_descriptions(
        &format!("/descriptions/{GLOBAL_LOCAL}"),
        &parameters,
        &priors,
        &constraints,
    )?;
    Ok(proposal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::IndependentGaussian;
    use tempfile::tempdir;

    fn quiet(config: Config) -> Config {
        Config {
            store: false,
            store_prerun: false,
            ..config
        }
    }

    fn sampler(config: Config) -> MarkovChainSampler<IndependentGaussian> {
        MarkovChainSampler::with_executor(
            IndependentGaussian::standard(2, 10.0),
            config,
            Executor::Sequential,
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = quiet(Config {
            max_efficiency: 23.1,
            ..Config::default()
        });
        assert!(matches!(
            MarkovChainSampler::new(IndependentGaussian::standard(2, 10.0), config),
            Err(Error::Range(_))
        ));
        assert!(matches!(
            MarkovChainSampler::new(IndependentGaussian::standard(2, 10.0), Config::default()),
            Err(Error::MissingOutput)
        ));
    }

    #[test]
    fn chains_are_seeded_from_config() {
        let s = sampler(quiet(Config {
            number_of_chains: 3,
            seed: 10,
            ..Config::default()
        }));
        let seeds: Vec<u64> = s.chains().iter().map(|c| c.seed()).collect();
        assert_eq!(seeds, vec![10, 11, 12]);
        assert_eq!(s.phase(), Phase::Constructed);
    }

    #[test]
    fn scale_reduction_shrinks_the_initial_proposal() {
        let s = sampler(quiet(Config {
            scale_reduction: 2.0,
            scale_automatic: false,
            ..Config::default()
        }));
        let covariance = s.chains()[0].proposal().multivariate().unwrap().covariance().clone();
        // flat prior on [-10, 10]: 400 / 12, reduced by 2²
        assert!((covariance[(0, 0)] - 400.0 / 12.0 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn prerun_converges_on_a_gaussian() {
        let mut s = sampler(quiet(Config {
            number_of_chains: 3,
            seed: 3,
            prerun_iterations_update: 1000,
            prerun_iterations_min: 2000,
            prerun_iterations_max: 100_000,
            need_main_run: false,
            ..Config::default()
        }));
        let info = s.pre_run().unwrap();
        assert!(info.converged, "{info:?}");
        assert!(info.iterations >= 2000);
        assert!(info.iterations_at_convergence.is_some());
        assert!(info.rvalue_parameters.iter().all(|&r| r <= 1.1));
        for chain in s.chains() {
            assert!(chain.history().is_empty());
            assert_eq!(chain.stats().iterations_total, 0);
            assert!(chain.stats().has_mode());
        }
    }

    #[test]
    fn exhausted_prerun_is_not_an_error() {
        let mut s = sampler(quiet(Config {
            number_of_chains: 2,
            prerun_iterations_update: 100,
            prerun_iterations_min: 100,
            prerun_iterations_max: 200,
            // unreachable band
            min_efficiency: 0.99,
            max_efficiency: 1.0,
            need_main_run: false,
            ..Config::default()
        }));
        let (info, main) = s.run().unwrap();
        assert!(!info.converged);
        assert_eq!(info.iterations, 200);
        assert!(main.is_none());
        assert_eq!(s.phase(), Phase::Done);
    }

    #[test]
    fn main_run_reports_every_chain() {
        let mut s = sampler(quiet(Config {
            number_of_chains: 2,
            need_prerun: false,
            chunks: 3,
            chunk_size: 200,
            ..Config::default()
        }));
        let info = s.main_run().unwrap();
        assert_eq!(info.iterations_per_chain, 600);
        assert_eq!(info.efficiencies.len(), 2);
        assert_eq!(info.rvalue_parameters.len(), 2);
        for chain in s.chains() {
            assert_eq!(chain.stats().iterations_total, 600);
        }
    }

    #[test]
    fn mode_finding_moves_chains_to_the_mode() {
        let mut s = sampler(quiet(Config {
            number_of_chains: 2,
            ..Config::default()
        }));
        let options = OptimizationOptions {
            mcmc_pre_run: false,
            ..OptimizationOptions::default()
        };
        let report = s.massive_mode_finding(&NelderMead, &options).unwrap();
        assert_eq!(report.failures, 0);
        assert_eq!(report.unique_modes, vec![vec![0, 1]]);
        for chain in s.chains() {
            assert!(chain.current_state().point.iter().all(|x| x.abs() < 5e-2));
        }
    }

    #[test]
    fn resume_rejects_mismatched_stores() {
        let dir = tempdir().unwrap();
        let source = Store::create(dir.path().join("source")).unwrap();
        let parameters = vec![ParameterDescription::new("other", 0.0, 1.0)];
        source
            .write_descriptions(&description_group(PRERUN, 0), &parameters, &["flat".to_string()], &[])
            .unwrap();
        let mut s = sampler(quiet(Config::default()));
        assert!(matches!(s.resume(&source), Err(Error::Resume(_))));

        let empty = Store::create(dir.path().join("empty")).unwrap();
        assert!(matches!(s.resume(&empty), Err(Error::Resume(_))));
    }
}
