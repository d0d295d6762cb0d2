//! Tunable parameters of [`MarkovChainSampler`](crate::sampler::MarkovChainSampler).
//!
//! A [`Config`] is a plain bag of public fields. It is checked once, when the
//! sampler is constructed, and every numeric field outside of its range is
//! reported as a [`RangeError`]. Values are never clamped.
//!
//! ```rust
//! use mcmc_sampler::config::{Config, ProposalKind};
//!
//! let mut config = Config::quick();
//! config.proposal = ProposalKind::MultivariateStudentT;
//! config.store = false;
//! assert!(config.validate().is_ok());
//!
//! config.min_efficiency = -0.1;
//! assert!(config.validate().is_err());
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use log::warn;

use crate::error::{Error, RangeError, Result};

/// Proposal family used by every chain of a sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalKind {
    MultivariateGaussian,
    MultivariateStudentT,
}

impl ProposalKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProposalKind::MultivariateGaussian => "MultivariateGaussian",
            ProposalKind::MultivariateStudentT => "MultivariateStudentT",
        }
    }

    /// Like [`FromStr`], but unknown names fall back to the Gaussian proposal.
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!(
                target: "markov_chain_sampler::config",
                "unknown proposal '{name}', falling back to MultivariateGaussian"
            );
            ProposalKind::MultivariateGaussian
        })
    }
}

impl fmt::Display for ProposalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProposalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MultivariateGaussian" => Ok(ProposalKind::MultivariateGaussian),
            "MultivariateStudentT" => Ok(ProposalKind::MultivariateStudentT),
            other => Err(format!("unknown proposal '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // execution shape
    pub number_of_chains: usize,
    pub seed: u64,
    pub parallelize: bool,

    // adaptation band
    pub min_efficiency: f64,
    pub max_efficiency: f64,

    // convergence policy
    pub rvalue_criterion_param: f64,
    pub rvalue_criterion_posterior: f64,
    pub use_strict_rvalue_definition: bool,
    pub use_posterior_rvalue: bool,

    // initial proposal scaling
    pub scale_automatic: bool,
    pub scale_nuisance: bool,
    pub scale_reduction: f64,

    // prerun
    pub find_modes: bool,
    pub need_prerun: bool,
    pub prerun_iterations_update: usize,
    pub prerun_iterations_min: usize,
    pub prerun_iterations_max: usize,
    pub proposal: ProposalKind,
    pub student_t_degrees_of_freedom: f64,
    pub store_prerun: bool,

    // main run
    pub adapt_iterations: usize,
    pub chunks: usize,
    pub chunk_size: usize,
    pub need_main_run: bool,
    pub skip_initial: f64,
    pub store: bool,

    /// Root directory of the persisted store.
    pub output_file: Option<PathBuf>,

    /// Draw one progress bar per chain on the terminal.
    pub show_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            number_of_chains: 3,
            seed: 0,
            parallelize: true,
            min_efficiency: 0.15,
            max_efficiency: 0.35,
            rvalue_criterion_param: 1.1,
            rvalue_criterion_posterior: 1.1,
            use_strict_rvalue_definition: true,
            use_posterior_rvalue: false,
            scale_automatic: true,
            scale_nuisance: true,
            scale_reduction: 1.0,
            find_modes: false,
            need_prerun: true,
            prerun_iterations_update: 1000,
            prerun_iterations_min: 1000,
            prerun_iterations_max: 1_000_000,
            proposal: ProposalKind::MultivariateGaussian,
            student_t_degrees_of_freedom: 1.0,
            store_prerun: false,
            adapt_iterations: 0,
            chunks: 100,
            chunk_size: 1000,
            need_main_run: true,
            skip_initial: 0.1,
            store: true,
            output_file: None,
            show_progress: false,
        }
    }
}

impl Config {
    /// Settings for a fast, rough run: one chain, relaxed R-value and short
    /// prerun and main run.
    pub fn quick() -> Self {
        Self {
            number_of_chains: 1,
            use_strict_rvalue_definition: false,
            prerun_iterations_max: 100_000,
            prerun_iterations_update: 400,
            chunks: 10,
            chunk_size: 100,
            ..Self::default()
        }
    }

    /// Sets the output directory and returns the modified config.
    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::Range`] naming the first field outside of its range and
    /// [`Error::MissingOutput`] if samples are to be stored without an output.
    pub fn validate(&self) -> Result<()> {
        let max = f64::MAX;
        RangeError::check("number_of_chains", self.number_of_chains as f64, 1.0, max)?;
        RangeError::check("min_efficiency", self.min_efficiency, 0.0, 1.0)?;
        RangeError::check("max_efficiency", self.max_efficiency, self.min_efficiency, 1.0)?;
        RangeError::check("rvalue_criterion_param", self.rvalue_criterion_param, 1.0, 100.0)?;
        RangeError::check(
            "rvalue_criterion_posterior",
            self.rvalue_criterion_posterior,
            1.0,
            100.0,
        )?;
        RangeError::check("scale_reduction", self.scale_reduction, 1.0, max)?;
        RangeError::check(
            "prerun_iterations_update",
            self.prerun_iterations_update as f64,
            2.0,
            max,
        )?;
        RangeError::check(
            "prerun_iterations_min",
            self.prerun_iterations_min as f64,
            1.0,
            max,
        )?;
        RangeError::check(
            "prerun_iterations_max",
            self.prerun_iterations_max as f64,
            self.prerun_iterations_min as f64,
            max,
        )?;
        RangeError::check(
            "student_t_degrees_of_freedom",
            self.student_t_degrees_of_freedom,
            f64::EPSILON,
            max,
        )?;
        RangeError::check("chunks", self.chunks as f64, 1.0, max)?;
        RangeError::check("chunk_size", self.chunk_size as f64, 1.0, max)?;
        if self.adapt_iterations > 0 {
            // adapting needs at least two states per chunk
            RangeError::check("chunk_size", self.chunk_size as f64, 2.0, max)?;
        }
        // skip_initial = 1 would leave no samples for the R-values
        RangeError::check("skip_initial", self.skip_initial, 0.0, 1.0 - f64::EPSILON)?;

        if (self.store || self.store_prerun) && self.output_file.is_none() {
            return Err(Error::MissingOutput);
        }
        Ok(())
    }
}
