//! Parallel multi-chain Metropolis-Hastings sampling with adaptive proposals.
//!
//! The entry point is [`sampler::MarkovChainSampler`]: it runs a prerun that
//! tunes every chain's proposal until the chains agree (R-value), then a main
//! run whose samples go to a [`io::store::Store`]. Stored preruns can be
//! resumed or merged into a [`global_local::GlobalLocal`] proposal for
//! multimodal targets.
//!
//! The library logs through the `log` facade and never installs a logger.

pub mod config;
pub mod core;
pub mod distributions;
pub mod error;
pub mod global_local;
pub mod io;
pub mod markov_chain;
pub mod mode_finding;
pub mod proposal;
pub mod sampler;
pub mod stats;
