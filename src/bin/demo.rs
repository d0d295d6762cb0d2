//! Samples an uncorrelated 2D Gaussian with a prerun and a short main run, then
//! prints what the chains saw.

use std::error::Error;

use mcmc_sampler::config::Config;
use mcmc_sampler::distributions::IndependentGaussian;
use mcmc_sampler::sampler::MarkovChainSampler;

fn main() -> Result<(), Box<dyn Error>> {
    let target = IndependentGaussian::new(vec![1.0, -2.0], vec![1.0, 0.5], 10.0);
    let config = Config {
        number_of_chains: 4,
        seed: 42,
        prerun_iterations_update: 1000,
        prerun_iterations_min: 2000,
        prerun_iterations_max: 50_000,
        chunks: 10,
        chunk_size: 2000,
        store: false,
        show_progress: true,
        ..Config::default()
    };

    let mut sampler = MarkovChainSampler::new(target, config)?;
    let (prerun, main) = sampler.run()?;

    println!(
        "Prerun: converged = {}, {} iterations per chain, R-values {:?}",
        prerun.converged, prerun.iterations, prerun.rvalue_parameters
    );
    if let Some(main) = main {
        println!(
            "Main run: {} iterations per chain, R-values {:?}, efficiencies {:?}",
            main.iterations_per_chain, main.rvalue_parameters, main.efficiencies
        );
    }

    for (k, chain) in sampler.chains().iter().enumerate() {
        let stats = chain.stats();
        println!(
            "Chain {k}: mean ({:.3}, {:.3}), variance ({:.3}, {:.3}), mode {:.4} at ({:.3}, {:.3})",
            stats.mean_of_parameters[0],
            stats.mean_of_parameters[1],
            stats.variance_of_parameters[0],
            stats.variance_of_parameters[1],
            stats.mode,
            stats.parameters_at_mode[0],
            stats.parameters_at_mode[1],
        );
    }
    Ok(())
}
