//! Resuming from persisted preruns.
//!
//! 1. `test_resume_restores_prerun`: a stored prerun is restored by a fresh
//!    sampler, which must pick up the tuned proposals, points and modes
//!    exactly, and then resumed into a main run.
//! 2. `test_global_local_end_to_end`: a bimodal prerun is merged into a
//!    global-local proposal, whose chains then visit both modes.

use mcmc_sampler::config::{Config, ProposalKind};
use mcmc_sampler::core::State;
use mcmc_sampler::distributions::{Density, GaussianMixture, IndependentGaussian, ParameterDescription};
use mcmc_sampler::global_local::GlobalLocalConfig;
use mcmc_sampler::io::store::{chain_group, description_group, Store};
use mcmc_sampler::proposal::{Proposal, ProposalFunction};
use mcmc_sampler::sampler::{build_global_local, MarkovChainSampler, MAIN_RUN, PRERUN};
use rand::{rngs::SmallRng, SeedableRng};
use rand_distr::{Distribution, Normal};

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    #[test]
    fn test_resume_restores_prerun() {
        let dir = tempdir().unwrap();
        let target = IndependentGaussian::new(vec![2.0, -1.0], vec![0.5, 2.0], 10.0);

        let prerun_config = Config {
            number_of_chains: 3,
            seed: 31,
            prerun_iterations_update: 500,
            prerun_iterations_min: 1500,
            prerun_iterations_max: 20_000,
            need_main_run: false,
            store: false,
            store_prerun: true,
            ..Config::default()
        }
        .with_output_file(dir.path().join("prerun"));
        let mut first = MarkovChainSampler::new(target.clone(), prerun_config).unwrap();
        let (info, main) = first.run().unwrap();
        assert!(info.converged, "{info:?}");
        assert!(main.is_none());

        let source = Store::open(dir.path().join("prerun")).unwrap();
        let resume_config = Config {
            number_of_chains: 3,
            seed: 1000,
            need_prerun: false,
            chunks: 2,
            chunk_size: 1000,
            ..Config::default()
        }
        .with_output_file(dir.path().join("main"));

        let unstored = Config {
            store: false,
            ..resume_config.clone()
        };
        let mut restored = MarkovChainSampler::new(target.clone(), unstored).unwrap();
        restored.restore_prerun(&source).unwrap();
        for (a, b) in first.chains().iter().zip(restored.chains()) {
            assert_eq!(a.current_state().point, b.current_state().point);
            assert_eq!(a.proposal().dump_state(), b.proposal().dump_state());
            assert_eq!(a.stats().mode, b.stats().mode);
            assert_eq!(a.stats().parameters_at_mode, b.stats().parameters_at_mode);
        }

        let mut second = MarkovChainSampler::new(target, resume_config).unwrap();
        let main = second.resume(&source).unwrap();
        assert_eq!(main.iterations_per_chain, 2000);

        for (a, b) in first.chains().iter().zip(second.chains()) {
            // proposals stay frozen after a resume
            assert_eq!(
                a.proposal().multivariate().unwrap().covariance(),
                b.proposal().multivariate().unwrap().covariance()
            );
            assert_eq!(a.proposal().dump_state(), b.proposal().dump_state());
            assert!(b.stats().mode >= a.stats().mode);
        }

        let output = Store::open(dir.path().join("main")).unwrap();
        for k in 0..3 {
            let samples = output
                .read_samples(&format!("{}/samples", chain_group(MAIN_RUN, k)))
                .unwrap();
            assert_eq!(samples.len(), 2000);
        }
    }

    #[test]
    fn test_resume_with_different_chain_count_fails() {
        let dir = tempdir().unwrap();
        let target = IndependentGaussian::standard(2, 10.0);
        let config = Config {
            number_of_chains: 2,
            prerun_iterations_update: 200,
            prerun_iterations_min: 200,
            prerun_iterations_max: 400,
            need_main_run: false,
            store: false,
            store_prerun: true,
            ..Config::default()
        }
        .with_output_file(dir.path().join("prerun"));
        MarkovChainSampler::new(target.clone(), config)
            .unwrap()
            .run()
            .unwrap();

        let source = Store::open(dir.path().join("prerun")).unwrap();
        let config = Config {
            number_of_chains: 3,
            store: false,
            ..Config::default()
        };
        let mut sampler = MarkovChainSampler::new(target, config).unwrap();
        assert!(matches!(
            sampler.resume(&source),
            Err(mcmc_sampler::error::Error::Resume(_))
        ));
    }

    /// Writes a fake prerun of `chains` chains, each sampled around `center`.
    fn write_prerun(store: &Store, target: &GaussianMixture, centers: &[[f64; 2]], seed: u64) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let parameters = target.parameters();
        let priors: Vec<String> = (0..2).map(|i| target.prior_description(i)).collect();
        let proposal =
            Proposal::initial(ProposalKind::MultivariateGaussian, 1.0, &[1.0, 1.0], true).unwrap();

        for (k, center) in centers.iter().enumerate() {
            store
                .write_descriptions(&description_group(PRERUN, k), parameters, &priors, &[])
                .unwrap();
            let samples: Vec<State> = (0..2000)
                .map(|_| {
                    let point: Vec<f64> = center.iter().map(|c| c + normal.sample(&mut rng)).collect();
                    let lp = target.log_density(&point).unwrap();
                    State::new(point, lp)
                })
                .collect();
            let group = chain_group(PRERUN, k);
            store
                .append_samples(&format!("{group}/samples"), parameters, &samples)
                .unwrap();
            store
                .append_proposal(&format!("{group}/proposal"), &proposal.dump_state())
                .unwrap();
            let mode = State::new(center.to_vec(), target.log_density(center).unwrap());
            store
                .append_samples(&format!("{group}/stats/mode"), parameters, &[mode])
                .unwrap();
        }
    }

    #[test]
    fn test_global_local_end_to_end() {
        let dir = tempdir().unwrap();
        let parameters = vec![
            ParameterDescription::new("x", -10.0, 10.0),
            ParameterDescription::new("y", -10.0, 10.0),
        ];
        let target = GaussianMixture::new(vec![vec![-4.0, 0.0], vec![4.0, 0.0]], 1.0, parameters);

        let input = Store::create(dir.path().join("prerun")).unwrap();
        write_prerun(
            &input,
            &target,
            &[[-4.0, 0.0], [4.0, 0.0], [-4.0, 0.0], [4.0, 0.0]],
            3,
        );
        let gl_store = Store::create(dir.path().join("global local")).unwrap();
        let proposal =
            build_global_local(&[input], &gl_store, &GlobalLocalConfig::default()).unwrap();

        assert_eq!(proposal.components().len(), 2);
        for p in proposal.probabilities() {
            assert_abs_diff_eq!(p, 0.5, epsilon = 1e-12);
        }
        let mut centers: Vec<f64> = proposal
            .components()
            .iter()
            .map(|c| c.mode.point[0])
            .collect();
        centers.sort_by(f64::total_cmp);
        assert_eq!(centers, vec![-4.0, 4.0]);

        let config = Config {
            number_of_chains: 2,
            seed: 8,
            need_prerun: false,
            chunks: 5,
            chunk_size: 2000,
            ..Config::default()
        }
        .with_output_file(dir.path().join("main"));
        let mut sampler = MarkovChainSampler::new(target, config).unwrap();
        let main = sampler.resume_global_local(&gl_store).unwrap();
        assert_eq!(main.iterations_per_chain, 10_000);

        let output = Store::open(dir.path().join("main")).unwrap();
        for k in 0..2 {
            let samples = output
                .read_samples(&format!("{}/samples", chain_group(MAIN_RUN, k)))
                .unwrap();
            assert_eq!(samples.len(), 10_000);
            let left = samples.iter().filter(|s| s.point[0] < 0.0).count() as f64;
            let fraction = left / samples.len() as f64;
            assert!((0.3..=0.7).contains(&fraction), "left fraction {fraction}");
        }
    }
}
