/*!
# Global-local proposal

Combines the outcome of several independent preruns into one proposal that
can move between well separated modes.

Chains whose samples agree (pairwise R-values below
[`GlobalLocalConfig::clustering_maximum_r_value`]) are grouped into clusters.
Every cluster becomes one mixture component with

- a local multivariate proposal, fitted to the pooled samples of its chains,
- a mode, the best mode any of its chains found,
- a probability, from the relative height of its mode.

Each [`State`] carries the index of the component it belongs to. A move is
either local (probability [`GlobalLocalConfig::local_jump_probability`]), drawn
from the current component's proposal, or a jump to a different component `b`,
picked with probability `w_b / (1 - w_a)`, which translates the point by
`mode_b - mode_a`. Jumps are asymmetric whenever the weights differ, so the
chain applies the full Metropolis-Hastings correction.
*/

use log::{debug, info, warn};
use rand::Rng;

use crate::core::State;
use crate::error::{Error, RangeError, Result};
use crate::proposal::{Proposal, ProposalFunction, ProposalState, WindowFingerprint};
use crate::stats::{RValueDefinition, RValues};

/// Settings of the global-local synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalLocalConfig {
    pub clustering_maximum_r_value: f64,
    pub clustering_strict_r_value: bool,
    pub perform_clustering: bool,
    pub equal_weight_components: bool,
    /// Truncate every chain of a cluster to the shortest one before pooling.
    pub join_chains_symmetrically: bool,
    /// Components lighter than this fraction of the heaviest one are dropped.
    pub minimum_relative_cluster_weight: f64,
    pub rescale_local_covariance: f64,
    pub skip_initial: f64,
    pub cooling_power: f64,
    pub local_jump_probability: f64,
}

impl Default for GlobalLocalConfig {
    fn default() -> Self {
        Self {
            clustering_maximum_r_value: 1.1,
            clustering_strict_r_value: false,
            perform_clustering: true,
            equal_weight_components: false,
            join_chains_symmetrically: true,
            minimum_relative_cluster_weight: 1e-3,
            rescale_local_covariance: 1.0,
            skip_initial: 0.1,
            cooling_power: 0.5,
            local_jump_probability: 0.5,
        }
    }
}

impl GlobalLocalConfig {
    pub fn validate(&self) -> Result<()> {
        RangeError::check(
            "clustering_maximum_r_value",
            self.clustering_maximum_r_value,
            1.0,
            f64::MAX,
        )?;
        RangeError::check(
            "minimum_relative_cluster_weight",
            self.minimum_relative_cluster_weight,
            0.0,
            1.0,
        )?;
        RangeError::check(
            "rescale_local_covariance",
            self.rescale_local_covariance,
            f64::MIN_POSITIVE,
            f64::MAX,
        )?;
        RangeError::check("skip_initial", self.skip_initial, 0.0, 1.0 - f64::EPSILON)?;
        RangeError::check("cooling_power", self.cooling_power, 0.0, f64::MAX)?;
        RangeError::check(
            "local_jump_probability",
            self.local_jump_probability,
            0.0,
            1.0,
        )?;
        Ok(())
    }
}

/// What a finished prerun leaves behind for one chain.
#[derive(Debug, Clone)]
pub struct PrerunChain {
    pub samples: Vec<State>,
    pub proposal: Proposal,
    pub mode: State,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub probability: f64,
    pub mode: State,
    pub local: Proposal,
}

/// Persistable state of one component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentState {
    pub probability: f64,
    pub mode: State,
    pub proposal: ProposalState,
}

/// Persistable state of a [`GlobalLocal`] proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalLocalState {
    pub components: Vec<ComponentState>,
    pub local_jump_probability: f64,
    pub cooling_power: f64,
    pub adaptations: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalLocal {
    components: Vec<Component>,
    local_jump_probability: f64,
    cooling_power: f64,
    adaptations: u32,
    last_window: Option<WindowFingerprint>,
}

impl GlobalLocal {
    /// Assembles a proposal from ready-made components. Probabilities are
    /// normalized; local proposals must be multivariate and share one
    /// dimension.
    pub fn new(
        mut components: Vec<Component>,
        local_jump_probability: f64,
        cooling_power: f64,
    ) -> Result<Self> {
        let Some(first) = components.first() else {
            return Err(Error::Adaptation(
                "a global-local proposal needs at least one component".to_string(),
            ));
        };
        RangeError::check(
            "local_jump_probability",
            local_jump_probability,
            0.0,
            1.0,
        )?;
        let dimension = first.local.dimension();
        for c in &components {
            if c.local.multivariate().is_none() {
                return Err(Error::Adaptation(
                    "local proposals of a global-local proposal must be multivariate".to_string(),
                ));
            }
            for found in [c.local.dimension(), c.mode.dimension()] {
                if found != dimension {
                    return Err(Error::Dimension {
                        expected: dimension,
                        found,
                    });
                }
            }
        }

        let total: f64 = components.iter().map(|c| c.probability).sum();
        if !(total > 0.0) || components.iter().any(|c| !(c.probability >= 0.0)) {
            return Err(Error::Adaptation(format!(
                "invalid component probabilities, sum = {total}"
            )));
        }
        for (i, c) in components.iter_mut().enumerate() {
            c.probability /= total;
            c.mode.component = i;
        }

        Ok(Self {
            components,
            local_jump_probability,
            cooling_power,
            adaptations: 0,
            last_window: None,
        })
    }

    /// Clusters the chains, fits one local proposal per cluster and weighs
    /// the clusters by the height of their modes.
    pub fn synthesize(chains: &[PrerunChain], config: &GlobalLocalConfig) -> Result<Self> {
        config.validate()?;
        if chains.is_empty() {
            return Err(Error::Adaptation("no prerun chains to synthesize from".to_string()));
        }

        let windows: Vec<&[State]> = chains
            .iter()
            .map(|c| {
                let skip = (config.skip_initial * c.samples.len() as f64) as usize;
                &c.samples[skip.min(c.samples.len())..]
            })
            .collect();

        let clusters = if config.perform_clustering {
            cluster_chains(
                &windows,
                config.clustering_maximum_r_value,
                RValueDefinition::from_strict(config.clustering_strict_r_value),
            )
        } else {
            vec![(0..chains.len()).collect()]
        };
        info!(
            target: "global_local",
            "found {} cluster(s) among {} chain(s): {clusters:?}",
            clusters.len(),
            chains.len()
        );

        let mut components = Vec::with_capacity(clusters.len());
        for members in &clusters {
            components.push(component_from_cluster(chains, &windows, members, config)?);
        }

        let max_mode = components
            .iter()
            .map(|c| c.mode.log_density)
            .fold(f64::NEG_INFINITY, f64::max);
        for c in components.iter_mut() {
            c.probability = if config.equal_weight_components {
                1.0
            } else {
                (c.mode.log_density - max_mode).exp()
            };
        }
        let heaviest = components.iter().map(|c| c.probability).fold(0.0, f64::max);
        let before = components.len();
        components.retain(|c| c.probability >= config.minimum_relative_cluster_weight * heaviest);
        if components.len() < before {
            info!(
                target: "global_local",
                "dropped {} component(s) below relative weight {}",
                before - components.len(),
                config.minimum_relative_cluster_weight
            );
        }

        let result = Self::new(components, config.local_jump_probability, config.cooling_power)?;
        debug!(
            target: "global_local",
            "component probabilities: {:?}",
            result.probabilities()
        );
        Ok(result)
    }

    pub fn restore(state: &GlobalLocalState) -> Result<Self> {
        let components = state
            .components
            .iter()
            .map(|c| {
                Ok(Component {
                    probability: c.probability,
                    mode: c.mode.clone(),
                    local: Proposal::restore(&c.proposal)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut result = Self::new(components, state.local_jump_probability, state.cooling_power)?;
        result.adaptations = state.adaptations;
        Ok(result)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn probabilities(&self) -> Vec<f64> {
        self.components.iter().map(|c| c.probability).collect()
    }

    pub fn adaptations(&self) -> u32 {
        self.adaptations
    }

    /// The best mode of all components, labelled with its component.
    pub fn mode(&self) -> &State {
        self.components
            .iter()
            .map(|c| &c.mode)
            .reduce(|best, m| if m.log_density > best.log_density { m } else { best })
            .unwrap_or(&self.components[0].mode)
    }

    fn component_of(&self, state: &State) -> usize {
        state.component.min(self.components.len() - 1)
    }

    // a single component can only move locally
    fn effective_local_probability(&self) -> f64 {
        if self.components.len() == 1 {
            1.0
        } else {
            self.local_jump_probability
        }
    }
}

/// Groups chains greedily: a chain joins the first cluster all of whose
/// members agree with it, otherwise it opens a new cluster.
pub fn cluster_chains(
    windows: &[&[State]],
    maximum_r_value: f64,
    definition: RValueDefinition,
) -> Vec<Vec<usize>> {
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for chain in 0..windows.len() {
        let joined = clusters.iter_mut().find(|members| {
            members.iter().all(|&other| {
                match RValues::compute(&[windows[other], windows[chain]], definition) {
                    Ok(r) => r.parameters.iter().all(|&v| v < maximum_r_value),
                    Err(e) => {
                        warn!(
                            target: "global_local",
                            "cannot compare chains {other} and {chain}: {e}"
                        );
                        false
                    }
                }
            })
        });
        match joined {
            Some(members) => members.push(chain),
            None => clusters.push(vec![chain]),
        }
    }
    clusters
}

fn component_from_cluster(
    chains: &[PrerunChain],
    windows: &[&[State]],
    members: &[usize],
    config: &GlobalLocalConfig,
) -> Result<Component> {
    let mut pooled: Vec<&[State]> = members.iter().map(|&m| windows[m]).collect();
    if config.join_chains_symmetrically {
        let shortest = pooled.iter().map(|w| w.len()).min().unwrap_or(0);
        for w in pooled.iter_mut() {
            *w = &w[w.len() - shortest..];
        }
    }

    let mut scales = Vec::with_capacity(members.len());
    for &m in members {
        match chains[m].proposal.multivariate() {
            Some(p) => scales.push(p.covariance_scale),
            None => {
                return Err(Error::Adaptation(format!(
                    "chain {m} was not driven by a multivariate proposal"
                )))
            }
        }
    }
    let scale = scales.iter().sum::<f64>() / scales.len() as f64 / config.rescale_local_covariance;

    let mut local = chains[members[0]].proposal.clone();
    local.reset_from_histories(&pooled, scale)?;

    let mode = members
        .iter()
        .map(|&m| &chains[m].mode)
        .reduce(|best, m| if m.log_density > best.log_density { m } else { best })
        .cloned()
        .unwrap_or_else(|| chains[members[0]].mode.clone());

    Ok(Component {
        probability: 0.0,
        mode,
        local,
    })
}

impl ProposalFunction for GlobalLocal {
    fn dimension(&self) -> usize {
        self.components[0].local.dimension()
    }

    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R) -> State {
        let a = self.component_of(current);
        if rng.gen::<f64>() < self.effective_local_probability() {
            let mut candidate = self.components[a].local.propose(current, rng);
            candidate.component = a;
            return candidate;
        }

        // pick b != a with probability w_b / (1 - w_a)
        let others = 1.0 - self.components[a].probability;
        let u = rng.gen::<f64>() * others;
        let mut cumulative = 0.0;
        let mut b = self.components.len() - 1;
        for (i, c) in self.components.iter().enumerate() {
            if i == a {
                continue;
            }
            cumulative += c.probability;
            b = i;
            if u < cumulative {
                break;
            }
        }
        if b == a {
            b = if a == 0 { 1 } else { 0 };
        }

        let from = &self.components[a].mode.point;
        let to = &self.components[b].mode.point;
        let point = current
            .point
            .iter()
            .zip(from.iter().zip(to))
            .map(|(x, (f, t))| x + t - f)
            .collect();
        State {
            point,
            log_density: f64::NAN,
            component: b,
        }
    }

    fn evaluate(&self, x: &State, y: &State) -> f64 {
        let hx = self.component_of(x);
        let hy = self.component_of(y);
        let p_local = self.effective_local_probability();
        if hx == hy {
            p_local.ln() + self.components[hy].local.evaluate(x, y)
        } else {
            let w_x = self.components[hx].probability;
            let w_y = self.components[hy].probability;
            (1.0 - p_local).ln() + (w_x / (1.0 - w_y)).ln()
        }
    }

    /// Moves the component probabilities towards the component frequencies in
    /// `window`, regardless of the efficiency.
    fn adapt(
        &mut self,
        window: &[State],
        _efficiency: f64,
        _efficiency_min: f64,
        _efficiency_max: f64,
    ) -> Result<()> {
        let fingerprint = WindowFingerprint::of(window);
        if fingerprint.is_none() || fingerprint == self.last_window {
            return Ok(());
        }

        let mut counts = vec![0usize; self.components.len()];
        for s in window {
            counts[self.component_of(s)] += 1;
        }

        // the first adaptation counts as 1, not 0
        self.adaptations += 1;
        let weight = 1.0 / ((self.adaptations + 1) as f64).powf(self.cooling_power);
        let n = window.len() as f64;
        for (c, count) in self.components.iter_mut().zip(counts) {
            c.probability = (1.0 - weight) * c.probability + weight * count as f64 / n;
        }
        self.last_window = fingerprint;
        debug!(
            target: "global_local",
            "new component probabilities: {:?}",
            self.probabilities()
        );
        Ok(())
    }

    fn is_symmetric(&self) -> bool {
        false
    }

    fn dump_state(&self) -> ProposalState {
        ProposalState::GlobalLocal(GlobalLocalState {
            components: self
                .components
                .iter()
                .map(|c| ComponentState {
                    probability: c.probability,
                    mode: c.mode.clone(),
                    proposal: c.local.dump_state(),
                })
                .collect(),
            local_jump_probability: self.local_jump_probability,
            cooling_power: self.cooling_power,
            adaptations: self.adaptations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProposalKind;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn blob(center: &[f64], n: usize, seed: u64) -> Vec<State> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n)
            .map(|_| {
                let point: Vec<f64> = center.iter().map(|c| c + normal.sample(&mut rng)).collect();
                let lp = -0.5
                    * point
                        .iter()
                        .zip(center)
                        .map(|(x, c)| (x - c) * (x - c))
                        .sum::<f64>();
                State::new(point, lp)
            })
            .collect()
    }

    fn prerun(center: &[f64], height: f64, seed: u64) -> PrerunChain {
        let proposal =
            Proposal::initial(ProposalKind::MultivariateGaussian, 1.0, &[1.0, 1.0], true).unwrap();
        PrerunChain {
            samples: blob(center, 2000, seed),
            proposal,
            mode: State::new(center.to_vec(), height),
        }
    }

    fn two_modes() -> GlobalLocal {
        let chains = vec![
            prerun(&[-5.0, 0.0], 0.0, 1),
            prerun(&[5.0, 0.0], 0.0, 2),
            prerun(&[-5.0, 0.0], -0.1, 3),
        ];
        GlobalLocal::synthesize(&chains, &GlobalLocalConfig::default()).unwrap()
    }

    #[test]
    fn clustering_separates_far_modes() {
        let gl = two_modes();
        assert_eq!(gl.components().len(), 2);
        assert_eq!(gl.components()[0].mode.point, vec![-5.0, 0.0]);
        assert_eq!(gl.components()[1].mode.point, vec![5.0, 0.0]);
        assert_abs_diff_eq!(gl.probabilities()[0], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn without_clustering_everything_is_one_component() {
        let chains = vec![prerun(&[-5.0, 0.0], 0.0, 1), prerun(&[5.0, 0.0], 0.0, 2)];
        let config = GlobalLocalConfig {
            perform_clustering: false,
            ..GlobalLocalConfig::default()
        };
        let gl = GlobalLocal::synthesize(&chains, &config).unwrap();
        assert_eq!(gl.components().len(), 1);
        assert_abs_diff_eq!(gl.probabilities()[0], 1.0);
    }

    #[test]
    fn weights_follow_mode_heights_and_light_components_are_dropped() {
        let chains = vec![prerun(&[-5.0, 0.0], 0.0, 1), prerun(&[5.0, 0.0], -2.0, 2)];
        let gl = GlobalLocal::synthesize(&chains, &GlobalLocalConfig::default()).unwrap();
        let expected = 1.0 / (1.0 + (-2.0f64).exp());
        assert_abs_diff_eq!(gl.probabilities()[0], expected, epsilon = 1e-12);

        let config = GlobalLocalConfig {
            minimum_relative_cluster_weight: 0.5,
            ..GlobalLocalConfig::default()
        };
        let gl = GlobalLocal::synthesize(&chains, &config).unwrap();
        assert_eq!(gl.components().len(), 1);
        assert_eq!(gl.mode().point, vec![-5.0, 0.0]);
    }

    #[test]
    fn jumps_land_on_the_other_mode() {
        let gl = two_modes();
        let mut rng = SmallRng::seed_from_u64(11);
        let mut current = State::new(vec![-4.5, 0.3], -0.1);
        current.component = 0;
        let mut jumps = 0;
        for _ in 0..1000 {
            let candidate = gl.propose(&current, &mut rng);
            if candidate.component == 1 {
                jumps += 1;
                assert_abs_diff_eq!(candidate.point[0], 5.5, epsilon = 1e-12);
                assert_abs_diff_eq!(candidate.point[1], 0.3, epsilon = 1e-12);
                let forward = gl.evaluate(&candidate, &current);
                assert_abs_diff_eq!(forward, 0.5f64.ln(), epsilon = 1e-12);
            } else {
                assert_eq!(candidate.component, 0);
            }
        }
        assert!((400..600).contains(&jumps), "{jumps} jumps");
        assert!(!gl.is_symmetric());
    }

    #[test]
    fn adaptation_tracks_component_frequencies() {
        let mut gl = two_modes();
        let window: Vec<State> = (0..100)
            .map(|i| State {
                point: vec![0.0, 0.0],
                log_density: -(i as f64),
                component: 0,
            })
            .collect();
        gl.adapt(&window, 0.25, 0.15, 0.35).unwrap();
        let w = 1.0 / 2.0f64.sqrt();
        assert_abs_diff_eq!(gl.probabilities()[0], (1.0 - w) * 0.5 + w, epsilon = 1e-12);
        let once = gl.probabilities();
        gl.adapt(&window, 0.25, 0.15, 0.35).unwrap();
        assert_eq!(gl.probabilities(), once);
        assert_eq!(gl.adaptations(), 1);
    }

    #[test]
    fn restores_from_dumped_state() {
        let gl = two_modes();
        let ProposalState::GlobalLocal(state) = gl.dump_state() else {
            panic!("expected global-local state");
        };
        let restored = GlobalLocal::restore(&state).unwrap();
        assert_eq!(restored.dump_state(), gl.dump_state());
        let x = State::new(vec![-4.0, 1.0], 0.0);
        let y = State::new(vec![-5.0, 0.0], 0.0);
        assert_abs_diff_eq!(restored.evaluate(&x, &y), gl.evaluate(&x, &y), epsilon = 1e-12);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = GlobalLocalConfig {
            local_jump_probability: 1.5,
            ..GlobalLocalConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Range(_))));
    }
}
